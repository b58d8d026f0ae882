// SPDX-License-Identifier: GPL-3.0-only

//! Thin wrappers over the `zpool` and `zfs` command line tools.

use std::time::Duration;

use zshare_types::{ActualPool, DatasetKey, PoolHealth};

use crate::command::run_capture;
use crate::{Result, SysError};

pub const ZPOOL: &str = "zpool";
pub const ZFS: &str = "zfs";

/// A filesystem dataset as listed by `zfs list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedDataset {
    pub key: DatasetKey,
    pub mountpoint: Option<String>,
}

fn parse_zpool_list(output: &str) -> Vec<ActualPool> {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split('\t');
            let name = columns.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let health = columns
                .next()
                .map(PoolHealth::from_zpool_health)
                .unwrap_or_default();
            Some(ActualPool {
                name: name.to_string(),
                health,
            })
        })
        .collect()
}

fn parse_zfs_list(output: &str) -> Result<Vec<ListedDataset>> {
    let mut datasets = Vec::new();

    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let mut columns = line.split('\t');
        let name = columns.next().unwrap_or_default();
        let key = DatasetKey::parse(name)
            .ok_or_else(|| SysError::Parse(format!("bad dataset name in zfs list: {name:?}")))?;

        let mountpoint = columns
            .next()
            .map(str::trim)
            .filter(|value| value.starts_with('/'))
            .map(ToString::to_string);

        datasets.push(ListedDataset { key, mountpoint });
    }

    Ok(datasets)
}

fn is_missing(error: &SysError) -> bool {
    matches!(
        error,
        SysError::CommandFailed { stderr, .. }
            if stderr.contains("does not exist") || stderr.contains("no such pool")
    )
}

fn is_already_present(error: &SysError) -> bool {
    matches!(error, SysError::CommandFailed { stderr, .. } if stderr.contains("already exists"))
}

/// Wraps `zpool`/`zfs` invocations with a per-command time limit.
#[derive(Debug, Clone)]
pub struct Zfs {
    limit: Duration,
}

impl Zfs {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    pub async fn list_pools(&self) -> Result<Vec<ActualPool>> {
        let output = run_capture(ZPOOL, &["list", "-H", "-o", "name,health"], self.limit).await?;
        Ok(parse_zpool_list(&output))
    }

    pub async fn pool_exists(&self, name: &str) -> Result<bool> {
        match run_capture(ZPOOL, &["list", "-H", "-o", "name", name], self.limit).await {
            Ok(_) => Ok(true),
            Err(error) if is_missing(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Create a pool unless one with that name is already imported.
    ///
    /// Returns `false` when the pool already existed.
    pub async fn ensure_pool(&self, name: &str, vdevs: &[String]) -> Result<bool> {
        if self.pool_exists(name).await? {
            return Ok(false);
        }
        if vdevs.is_empty() {
            return Err(SysError::InvalidArgument(format!(
                "pool {name} has no vdevs to create it from"
            )));
        }

        let mut args = vec!["create", name];
        args.extend(vdevs.iter().map(String::as_str));
        match run_capture(ZPOOL, &args, self.limit).await {
            Ok(_) => Ok(true),
            Err(error) if is_already_present(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Returns `false` when there was no pool to destroy.
    pub async fn destroy_pool(&self, name: &str) -> Result<bool> {
        match run_capture(ZPOOL, &["destroy", name], self.limit).await {
            Ok(_) => Ok(true),
            Err(error) if is_missing(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub async fn list_datasets(&self) -> Result<Vec<ListedDataset>> {
        let output = run_capture(
            ZFS,
            &["list", "-H", "-t", "filesystem", "-o", "name,mountpoint"],
            self.limit,
        )
        .await?;
        parse_zfs_list(&output)
    }

    pub async fn dataset_exists(&self, dataset: &DatasetKey) -> Result<bool> {
        let name = dataset.name();
        match run_capture(ZFS, &["list", "-H", "-o", "name", &name], self.limit).await {
            Ok(_) => Ok(true),
            Err(error) if is_missing(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Creates a filesystem dataset (and missing parents) unless it already exists.
    pub async fn ensure_dataset(&self, dataset: &DatasetKey) -> Result<bool> {
        if self.dataset_exists(dataset).await? {
            return Ok(false);
        }

        let name = dataset.name();
        match run_capture(ZFS, &["create", "-p", &name], self.limit).await {
            Ok(_) => Ok(true),
            Err(error) if is_already_present(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub async fn destroy_dataset(&self, dataset: &DatasetKey) -> Result<bool> {
        if dataset.is_pool_root() {
            return Err(SysError::InvalidArgument(format!(
                "refusing to destroy root dataset of pool {}",
                dataset.pool
            )));
        }

        let name = dataset.name();
        match run_capture(ZFS, &["destroy", "-r", &name], self.limit).await {
            Ok(_) => Ok(true),
            Err(error) if is_missing(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub async fn mountpoint(&self, dataset: &DatasetKey) -> Result<String> {
        let name = dataset.name();
        let output = run_capture(
            ZFS,
            &["get", "-H", "-o", "value", "mountpoint", &name],
            self.limit,
        )
        .await?;

        let value = output.trim();
        if !value.starts_with('/') {
            return Err(SysError::InvalidArgument(format!(
                "dataset {name} has no usable mountpoint ({value})"
            )));
        }

        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zpool_list_output() {
        let pools = parse_zpool_list("tank\tONLINE\nbackup\tDEGRADED\n\n");
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].name, "tank");
        assert_eq!(pools[0].health, PoolHealth::Online);
        assert_eq!(pools[1].health, PoolHealth::Degraded);
    }

    #[test]
    fn parses_zfs_list_output() {
        let datasets =
            parse_zfs_list("tank\t/tank\ntank/media\t/srv/media\ntank/vm\tnone\n").unwrap();

        assert_eq!(datasets.len(), 3);
        assert!(datasets[0].key.is_pool_root());
        assert_eq!(datasets[1].key, DatasetKey::new("tank", "media"));
        assert_eq!(datasets[1].mountpoint.as_deref(), Some("/srv/media"));
        assert_eq!(datasets[2].mountpoint, None);
    }

    #[test]
    fn rejects_garbled_dataset_names() {
        assert!(parse_zfs_list("tank//broken\t/x\n").is_err());
    }

    #[test]
    fn recognizes_missing_and_existing_targets() {
        let missing = SysError::CommandFailed {
            command: "zfs destroy -r tank/a".to_string(),
            stderr: "cannot open 'tank/a': dataset does not exist".to_string(),
        };
        let present = SysError::CommandFailed {
            command: "zfs create -p tank/a".to_string(),
            stderr: "cannot create 'tank/a': dataset already exists".to_string(),
        };

        assert!(is_missing(&missing));
        assert!(!is_missing(&present));
        assert!(is_already_present(&present));
    }
}
