// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use zshare_contracts::{ConfigStore, StoreError};
use zshare_types::{
    DatasetKey, DeclaredConfig, DeclaredPool, DeclaredShare, ExportOptions, validate_export_name,
};

/// Declared share configuration kept in a TOML file:
///
/// ```toml
/// [service]
/// enabled = true
///
/// [[pools]]
/// name = "tank"
/// vdevs = ["/dev/sdb"]
///
/// [[datasets]]
/// name = "tank/media"
///
/// [[shares]]
/// dataset = "tank/media"
/// export = "media"
/// client = "10.0.0.0/24"
/// access = "read_only"
/// ```
pub struct TomlConfigStore {
    path: PathBuf,
}

impl TomlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for TomlConfigStore {
    async fn load_declared(&self) -> Result<DeclaredConfig, StoreError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            StoreError::Unavailable(format!("cannot read {}: {e}", self.path.display()))
        })?;
        parse_declared(&text)
            .map_err(|e| StoreError::Invalid(format!("{}: {e}", self.path.display())))
    }
}

#[derive(Debug, Deserialize)]
struct DeclaredFile {
    #[serde(default)]
    service: ServiceSection,
    #[serde(default)]
    pools: Vec<DeclaredPool>,
    #[serde(default)]
    datasets: Vec<DatasetEntry>,
    #[serde(default)]
    shares: Vec<ShareEntry>,
}

#[derive(Debug, Deserialize)]
struct ServiceSection {
    #[serde(default = "enabled")]
    enabled: bool,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct DatasetEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ShareEntry {
    dataset: String,
    export: String,
    #[serde(flatten)]
    options: ExportOptions,
}

fn dataset_key(name: &str) -> Result<DatasetKey, String> {
    DatasetKey::parse(name).ok_or_else(|| format!("invalid dataset name {name:?}"))
}

/// Parse and validate the declared configuration file contents.
pub fn parse_declared(text: &str) -> Result<DeclaredConfig, String> {
    let file: DeclaredFile = toml::from_str(text).map_err(|e| e.to_string())?;

    let mut pool_names = BTreeSet::new();
    for pool in &file.pools {
        if pool.name.is_empty() || pool.name.contains('/') {
            return Err(format!("invalid pool name {:?}", pool.name));
        }
        if !pool_names.insert(pool.name.as_str()) {
            return Err(format!("pool {} declared twice", pool.name));
        }
    }

    let datasets = file
        .datasets
        .iter()
        .map(|entry| dataset_key(&entry.name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen = BTreeSet::new();
    let mut shares = Vec::with_capacity(file.shares.len());
    for entry in file.shares {
        let dataset = dataset_key(&entry.dataset)?;
        validate_export_name(&entry.export).map_err(|e| format!("share on {dataset}: {e}"))?;
        entry
            .options
            .validate()
            .map_err(|e| format!("export {} on {dataset}: {e}", entry.export))?;
        if !seen.insert((dataset.clone(), entry.export.clone())) {
            return Err(format!("export {} on {dataset} declared twice", entry.export));
        }
        shares.push(DeclaredShare {
            dataset,
            export: entry.export,
            options: entry.options,
        });
    }

    Ok(DeclaredConfig {
        service_enabled: file.service.enabled,
        pools: file.pools,
        datasets,
        shares,
    })
}
