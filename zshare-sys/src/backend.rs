// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use which::which;

use zshare_contracts::{BackendAdapter, BackendError, Outcome};
use zshare_types::{ActualState, DatasetKey, ExportBinding};

use crate::exports::{EXPORTFS, ExportsDir};
use crate::zfs_tools::{ZFS, ZPOOL, Zfs};
use crate::SysError;

fn outcome(changed: bool) -> Outcome {
    if changed {
        Outcome::Applied
    } else {
        Outcome::Unchanged
    }
}

/// Backend driving ZFS datasets and kernel NFS exports on the local host.
pub struct ZfsBackend {
    zfs: Zfs,
    exports: ExportsDir,
}

impl ZfsBackend {
    /// Build the backend, failing when one of the required tools is not installed.
    pub fn new(exports_dir: impl Into<PathBuf>, command_timeout: Duration) -> crate::Result<Self> {
        for tool in [ZPOOL, ZFS, EXPORTFS] {
            if which(tool).is_err() {
                return Err(SysError::ToolMissing(tool));
            }
        }

        Ok(Self {
            zfs: Zfs::new(command_timeout),
            exports: ExportsDir::new(exports_dir, command_timeout),
        })
    }
}

#[async_trait]
impl BackendAdapter for ZfsBackend {
    fn name(&self) -> &'static str {
        "zfs"
    }

    async fn create_pool(&self, name: &str, vdevs: &[String]) -> Result<Outcome, BackendError> {
        tracing::info!("Ensuring pool {} on {:?}", name, vdevs);
        Ok(outcome(self.zfs.ensure_pool(name, vdevs).await?))
    }

    async fn destroy_pool(&self, name: &str) -> Result<Outcome, BackendError> {
        tracing::info!("Destroying pool {}", name);
        Ok(outcome(self.zfs.destroy_pool(name).await?))
    }

    async fn create_dataset(&self, dataset: &DatasetKey) -> Result<Outcome, BackendError> {
        tracing::info!("Ensuring dataset {}", dataset);
        Ok(outcome(self.zfs.ensure_dataset(dataset).await?))
    }

    async fn destroy_dataset(&self, dataset: &DatasetKey) -> Result<Outcome, BackendError> {
        tracing::info!("Destroying dataset {}", dataset);
        Ok(outcome(self.zfs.destroy_dataset(dataset).await?))
    }

    async fn bind_export(
        &self,
        dataset: &DatasetKey,
        binding: &ExportBinding,
    ) -> Result<Outcome, BackendError> {
        if &binding.dataset != dataset {
            return Err(BackendError::invalid(format!(
                "binding {} belongs to {}, not {}",
                binding.name, binding.dataset, dataset
            )));
        }
        binding.validate().map_err(BackendError::invalid)?;

        let mountpoint = self.zfs.mountpoint(dataset).await?;
        let changed = self.exports.write(binding, &mountpoint).await?;
        if changed {
            self.exports.reload().await?;
            tracing::info!(
                "Exported {} as {} to {}",
                mountpoint,
                binding.name,
                binding.options.client
            );
        }

        Ok(outcome(changed))
    }

    async fn unbind_export(
        &self,
        dataset: &DatasetKey,
        export_name: &str,
    ) -> Result<Outcome, BackendError> {
        let changed = self.exports.remove(dataset, export_name).await?;
        if changed {
            self.exports.reload().await?;
            tracing::info!("Withdrew export {} of {}", export_name, dataset);
        }

        Ok(outcome(changed))
    }

    async fn list_actual_state(&self) -> Result<ActualState, BackendError> {
        let pools = self.zfs.list_pools().await?;
        let datasets = self
            .zfs
            .list_datasets()
            .await?
            .into_iter()
            .map(|listed| listed.key)
            .collect();
        let exports = self.exports.list().await?;

        Ok(ActualState {
            pools,
            datasets,
            exports,
        })
    }
}
