// SPDX-License-Identifier: GPL-3.0-only

//! Whole-system views: what the backend actually has, what configuration declares,
//! and the drift between the two.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::export::{ExportBinding, ExportOptions};
use crate::pool::{DatasetKey, PoolHealth};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualPool {
    pub name: String,
    pub health: PoolHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualExport {
    pub dataset: DatasetKey,
    pub name: String,
    pub options: ExportOptions,
}

/// Snapshot of pools, datasets and exports currently present on the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualState {
    pub pools: Vec<ActualPool>,
    pub datasets: BTreeSet<DatasetKey>,
    pub exports: Vec<ActualExport>,
}

impl ActualState {
    pub fn has_pool(&self, name: &str) -> bool {
        self.pools.iter().any(|pool| pool.name == name)
    }

    pub fn exports_of(&self, dataset: &DatasetKey) -> BTreeMap<String, ExportOptions> {
        self.exports
            .iter()
            .filter(|export| &export.dataset == dataset)
            .map(|export| (export.name.clone(), export.options.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredPool {
    pub name: String,
    #[serde(default)]
    pub vdevs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredShare {
    pub dataset: DatasetKey,
    pub export: String,
    pub options: ExportOptions,
}

/// Full declared share configuration as held by the configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredConfig {
    #[serde(default = "default_enabled")]
    pub service_enabled: bool,
    #[serde(default)]
    pub pools: Vec<DeclaredPool>,
    #[serde(default)]
    pub datasets: Vec<DatasetKey>,
    #[serde(default)]
    pub shares: Vec<DeclaredShare>,
}

fn default_enabled() -> bool {
    true
}

impl Default for DeclaredConfig {
    fn default() -> Self {
        Self {
            service_enabled: true,
            pools: Vec::new(),
            datasets: Vec::new(),
            shares: Vec::new(),
        }
    }
}

impl DeclaredConfig {
    /// Every dataset the configuration needs, including those only referenced by shares.
    pub fn dataset_keys(&self) -> BTreeSet<DatasetKey> {
        self.datasets
            .iter()
            .cloned()
            .chain(self.shares.iter().map(|share| share.dataset.clone()))
            .collect()
    }

    /// Every pool referenced, either declared directly or through a dataset.
    pub fn pool_names(&self) -> BTreeSet<String> {
        self.pools
            .iter()
            .map(|pool| pool.name.clone())
            .chain(self.dataset_keys().into_iter().map(|key| key.pool))
            .collect()
    }

    pub fn bindings(&self) -> Vec<ExportBinding> {
        self.shares
            .iter()
            .map(|share| {
                ExportBinding::new(share.dataset.clone(), &share.export, share.options.clone())
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRef {
    pub dataset: DatasetKey,
    pub export: String,
}

/// Differences between declared configuration and the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub missing_datasets: Vec<DatasetKey>,
    pub orphaned_datasets: Vec<DatasetKey>,
    pub missing_exports: Vec<ExportRef>,
    pub orphaned_exports: Vec<ExportRef>,
    pub mismatched_exports: Vec<ExportRef>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing_datasets.is_empty()
            && self.orphaned_datasets.is_empty()
            && self.missing_exports.is_empty()
            && self.orphaned_exports.is_empty()
            && self.mismatched_exports.is_empty()
    }
}
