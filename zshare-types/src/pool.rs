// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::export::ExportBinding;

/// Health of a storage pool as reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Online,
    Degraded,
    Unavailable,
    #[default]
    Unknown,
}

impl PoolHealth {
    /// Map the `health` column of `zpool list` onto the coarse availability states.
    pub fn from_zpool_health(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => Self::Online,
            "DEGRADED" => Self::Degraded,
            "FAULTED" | "OFFLINE" | "UNAVAIL" | "REMOVED" | "SUSPENDED" => Self::Unavailable,
            _ => Self::Unknown,
        }
    }

    pub fn is_usable(self) -> bool {
        matches!(self, Self::Online | Self::Degraded)
    }
}

/// Identity of a dataset: the owning pool plus the path inside it.
///
/// An empty `path` names the pool's root dataset. The string form is the
/// backend dataset name, e.g. `tank/media/photos`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetKey {
    pub pool: String,
    pub path: String,
}

impl DatasetKey {
    pub fn new(pool: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            path: path.into().trim_matches('/').to_string(),
        }
    }

    /// Parse a full dataset name (`pool/child/grandchild`).
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().trim_matches('/');
        if name.is_empty() {
            return None;
        }

        let (pool, path) = match name.split_once('/') {
            Some((pool, path)) => (pool, path),
            None => (name, ""),
        };

        if pool.is_empty() || path.split('/').any(|segment| segment.is_empty() && !path.is_empty())
        {
            return None;
        }

        Some(Self::new(pool, path))
    }

    pub fn is_pool_root(&self) -> bool {
        self.path.is_empty()
    }

    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.pool)
        } else {
            write!(f, "{}/{}", self.pool, self.path)
        }
    }
}

/// A dataset known to the model together with its declared exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub key: DatasetKey,
    /// Export bindings keyed by export name; the map key enforces one binding per name.
    pub bindings: BTreeMap<String, ExportBinding>,
    /// Logical mutation clock, bumped on every change to this dataset.
    pub revision: u64,
}

impl Dataset {
    pub fn new(key: DatasetKey) -> Self {
        Self {
            key,
            bindings: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn binding(&self, export_name: &str) -> Option<&ExportBinding> {
        self.bindings.get(export_name)
    }
}

/// A storage pool and the datasets it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub health: PoolHealth,
    /// Datasets keyed by their path inside the pool.
    pub datasets: BTreeMap<String, Dataset>,
}

impl Pool {
    pub fn new(name: impl Into<String>, health: PoolHealth) -> Self {
        Self {
            name: name.into(),
            health,
            datasets: BTreeMap::new(),
        }
    }

    pub fn dataset(&self, path: &str) -> Option<&Dataset> {
        self.datasets.get(path)
    }

    pub fn binding_count(&self) -> usize {
        self.datasets
            .values()
            .map(|dataset| dataset.bindings.len())
            .sum()
    }
}
