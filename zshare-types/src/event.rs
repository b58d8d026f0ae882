// SPDX-License-Identifier: GPL-3.0-only

//! Configuration-change events delivered by the host's notification dispatcher.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::export::{ExportOptions, ExportOptionsPatch, validate_export_name};
use crate::pool::DatasetKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ServiceUpdated,
    ShareCreated,
    ShareDeleted,
    ShareUpdated,
    DatasetCreated,
    DatasetDeleted,
    PoolCreated,
    PoolDestroyed,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::ServiceUpdated,
        EventKind::ShareCreated,
        EventKind::ShareDeleted,
        EventKind::ShareUpdated,
        EventKind::DatasetCreated,
        EventKind::DatasetDeleted,
        EventKind::PoolCreated,
        EventKind::PoolDestroyed,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Set of event kinds a subscriber is interested in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventKindSet(u16);

impl EventKindSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        EventKind::ALL.into_iter().collect()
    }

    pub fn with(mut self, kind: EventKind) -> Self {
        self.0 |= kind.bit();
        self
    }

    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<EventKind> for EventKindSet {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

/// Ordering scope of an event. Events sharing a key are delivered in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "id")]
pub enum EventKey {
    Service,
    Pool(String),
    Dataset(DatasetKey),
}

impl EventKey {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value == "service" {
            return Some(Self::Service);
        }
        if let Some(pool) = value.strip_prefix("pool:") {
            return (!pool.is_empty()).then(|| Self::Pool(pool.to_string()));
        }
        let name = value.strip_prefix("dataset:").unwrap_or(value);
        DatasetKey::parse(name).map(Self::Dataset)
    }

    pub fn dataset(&self) -> Option<&DatasetKey> {
        match self {
            Self::Dataset(key) => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => write!(f, "service"),
            Self::Pool(name) => write!(f, "pool:{name}"),
            Self::Dataset(key) => write!(f, "dataset:{key}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventPayload {
    ServiceUpdated {
        enabled: bool,
    },
    ShareCreated {
        dataset: DatasetKey,
        export: String,
        options: ExportOptions,
    },
    ShareDeleted {
        dataset: DatasetKey,
        export: String,
    },
    ShareUpdated {
        dataset: DatasetKey,
        export: String,
        patch: ExportOptionsPatch,
    },
    DatasetCreated {
        dataset: DatasetKey,
    },
    DatasetDeleted {
        dataset: DatasetKey,
    },
    PoolCreated {
        pool: String,
        #[serde(default)]
        vdevs: Vec<String>,
    },
    PoolDestroyed {
        pool: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ServiceUpdated { .. } => EventKind::ServiceUpdated,
            Self::ShareCreated { .. } => EventKind::ShareCreated,
            Self::ShareDeleted { .. } => EventKind::ShareDeleted,
            Self::ShareUpdated { .. } => EventKind::ShareUpdated,
            Self::DatasetCreated { .. } => EventKind::DatasetCreated,
            Self::DatasetDeleted { .. } => EventKind::DatasetDeleted,
            Self::PoolCreated { .. } => EventKind::PoolCreated,
            Self::PoolDestroyed { .. } => EventKind::PoolDestroyed,
        }
    }

    pub fn key(&self) -> EventKey {
        match self {
            Self::ServiceUpdated { .. } => EventKey::Service,
            Self::ShareCreated { dataset, .. }
            | Self::ShareDeleted { dataset, .. }
            | Self::ShareUpdated { dataset, .. }
            | Self::DatasetCreated { dataset }
            | Self::DatasetDeleted { dataset } => EventKey::Dataset(dataset.clone()),
            Self::PoolCreated { pool, .. } | Self::PoolDestroyed { pool } => {
                EventKey::Pool(pool.clone())
            }
        }
    }

    /// Export name for share events; used for per-export sequence tracking.
    pub fn export_name(&self) -> Option<&str> {
        match self {
            Self::ShareCreated { export, .. }
            | Self::ShareDeleted { export, .. }
            | Self::ShareUpdated { export, .. } => Some(export),
            _ => None,
        }
    }

    /// Reject share payloads whose names or options cannot be exported.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::ShareCreated {
                export, options, ..
            } => {
                validate_export_name(export)?;
                options.validate()
            }
            Self::ShareUpdated { export, patch, .. } => {
                validate_export_name(export)?;
                patch.validate()
            }
            Self::ShareDeleted { export, .. } => validate_export_name(export),
            _ => Ok(()),
        }
    }
}

/// A single immutable configuration change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Producer-assigned, monotonically increasing per (dataset, export).
    pub sequence: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl ConfigEvent {
    pub fn new(sequence: u64, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn key(&self) -> EventKey {
        self.payload.key()
    }
}
