// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for zshare share reconciliation
//!
//! This crate defines the single source of truth for the types exchanged between
//! the reconciliation core, the storage backend adapters and the service surface:
//!
//! - **zshare-reconcile**: keeps pools, datasets and bindings in its model
//! - **zshare-sys**: reports backend state as an [`ActualState`]
//! - **zshare-service**: serializes events and status records for D-Bus transport

pub mod event;
pub mod export;
pub mod pool;
pub mod snapshot;
pub mod status;

pub use event::{ConfigEvent, EventKey, EventKind, EventKindSet, EventPayload};
pub use export::{
    AccessMode, ExportBinding, ExportOptions, ExportOptionsPatch, OptionChange, Squash,
    validate_export_name,
};
pub use pool::{Dataset, DatasetKey, Pool, PoolHealth};
pub use snapshot::{
    ActualExport, ActualPool, ActualState, DeclaredConfig, DeclaredPool, DeclaredShare,
    DriftReport, ExportRef,
};
pub use status::{ErrorClass, ErrorReport, KeyState, KeyStatus};
