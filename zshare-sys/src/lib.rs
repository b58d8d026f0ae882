// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for share reconciliation
//!
//! This crate talks to the host directly:
//! - `zpool`/`zfs` for pools and filesystem datasets
//! - `/etc/exports.d` files and `exportfs` for NFS exports
//!
//! These operations require root and should only be called from the
//! privileged service.

mod command;
pub mod backend;
pub mod error;
pub mod exports;
pub mod zfs_tools;

pub use backend::ZfsBackend;
pub use error::{Result, SysError, classify_stderr};
pub use exports::{DEFAULT_EXPORTS_DIR, ExportsDir};
pub use zfs_tools::{ListedDataset, Zfs};
