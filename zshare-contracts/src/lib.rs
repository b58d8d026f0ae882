// SPDX-License-Identifier: GPL-3.0-only

pub mod protocol;
pub mod traits;

pub use protocol::{BackendError, BackendErrorKind, Outcome, StoreError};
pub use traits::{BackendAdapter, ConfigStore};
