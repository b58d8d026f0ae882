// SPDX-License-Identifier: GPL-3.0-only

pub mod errors;
pub mod outcome;
pub mod store;

pub use errors::{BackendError, BackendErrorKind};
pub use outcome::Outcome;
pub use store::StoreError;
