// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid declared configuration: {0}")]
    Invalid(String),
}
