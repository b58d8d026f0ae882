// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;
use zbus::fdo;

use zshare_reconcile::{BusError, ReconcileError};

/// Service-specific errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Event rejected: {0}")]
    Rejected(#[from] BusError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ServiceError> for fdo::Error {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidArgument(msg) => fdo::Error::InvalidArgs(msg),
            ServiceError::Rejected(BusError::Backpressure { .. }) => {
                fdo::Error::LimitsExceeded(err.to_string())
            }
            _ => fdo::Error::Failed(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
