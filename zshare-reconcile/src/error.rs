// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

use zshare_contracts::{BackendError, StoreError};
use zshare_types::{DatasetKey, ErrorClass, EventKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("dataset not found: {0}")]
    DatasetNotFound(DatasetKey),

    #[error("binding {export} targets {target}, not {dataset}")]
    MismatchedBinding {
        dataset: DatasetKey,
        target: DatasetKey,
        export: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("queue for {key} is full ({capacity} events); retry later")]
    Backpressure { key: EventKey, capacity: usize },

    #[error("event bus is shut down")]
    Closed,
}

/// Errors surfaced by the reconciliation engine, classified per [`ErrorClass`].
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("transient backend error: {0}")]
    TransientBackend(BackendError),

    #[error("permanent backend error: {0}")]
    PermanentBackend(BackendError),

    #[error("dataset {0} is not known yet; binding held until it is created")]
    UnresolvedReference(DatasetKey),

    #[error("stale event for {key}: sequence {sequence} is older than {latest}")]
    StaleEvent {
        key: EventKey,
        sequence: u64,
        latest: u64,
    },

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("configuration store error: {0}")]
    Store(#[from] StoreError),

    #[error("spool I/O error: {0}")]
    Spool(#[from] std::io::Error),

    #[error("shutting down")]
    ShuttingDown,
}

impl From<BackendError> for ReconcileError {
    fn from(err: BackendError) -> Self {
        if err.is_transient() {
            ReconcileError::TransientBackend(err)
        } else {
            ReconcileError::PermanentBackend(err)
        }
    }
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientBackend(_) => ErrorClass::TransientBackend,
            Self::UnresolvedReference(_) => ErrorClass::UnresolvedReference,
            Self::StaleEvent { .. } => ErrorClass::StaleEvent,
            Self::Bus(BusError::Backpressure { .. }) => ErrorClass::Backpressure,
            Self::PermanentBackend(_)
            | Self::Bus(BusError::Closed)
            | Self::Model(_)
            | Self::Store(_)
            | Self::Spool(_)
            | Self::ShuttingDown => ErrorClass::PermanentBackend,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use zshare_contracts::BackendErrorKind;

    #[test]
    fn backend_errors_are_classified_by_kind() {
        let busy: ReconcileError = BackendError::busy("dataset is busy").into();
        assert_eq!(busy.class(), ErrorClass::TransientBackend);

        let invalid: ReconcileError =
            BackendError::new(BackendErrorKind::InvalidInput, "bad option").into();
        assert_eq!(invalid.class(), ErrorClass::PermanentBackend);
    }

    #[test]
    fn backpressure_is_its_own_class() {
        let error = ReconcileError::from(BusError::Backpressure {
            key: EventKey::Service,
            capacity: 4,
        });
        assert_eq!(error.class(), ErrorClass::Backpressure);
    }
}
