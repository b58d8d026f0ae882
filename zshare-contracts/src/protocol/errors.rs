// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    InvalidInput,
    NotFound,
    PermissionDenied,
    Conflict,
    Unsupported,
    Busy,
    Timeout,
    Unavailable,
    Internal,
}

impl BackendErrorKind {
    pub fn code(self) -> u16 {
        match self {
            Self::InvalidInput => 400,
            Self::NotFound => 404,
            Self::PermissionDenied => 403,
            Self::Conflict => 409,
            Self::Unsupported => 501,
            Self::Busy => 423,
            Self::Timeout => 504,
            Self::Unavailable => 503,
            Self::Internal => 500,
        }
    }

    /// Busy, timed out and unavailable backends may succeed when retried.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Busy | Self::Timeout | Self::Unavailable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Busy, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_roundtrips() {
        let error = BackendError::new(BackendErrorKind::Conflict, "already exists");
        let json = serde_json::to_string(&error).expect("serialize error");
        let parsed: BackendError = serde_json::from_str(&json).expect("deserialize error");
        assert_eq!(parsed, error);
    }

    #[test]
    fn only_busy_timeout_unavailable_are_transient() {
        assert!(BackendErrorKind::Busy.is_transient());
        assert!(BackendErrorKind::Timeout.is_transient());
        assert!(BackendErrorKind::Unavailable.is_transient());
        assert!(!BackendErrorKind::InvalidInput.is_transient());
        assert!(!BackendErrorKind::NotFound.is_transient());
        assert!(!BackendErrorKind::Internal.is_transient());
    }

    #[test]
    fn error_kind_http_family_codes_are_stable() {
        assert_eq!(BackendErrorKind::InvalidInput.code(), 400);
        assert_eq!(BackendErrorKind::NotFound.code(), 404);
        assert_eq!(BackendErrorKind::Busy.code(), 423);
        assert_eq!(BackendErrorKind::Timeout.code(), 504);
        assert_eq!(BackendErrorKind::Internal.code(), 500);
    }
}
