// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;
use zshare_contracts::{BackendError, BackendErrorKind};

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on {path:?}: {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("required tool not found: {0}")]
    ToolMissing(&'static str),

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unexpected output: {0}")]
    Parse(String),
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;

/// Classify the stderr of a failed `zfs`/`zpool`/`exportfs` call.
pub fn classify_stderr(stderr: &str) -> BackendErrorKind {
    let stderr = stderr.to_ascii_lowercase();

    if stderr.contains("busy") || stderr.contains("resource temporarily unavailable") {
        BackendErrorKind::Busy
    } else if stderr.contains("does not exist") || stderr.contains("no such pool") {
        BackendErrorKind::NotFound
    } else if stderr.contains("already exists") {
        BackendErrorKind::Conflict
    } else if stderr.contains("permission denied") || stderr.contains("insufficient privileges")
    {
        BackendErrorKind::PermissionDenied
    } else if stderr.contains("invalid") || stderr.contains("bad ") || stderr.contains("usage:") {
        BackendErrorKind::InvalidInput
    } else if stderr.contains("i/o error") || stderr.contains("unavailable") {
        BackendErrorKind::Unavailable
    } else {
        BackendErrorKind::Internal
    }
}

impl From<SysError> for BackendError {
    fn from(err: SysError) -> Self {
        let kind = match &err {
            SysError::Io(_) | SysError::PathIo { .. } => BackendErrorKind::Unavailable,
            SysError::ToolMissing(_) => BackendErrorKind::Unsupported,
            SysError::CommandFailed { stderr, .. } => classify_stderr(stderr),
            SysError::Timeout { .. } => BackendErrorKind::Timeout,
            SysError::InvalidArgument(_) => BackendErrorKind::InvalidInput,
            SysError::Parse(_) => BackendErrorKind::Internal,
        };
        BackendError::new(kind, err.to_string())
    }
}
