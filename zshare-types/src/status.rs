// SPDX-License-Identifier: GPL-3.0-only

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::EventKey;

/// Reconciliation state of a single key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    #[default]
    Idle,
    Applying,
    Retrying,
    Failed,
}

/// Classification of reconciliation errors reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientBackend,
    PermanentBackend,
    UnresolvedReference,
    StaleEvent,
    Backpressure,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientBackend)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Operator-facing status of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatus {
    pub key: EventKey,
    pub state: KeyState,
    pub attempts: u32,
    pub last_error: Option<ErrorReport>,
    pub last_sequence: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl KeyStatus {
    pub fn new(key: EventKey) -> Self {
        Self {
            key,
            state: KeyState::Idle,
            attempts: 0,
            last_error: None,
            last_sequence: None,
            updated_at: Utc::now(),
        }
    }
}
