// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

/// Result of an idempotent backend mutation.
///
/// Retrying a mutation that already took effect reports `Unchanged` instead of
/// failing, so the reconciler can re-issue operations after partial failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    /// The target was already in the requested state ("already exists" / "already absent").
    Unchanged,
}

impl Outcome {
    pub fn already_done(self) -> bool {
        self == Self::Unchanged
    }
}
