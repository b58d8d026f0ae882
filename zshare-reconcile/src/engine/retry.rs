// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter for transient backend failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Attempts per key before it is marked failed, the first one included.
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 30_000,
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Short fixed delays, for tests and dry runs.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            base_ms: delay_ms,
            cap_ms: delay_ms,
            max_attempts,
            jitter: false,
        }
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts.max(1)
    }

    /// Delay before the retry that follows the `failures`-th consecutive failure.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let ceiling = self
            .base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cap_ms.max(self.base_ms));

        let millis = if self.jitter && ceiling > 1 {
            // Equal jitter: half fixed, half random.
            let half = ceiling / 2;
            half + rand::thread_rng().gen_range(0..=ceiling - half)
        } else {
            ceiling
        };

        Duration::from_millis(millis)
    }
}
