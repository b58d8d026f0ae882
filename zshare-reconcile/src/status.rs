// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use zshare_types::{ErrorReport, EventKey, KeyState, KeyStatus};

/// Operator-visible reconciliation state of every key that has seen an event.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<BTreeMap<EventKey, KeyStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, key: &EventKey, apply: impl FnOnce(&mut KeyStatus)) {
        let mut entries = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let status = entries
            .entry(key.clone())
            .or_insert_with(|| KeyStatus::new(key.clone()));
        apply(status);
        status.updated_at = Utc::now();
    }

    pub fn get(&self, key: &EventKey) -> Option<KeyStatus> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<KeyStatus> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn state(&self, key: &EventKey) -> KeyState {
        self.get(key).map(|status| status.state).unwrap_or_default()
    }

    pub fn keys_in(&self, state: KeyState) -> Vec<EventKey> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|status| status.state == state)
            .map(|status| status.key.clone())
            .collect()
    }

    pub fn set_state(&self, key: &EventKey, state: KeyState, attempts: u32) {
        self.update(key, |status| {
            status.state = state;
            status.attempts = attempts;
        });
    }

    pub fn record_sequence(&self, key: &EventKey, sequence: u64) {
        self.update(key, |status| {
            status.last_sequence = Some(status.last_sequence.map_or(sequence, |last| last.max(sequence)));
        });
    }

    pub fn record_error(&self, key: &EventKey, report: ErrorReport) {
        self.update(key, |status| status.last_error = Some(report));
    }

    pub fn clear_error(&self, key: &EventKey) {
        self.update(key, |status| status.last_error = None);
    }

    pub fn forget(&self, key: &EventKey) {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }
}
