// SPDX-License-Identifier: GPL-3.0-only

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use zshare_contracts::{ConfigStore, StoreError};
use zshare_types::DeclaredConfig;

/// Config store serving a configuration held in memory.
#[derive(Clone, Default)]
pub struct StaticConfigStore {
    config: Arc<Mutex<Option<DeclaredConfig>>>,
}

impl StaticConfigStore {
    pub fn new(config: DeclaredConfig) -> Self {
        Self {
            config: Arc::new(Mutex::new(Some(config))),
        }
    }

    /// A store that reports itself unavailable.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn set(&self, config: DeclaredConfig) {
        *self
            .config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(config);
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn load_declared(&self) -> Result<DeclaredConfig, StoreError> {
        self.config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| StoreError::Unavailable("no configuration loaded".to_string()))
    }
}
