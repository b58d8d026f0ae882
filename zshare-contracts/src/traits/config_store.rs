// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;

use zshare_types::DeclaredConfig;

use crate::StoreError;

/// Read-only access to the host's declared share configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_declared(&self) -> Result<DeclaredConfig, StoreError>;
}
