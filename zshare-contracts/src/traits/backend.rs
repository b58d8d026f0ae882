// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;

use zshare_types::{ActualState, DatasetKey, ExportBinding};

use crate::{BackendError, Outcome};

/// Storage backend primitives the reconciler drives.
///
/// Every mutation must be safe to repeat: re-issuing an operation whose effect
/// is already present returns [`Outcome::Unchanged`] rather than an error.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Short identifier used in logs ("zfs", "dry-run", ...).
    fn name(&self) -> &'static str;

    async fn create_pool(&self, name: &str, vdevs: &[String]) -> Result<Outcome, BackendError>;

    async fn destroy_pool(&self, name: &str) -> Result<Outcome, BackendError>;

    async fn create_dataset(&self, dataset: &DatasetKey) -> Result<Outcome, BackendError>;

    async fn destroy_dataset(&self, dataset: &DatasetKey) -> Result<Outcome, BackendError>;

    async fn bind_export(
        &self,
        dataset: &DatasetKey,
        binding: &ExportBinding,
    ) -> Result<Outcome, BackendError>;

    async fn unbind_export(
        &self,
        dataset: &DatasetKey,
        export_name: &str,
    ) -> Result<Outcome, BackendError>;

    /// Full scan of the backend. Not meant for the per-event path.
    async fn list_actual_state(&self) -> Result<ActualState, BackendError>;
}
