// SPDX-License-Identifier: GPL-3.0-only

//! Backend that only logs what it would do.
//!
//! It keeps an in-memory copy of the state it would have produced so repeated
//! operations report [`Outcome::Unchanged`] just like a real backend. It does
//! not check that a dataset's pool exists.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use zshare_contracts::{BackendAdapter, BackendError, Outcome};
use zshare_types::{ActualExport, ActualPool, ActualState, DatasetKey, ExportBinding, PoolHealth};

#[derive(Debug, Default)]
pub struct DryRunBackend {
    state: Mutex<ActualState>,
    mutations: AtomicUsize,
}

fn outcome(changed: bool) -> Outcome {
    if changed {
        Outcome::Applied
    } else {
        Outcome::Unchanged
    }
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing view, e.g. a scan of the real host.
    pub fn with_state(state: ActualState) -> Self {
        Self {
            state: Mutex::new(state),
            mutations: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, ActualState> {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> ActualState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of mutating calls received so far.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BackendAdapter for DryRunBackend {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn create_pool(&self, name: &str, vdevs: &[String]) -> Result<Outcome, BackendError> {
        let mut state = self.state();
        if state.has_pool(name) {
            return Ok(Outcome::Unchanged);
        }
        if vdevs.is_empty() {
            return Err(BackendError::invalid(format!(
                "pool {name} has no vdevs to create it from"
            )));
        }

        tracing::info!("[dry-run] would create pool {} on {:?}", name, vdevs);
        state.pools.push(ActualPool {
            name: name.to_string(),
            health: PoolHealth::Online,
        });
        state.datasets.insert(DatasetKey::new(name, ""));
        Ok(Outcome::Applied)
    }

    async fn destroy_pool(&self, name: &str) -> Result<Outcome, BackendError> {
        let mut state = self.state();
        if !state.has_pool(name) {
            return Ok(Outcome::Unchanged);
        }

        tracing::info!("[dry-run] would destroy pool {}", name);
        state.pools.retain(|pool| pool.name != name);
        state.datasets.retain(|dataset| dataset.pool != name);
        state.exports.retain(|export| export.dataset.pool != name);
        Ok(Outcome::Applied)
    }

    async fn create_dataset(&self, dataset: &DatasetKey) -> Result<Outcome, BackendError> {
        let mut state = self.state();
        let changed = state.datasets.insert(dataset.clone());
        if changed {
            tracing::info!("[dry-run] would create dataset {}", dataset);
        }
        Ok(outcome(changed))
    }

    async fn destroy_dataset(&self, dataset: &DatasetKey) -> Result<Outcome, BackendError> {
        if dataset.is_pool_root() {
            return Err(BackendError::invalid(format!(
                "refusing to destroy root dataset of pool {}",
                dataset.pool
            )));
        }

        let mut state = self.state();
        let changed = state.datasets.remove(dataset);
        if changed {
            tracing::info!("[dry-run] would destroy dataset {}", dataset);
            state.exports.retain(|export| &export.dataset != dataset);
        }
        Ok(outcome(changed))
    }

    async fn bind_export(
        &self,
        dataset: &DatasetKey,
        binding: &ExportBinding,
    ) -> Result<Outcome, BackendError> {
        binding.validate().map_err(BackendError::invalid)?;
        let mut state = self.state();
        let existing = state
            .exports
            .iter_mut()
            .find(|export| &export.dataset == dataset && export.name == binding.name);

        match existing {
            Some(export) if export.options == binding.options => Ok(Outcome::Unchanged),
            Some(export) => {
                tracing::info!(
                    "[dry-run] would re-export {} of {} as {}({})",
                    binding.name,
                    dataset,
                    binding.options.client,
                    binding.options.render()
                );
                export.options = binding.options.clone();
                Ok(Outcome::Applied)
            }
            None => {
                tracing::info!(
                    "[dry-run] would export {} of {} as {}({})",
                    binding.name,
                    dataset,
                    binding.options.client,
                    binding.options.render()
                );
                state.exports.push(ActualExport {
                    dataset: dataset.clone(),
                    name: binding.name.clone(),
                    options: binding.options.clone(),
                });
                Ok(Outcome::Applied)
            }
        }
    }

    async fn unbind_export(
        &self,
        dataset: &DatasetKey,
        export_name: &str,
    ) -> Result<Outcome, BackendError> {
        let mut state = self.state();
        let before = state.exports.len();
        state
            .exports
            .retain(|export| !(&export.dataset == dataset && export.name == export_name));

        let changed = state.exports.len() != before;
        if changed {
            tracing::info!("[dry-run] would withdraw export {} of {}", export_name, dataset);
        }
        Ok(outcome(changed))
    }

    async fn list_actual_state(&self) -> Result<ActualState, BackendError> {
        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zshare_types::ExportOptions;

    #[tokio::test]
    async fn repeated_operations_are_unchanged() {
        let backend = DryRunBackend::new();
        let dataset = DatasetKey::new("tank", "media");
        let binding = ExportBinding::new(dataset.clone(), "media", ExportOptions::default());

        assert_eq!(backend.create_dataset(&dataset).await.unwrap(), Outcome::Applied);
        assert_eq!(backend.create_dataset(&dataset).await.unwrap(), Outcome::Unchanged);
        assert_eq!(backend.bind_export(&dataset, &binding).await.unwrap(), Outcome::Applied);
        assert_eq!(backend.bind_export(&dataset, &binding).await.unwrap(), Outcome::Unchanged);
        assert_eq!(
            backend.unbind_export(&dataset, "media").await.unwrap(),
            Outcome::Applied
        );
        assert_eq!(
            backend.unbind_export(&dataset, "media").await.unwrap(),
            Outcome::Unchanged
        );
        assert_eq!(backend.mutations(), 6);
    }

    #[tokio::test]
    async fn unexportable_bindings_are_rejected() {
        let backend = DryRunBackend::new();
        let dataset = DatasetKey::new("tank", "media");
        let binding = ExportBinding::new(
            dataset.clone(),
            "media",
            ExportOptions::for_client("10.0.0.1(ro)\n/ *"),
        );

        let error = backend.bind_export(&dataset, &binding).await.unwrap_err();
        assert!(!error.is_transient());
        assert!(backend.snapshot().exports.is_empty());
        assert_eq!(backend.mutations(), 0);
    }

    #[tokio::test]
    async fn pool_roots_cannot_be_destroyed() {
        let backend = DryRunBackend::new();
        backend
            .create_pool("tank", &["/dev/sdb".to_string()])
            .await
            .unwrap();
        assert!(
            backend
                .destroy_dataset(&DatasetKey::new("tank", ""))
                .await
                .is_err()
        );
        assert_eq!(backend.destroy_pool("tank").await.unwrap(), Outcome::Applied);
        assert!(backend.snapshot().datasets.is_empty());
    }
}
