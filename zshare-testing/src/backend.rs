// SPDX-License-Identifier: GPL-3.0-only

//! In-memory [`BackendAdapter`] that records every call and fails on demand.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use zshare_contracts::{BackendAdapter, BackendError, Outcome};
use zshare_types::{
    ActualExport, ActualPool, ActualState, DatasetKey, ExportBinding, ExportOptions, PoolHealth,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreatePool(String),
    DestroyPool(String),
    CreateDataset(DatasetKey),
    DestroyDataset(DatasetKey),
    Bind(DatasetKey, String, ExportOptions),
    Unbind(DatasetKey, String),
    ListActualState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreatePool,
    DestroyPool,
    CreateDataset,
    DestroyDataset,
    Bind,
    Unbind,
    List,
}

impl Call {
    pub fn operation(&self) -> Operation {
        match self {
            Self::CreatePool(_) => Operation::CreatePool,
            Self::DestroyPool(_) => Operation::DestroyPool,
            Self::CreateDataset(_) => Operation::CreateDataset,
            Self::DestroyDataset(_) => Operation::DestroyDataset,
            Self::Bind(..) => Operation::Bind,
            Self::Unbind(..) => Operation::Unbind,
            Self::ListActualState => Operation::List,
        }
    }

    pub fn is_mutation(&self) -> bool {
        self.operation() != Operation::List
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn outcome(changed: bool) -> Outcome {
    if changed {
        Outcome::Applied
    } else {
        Outcome::Unchanged
    }
}

/// Fake backend holding its state in memory.
///
/// Binding an export requires its dataset to exist; pool existence is not
/// checked for datasets.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    calls: Arc<Mutex<Vec<Call>>>,
    state: Arc<Mutex<ActualState>>,
    faults: Arc<Mutex<HashMap<Operation, VecDeque<BackendError>>>>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ActualState) -> Self {
        let backend = Self::default();
        *lock(&backend.state) = state;
        backend
    }

    /// Fail the next call of `operation` with `error`.
    pub fn fail_next(&self, operation: Operation, error: BackendError) {
        self.fail_times(operation, 1, error);
    }

    /// Fail the next `times` calls of `operation` with `error`.
    pub fn fail_times(&self, operation: Operation, times: usize, error: BackendError) {
        let mut faults = lock(&self.faults);
        let queue = faults.entry(operation).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// Delay every call, to widen race windows in tests.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *lock(&self.calls))
    }

    /// Calls of one operation, in order.
    pub fn calls_of(&self, operation: Operation) -> Vec<Call> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.operation() == operation)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> ActualState {
        lock(&self.state).clone()
    }

    pub fn export(&self, dataset: &DatasetKey, name: &str) -> Option<ExportOptions> {
        lock(&self.state)
            .exports
            .iter()
            .find(|export| &export.dataset == dataset && export.name == name)
            .map(|export| export.options.clone())
    }

    async fn enter(&self, call: Call) -> Result<(), BackendError> {
        let operation = call.operation();
        lock(&self.calls).push(call);

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let fault = lock(&self.faults)
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(error) => {
                tracing::debug!("Injecting {:?} failure: {}", operation, error);
                Err(error)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendAdapter for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_pool(&self, name: &str, _vdevs: &[String]) -> Result<Outcome, BackendError> {
        self.enter(Call::CreatePool(name.to_string())).await?;
        let mut state = lock(&self.state);
        if state.has_pool(name) {
            return Ok(Outcome::Unchanged);
        }
        state.pools.push(ActualPool {
            name: name.to_string(),
            health: PoolHealth::Online,
        });
        Ok(Outcome::Applied)
    }

    async fn destroy_pool(&self, name: &str) -> Result<Outcome, BackendError> {
        self.enter(Call::DestroyPool(name.to_string())).await?;
        let mut state = lock(&self.state);
        let changed = state.has_pool(name);
        state.pools.retain(|pool| pool.name != name);
        state.datasets.retain(|dataset| dataset.pool != name);
        state.exports.retain(|export| export.dataset.pool != name);
        Ok(outcome(changed))
    }

    async fn create_dataset(&self, dataset: &DatasetKey) -> Result<Outcome, BackendError> {
        self.enter(Call::CreateDataset(dataset.clone())).await?;
        Ok(outcome(lock(&self.state).datasets.insert(dataset.clone())))
    }

    async fn destroy_dataset(&self, dataset: &DatasetKey) -> Result<Outcome, BackendError> {
        self.enter(Call::DestroyDataset(dataset.clone())).await?;
        if dataset.is_pool_root() {
            return Err(BackendError::invalid("cannot destroy a pool root"));
        }
        let mut state = lock(&self.state);
        state.exports.retain(|export| &export.dataset != dataset);
        Ok(outcome(state.datasets.remove(dataset)))
    }

    async fn bind_export(
        &self,
        dataset: &DatasetKey,
        binding: &ExportBinding,
    ) -> Result<Outcome, BackendError> {
        self.enter(Call::Bind(
            dataset.clone(),
            binding.name.clone(),
            binding.options.clone(),
        ))
        .await?;

        binding.validate().map_err(BackendError::invalid)?;
        let mut state = lock(&self.state);
        if !state.datasets.contains(dataset) {
            return Err(BackendError::not_found(format!(
                "dataset {dataset} does not exist"
            )));
        }

        match state
            .exports
            .iter_mut()
            .find(|export| &export.dataset == dataset && export.name == binding.name)
        {
            Some(export) if export.options == binding.options => Ok(Outcome::Unchanged),
            Some(export) => {
                export.options = binding.options.clone();
                Ok(Outcome::Applied)
            }
            None => {
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
        self.enter(Call::Unbind(dataset.clone(), export_name.to_string()))
            .await?;
        let mut state = lock(&self.state);
        let before = state.exports.len();
        state
            .exports
            .retain(|export| !(&export.dataset == dataset && export.name == export_name));
        Ok(outcome(state.exports.len() != before))
    }

    async fn list_actual_state(&self) -> Result<ActualState, BackendError> {
        self.enter(Call::ListActualState).await?;
        Ok(self.snapshot())
    }
}
