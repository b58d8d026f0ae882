// SPDX-License-Identifier: GPL-3.0-only

//! Reconciliation engine.
//!
//! Events update the desired model; the engine then diffs the model against
//! what it last applied for the affected dataset and issues the backend calls
//! that close the gap. Each dataset key moves through
//! `Idle -> Applying -> (Idle | Retrying | Failed)`.

pub mod plan;
pub mod retry;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use zshare_contracts::{BackendAdapter, BackendError, Outcome};
use zshare_types::{
    ActualState, ConfigEvent, DatasetKey, ErrorClass, ErrorReport, EventKey, EventPayload,
    ExportBinding, ExportOptions, KeyState, PoolHealth,
};

use crate::bus::EventHandler;
use crate::error::{ReconcileError, Result};
use crate::model::{BindingChange, SharedModel};
use crate::status::StatusBoard;

pub use plan::{Action, Applied, Desired};
pub use retry::RetryPolicy;

#[derive(Debug, Default)]
struct KeyRecord {
    applied: Applied,
    /// Highest sequence seen per export; `None` tracks dataset lifecycle events.
    sequences: HashMap<Option<String>, u64>,
    failures: u32,
    state: KeyState,
}

type RecordLock = Arc<tokio::sync::Mutex<KeyRecord>>;

/// Outcome of converging a batch of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvergeSummary {
    pub converged: usize,
    pub failed: Vec<DatasetKey>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct EngineInner {
    backend: Arc<dyn BackendAdapter>,
    model: SharedModel,
    status: StatusBoard,
    retry: RetryPolicy,
    records: Mutex<HashMap<DatasetKey, RecordLock>>,
    /// Bindings whose dataset is not in the model yet.
    held: Mutex<HashMap<DatasetKey, BTreeMap<String, ExportBinding>>>,
    /// Dataset work takes a pool's lock shared; pool lifecycle takes it exclusively.
    pool_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    pool_sequences: Mutex<HashMap<String, u64>>,
    service_sequence: tokio::sync::Mutex<u64>,
    retries: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl EngineInner {
    fn record(&self, dataset: &DatasetKey) -> RecordLock {
        lock(&self.records)
            .entry(dataset.clone())
            .or_default()
            .clone()
    }

    fn pool_lock(&self, pool: &str) -> Arc<RwLock<()>> {
        lock(&self.pool_locks)
            .entry(pool.to_string())
            .or_default()
            .clone()
    }

    fn has_held(&self, dataset: &DatasetKey) -> bool {
        lock(&self.held)
            .get(dataset)
            .is_some_and(|held| !held.is_empty())
    }

    /// Every dataset the engine has desired or applied state for.
    fn known_datasets(&self) -> BTreeSet<DatasetKey> {
        let mut keys: BTreeSet<DatasetKey> = self.model.read().dataset_keys().into_iter().collect();
        keys.extend(lock(&self.records).keys().cloned());
        keys
    }

    fn stale(key: &EventKey, event: &ConfigEvent, latest: Option<u64>) -> Result<()> {
        match latest {
            Some(latest) if event.sequence < latest => {
                tracing::debug!(
                    "Discarding stale {:?} for {} (sequence {} < {})",
                    event.kind(),
                    key,
                    event.sequence,
                    latest
                );
                Err(ReconcileError::StaleEvent {
                    key: key.clone(),
                    sequence: event.sequence,
                    latest,
                })
            }
            _ => Ok(()),
        }
    }

    async fn handle_dataset(self: &Arc<Self>, dataset: &DatasetKey, event: &ConfigEvent) -> Result<()> {
        let key = EventKey::Dataset(dataset.clone());
        let pool_lock = self.pool_lock(&dataset.pool);
        let _pool = pool_lock.read().await;
        let record_lock = self.record(dataset);
        let mut record = record_lock.lock().await;

        let scope = event.payload.export_name().map(str::to_string);
        Self::stale(&key, event, record.sequences.get(&scope).copied())?;
        record.sequences.insert(scope, event.sequence);
        self.status.record_sequence(&key, event.sequence);

        let was_failed = record.state == KeyState::Failed;
        if was_failed {
            tracing::info!("New event for failed key {}, clearing failure", key);
            record.state = KeyState::Idle;
            record.failures = 0;
            self.status.set_state(&key, KeyState::Idle, 0);
        }

        let changed = match self.apply_to_model(dataset, event) {
            Ok(changed) => changed,
            Err(error) => {
                tracing::error!("Could not apply {:?} to {}: {}", event.kind(), key, error);
                self.mark_failed(&key, &mut record, &error);
                return Err(error);
            }
        };

        if !changed && !was_failed {
            if matches!(event.payload, EventPayload::DatasetDeleted { .. }) {
                self.release_deleted(dataset, &record_lock, &record);
            }
            return Ok(());
        }

        if record.state == KeyState::Retrying {
            tracing::debug!(
                "{} is waiting to retry; sequence {} will be applied then",
                key,
                event.sequence
            );
            return Ok(());
        }

        self.converge_locked(dataset, &mut record).await?;
        if matches!(event.payload, EventPayload::DatasetDeleted { .. }) {
            self.release_deleted(dataset, &record_lock, &record);
        }
        Ok(())
    }

    /// Forget a deleted dataset once nothing is left to converge for it.
    ///
    /// Its sequence watermarks go too, so a re-created dataset starts afresh.
    fn release_deleted(&self, dataset: &DatasetKey, record_lock: &RecordLock, record: &KeyRecord) {
        if record.state != KeyState::Idle
            || !record.applied.is_empty()
            || self.has_held(dataset)
            || self.model.read().has_dataset(dataset)
        {
            return;
        }

        let mut records = lock(&self.records);
        // Anyone else waiting on the record holds a clone of it.
        if Arc::strong_count(record_lock) != 2 {
            return;
        }
        records.remove(dataset);
        self.status.forget(&EventKey::Dataset(dataset.clone()));
        tracing::debug!("Released state of deleted dataset {}", dataset);
    }

    /// Fold an event into the desired model. Returns whether desired state changed.
    fn apply_to_model(&self, dataset: &DatasetKey, event: &ConfigEvent) -> Result<bool> {
        match &event.payload {
            EventPayload::ShareCreated {
                export, options, ..
            } => {
                let binding = ExportBinding::new(dataset.clone(), export, options.clone())
                    .with_sequence(event.sequence);
                self.bind_or_hold(dataset, binding)
            }
            EventPayload::ShareUpdated { export, patch, .. } => {
                let current = self
                    .model
                    .read()
                    .dataset(dataset)
                    .and_then(|found| found.binding(export))
                    .cloned()
                    .or_else(|| {
                        lock(&self.held)
                            .get(dataset)
                            .and_then(|held| held.get(export))
                            .cloned()
                    });

                let merged = match &current {
                    Some(binding) => {
                        let merged = binding.options.merged(patch);
                        let changes = binding.options.diff(&merged);
                        if changes.is_empty() {
                            tracing::debug!("Update of {} on {} changes nothing", export, dataset);
                            return Ok(false);
                        }
                        for change in &changes {
                            tracing::debug!(
                                "{}/{}: {} {:?} -> {:?}",
                                dataset,
                                export,
                                change.field,
                                change.old,
                                change.new
                            );
                        }
                        merged
                    }
                    None => {
                        tracing::warn!(
                            "Update for unknown export {} on {}; treating it as a create",
                            export,
                            dataset
                        );
                        ExportOptions::default().merged(patch)
                    }
                };

                let binding = ExportBinding::new(dataset.clone(), export, merged)
                    .with_sequence(event.sequence);
                self.bind_or_hold(dataset, binding)
            }
            EventPayload::ShareDeleted { export, .. } => {
                let was_held = lock(&self.held)
                    .get_mut(dataset)
                    .and_then(|held| held.remove(export))
                    .is_some();

                let removed = {
                    let mut model = self.model.write();
                    if model.has_dataset(dataset) {
                        model.remove_binding(dataset, export)?.is_some()
                    } else {
                        false
                    }
                };

                if !removed && !was_held {
                    tracing::debug!("Export {} on {} is already absent", export, dataset);
                }
                Ok(removed)
            }
            EventPayload::DatasetCreated { .. } => {
                let created = {
                    let mut model = self.model.write();
                    let existed = model.has_dataset(dataset);
                    model.upsert_dataset(dataset)?;
                    !existed
                };

                let held = lock(&self.held).remove(dataset).unwrap_or_default();
                let released = !held.is_empty();
                let mut model = self.model.write();
                for binding in held.into_values() {
                    tracing::info!("Releasing held export {} on {}", binding.name, dataset);
                    model.apply_binding(dataset, binding)?;
                }

                Ok(created || released)
            }
            EventPayload::DatasetDeleted { .. } => {
                if let Some(held) = lock(&self.held).remove(dataset) {
                    if !held.is_empty() {
                        tracing::warn!(
                            "Dropping {} held exports of deleted dataset {}",
                            held.len(),
                            dataset
                        );
                    }
                }
                Ok(self.model.write().remove_dataset(dataset).is_some())
            }
            EventPayload::ServiceUpdated { .. }
            | EventPayload::PoolCreated { .. }
            | EventPayload::PoolDestroyed { .. } => Ok(false),
        }
    }

    fn bind_or_hold(&self, dataset: &DatasetKey, binding: ExportBinding) -> Result<bool> {
        {
            let mut model = self.model.write();
            if model.has_dataset(dataset) {
                let change = model.apply_binding(dataset, binding)?;
                if let BindingChange::Updated(changes) = &change {
                    tracing::debug!("{} option(s) changed on {}", changes.len(), dataset);
                }
                return Ok(change.is_change());
            }
        }

        let error = ReconcileError::UnresolvedReference(dataset.clone());
        tracing::info!("Holding export {}: {}", binding.name, error);
        self.status.record_error(
            &EventKey::Dataset(dataset.clone()),
            ErrorReport::new(error.class(), error.to_string()),
        );
        lock(&self.held)
            .entry(dataset.clone())
            .or_default()
            .insert(binding.name.clone(), binding);
        Ok(false)
    }

    async fn converge_key(self: &Arc<Self>, dataset: &DatasetKey, skip_retrying: bool) -> Result<()> {
        let pool_lock = self.pool_lock(&dataset.pool);
        let _pool = pool_lock.read().await;
        let record_lock = self.record(dataset);
        let mut record = record_lock.lock().await;

        if skip_retrying && record.state == KeyState::Retrying {
            return Ok(());
        }
        record.failures = 0;
        self.converge_locked(dataset, &mut record).await
    }

    async fn converge_locked(self: &Arc<Self>, dataset: &DatasetKey, record: &mut KeyRecord) -> Result<()> {
        let key = EventKey::Dataset(dataset.clone());
        let desired = Desired::from_model(&self.model.read(), dataset);
        let actions = plan::plan(&desired, &record.applied);

        if actions.is_empty() {
            self.settle(dataset, record);
            return Ok(());
        }

        record.state = KeyState::Applying;
        self.status.set_state(&key, KeyState::Applying, record.failures);

        for action in actions {
            if let Err(error) = self.execute(dataset, &action, &mut record.applied).await {
                return self.on_failure(dataset, record, &action, error);
            }
        }

        self.settle(dataset, record);
        Ok(())
    }

    async fn execute(
        &self,
        dataset: &DatasetKey,
        action: &Action,
        applied: &mut Applied,
    ) -> std::result::Result<(), BackendError> {
        match action {
            Action::CreateDataset => {
                self.backend.create_dataset(dataset).await?;
                applied.exists = true;
            }
            Action::Unbind(name) => {
                self.backend.unbind_export(dataset, name).await?;
                applied.exports.remove(name);
            }
            Action::Bind(binding) => {
                self.backend.bind_export(dataset, binding).await?;
                applied
                    .exports
                    .insert(binding.name.clone(), binding.options.clone());
            }
            Action::DestroyDataset => {
                if dataset.is_pool_root() {
                    tracing::warn!("Not destroying root dataset of pool {}", dataset.pool);
                } else {
                    self.backend.destroy_dataset(dataset).await?;
                }
                applied.exists = false;
                applied.exports.clear();
            }
        }
        Ok(())
    }

    fn settle(&self, dataset: &DatasetKey, record: &mut KeyRecord) {
        let key = EventKey::Dataset(dataset.clone());
        if record.state != KeyState::Idle {
            tracing::info!("{} converged", key);
        }
        record.state = KeyState::Idle;
        record.failures = 0;
        self.status.set_state(&key, KeyState::Idle, 0);
        if !self.has_held(dataset) {
            self.status.clear_error(&key);
        }
    }

    fn mark_failed(&self, key: &EventKey, record: &mut KeyRecord, error: &ReconcileError) {
        record.state = KeyState::Failed;
        self.status.set_state(key, KeyState::Failed, record.failures);
        self.status
            .record_error(key, ErrorReport::new(error.class(), error.to_string()));
    }

    fn on_failure(
        self: &Arc<Self>,
        dataset: &DatasetKey,
        record: &mut KeyRecord,
        action: &Action,
        error: BackendError,
    ) -> Result<()> {
        let key = EventKey::Dataset(dataset.clone());
        let context = format!("{} on {}", action.describe(), dataset);
        let error = ReconcileError::from(error);

        if error.class() != ErrorClass::TransientBackend {
            tracing::error!("Could not {}: {}", context, error);
            self.mark_failed(&key, record, &error);
            return Err(error);
        }

        record.failures += 1;
        self.status.record_error(
            &key,
            ErrorReport::new(error.class(), format!("{context}: {error}")),
        );

        if !self.retry.allows_retry(record.failures) || self.shutdown.is_cancelled() {
            tracing::error!(
                "Giving up on {} after {} attempts: {}",
                key,
                record.failures,
                error
            );
            self.mark_failed(&key, record, &error);
            return Err(error);
        }

        let delay = self.retry.delay(record.failures);
        tracing::warn!(
            "Could not {} ({}), retry {} in {:?}",
            context,
            error,
            record.failures,
            delay
        );
        record.state = KeyState::Retrying;
        self.status
            .set_state(&key, KeyState::Retrying, record.failures);
        self.schedule_retry(dataset.clone(), delay);
        Ok(())
    }

    fn schedule_retry(self: &Arc<Self>, dataset: DatasetKey, delay: Duration) {
        let engine = Arc::clone(self);
        let mut retries = lock(&self.retries);
        while retries.try_join_next().is_some() {}
        retries.spawn(async move {
            tokio::select! {
                _ = engine.shutdown.cancelled() => {
                    tracing::warn!("Abandoning pending retry of {} at shutdown", dataset);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            engine.retry_now(&dataset).await;
        });
    }

    async fn retry_now(self: &Arc<Self>, dataset: &DatasetKey) {
        let pool_lock = self.pool_lock(&dataset.pool);
        let _pool = pool_lock.read().await;
        let record_lock = self.record(dataset);
        let mut record = record_lock.lock().await;

        // Someone else already converged this key.
        if record.state != KeyState::Retrying {
            return;
        }

        tracing::debug!("Retrying {} (attempt {})", dataset, record.failures + 1);
        // Failures are recorded on the status board by converge_locked.
        let _ = self.converge_locked(dataset, &mut record).await;
    }

    async fn converge_all(self: &Arc<Self>, skip_retrying: bool) -> ConvergeSummary {
        let mut summary = ConvergeSummary::default();
        for dataset in self.known_datasets() {
            match self.converge_key(&dataset, skip_retrying).await {
                Ok(()) => summary.converged += 1,
                Err(_) => summary.failed.push(dataset),
            }
        }
        summary
    }

    async fn handle_service(self: &Arc<Self>, event: &ConfigEvent, enabled: bool) -> Result<()> {
        let key = EventKey::Service;
        let mut latest = self.service_sequence.lock().await;
        Self::stale(&key, event, Some(*latest))?;
        *latest = event.sequence;
        self.status.record_sequence(&key, event.sequence);
        self.status.set_state(&key, KeyState::Applying, 0);

        let changed = self.model.write().set_service_enabled(enabled);
        tracing::info!(
            "Share service {}{}",
            if enabled { "enabled" } else { "disabled" },
            if changed { "" } else { " (unchanged, re-validating)" }
        );

        let summary = self.converge_all(true).await;
        if !summary.failed.is_empty() {
            tracing::warn!(
                "{} dataset(s) failed to converge after service update",
                summary.failed.len()
            );
        }
        self.status.set_state(&key, KeyState::Idle, 0);
        Ok(())
    }

    /// Run a pool-level backend call, retrying transient failures inline.
    async fn with_retry<F, Fut>(&self, what: &str, operation: F) -> std::result::Result<Outcome, BackendError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<Outcome, BackendError>>,
    {
        let mut failures = 0;
        loop {
            match operation().await {
                Err(error) if error.is_transient() => {
                    failures += 1;
                    if !self.retry.allows_retry(failures) {
                        return Err(error);
                    }
                    let delay = self.retry.delay(failures);
                    tracing::warn!("Could not {} ({}), retrying in {:?}", what, error, delay);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(error),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }

    async fn handle_pool(self: &Arc<Self>, pool: &str, event: &ConfigEvent) -> Result<()> {
        let key = EventKey::Pool(pool.to_string());
        let pool_lock = self.pool_lock(pool);
        let _exclusive = pool_lock.write().await;

        let latest = lock(&self.pool_sequences).get(pool).copied();
        Self::stale(&key, event, latest)?;
        lock(&self.pool_sequences).insert(pool.to_string(), event.sequence);
        self.status.record_sequence(&key, event.sequence);
        self.status.set_state(&key, KeyState::Applying, 0);

        let result = match &event.payload {
            EventPayload::PoolCreated { vdevs, .. } => self.create_pool(pool, vdevs).await,
            EventPayload::PoolDestroyed { .. } => self.destroy_pool(pool).await,
            _ => Ok(()),
        };

        match &result {
            Ok(()) => {
                self.status.set_state(&key, KeyState::Idle, 0);
                self.status.clear_error(&key);
            }
            Err(error) => {
                tracing::error!("{} failed: {}", key, error);
                self.status.set_state(&key, KeyState::Failed, 0);
                self.status
                    .record_error(&key, ErrorReport::new(error.class(), error.to_string()));
            }
        }
        result
    }

    async fn create_pool(&self, pool: &str, vdevs: &[String]) -> Result<()> {
        let outcome = self
            .with_retry(&format!("create pool {pool}"), || {
                self.backend.create_pool(pool, vdevs)
            })
            .await?;
        self.model.write().insert_pool(pool, PoolHealth::Online);
        tracing::info!(
            "Pool {} {}",
            pool,
            if outcome.already_done() {
                "already present"
            } else {
                "created"
            }
        );
        Ok(())
    }

    async fn destroy_pool(&self, pool: &str) -> Result<()> {
        let mut datasets: BTreeSet<DatasetKey> =
            self.model.read().datasets_in(pool).into_iter().collect();
        datasets.extend(
            lock(&self.records)
                .keys()
                .filter(|dataset| dataset.pool == pool)
                .cloned(),
        );

        // Withdraw exports first; the pool takes its datasets with it.
        for dataset in &datasets {
            let record_lock = self.record(dataset);
            let mut record = record_lock.lock().await;
            let names: Vec<String> = record.applied.exports.keys().cloned().collect();
            for name in names {
                self.with_retry(&format!("unbind export {name} on {dataset}"), || {
                    self.backend.unbind_export(dataset, &name)
                })
                .await?;
                record.applied.exports.remove(&name);
            }
        }

        self.with_retry(&format!("destroy pool {pool}"), || {
            self.backend.destroy_pool(pool)
        })
        .await?;

        self.model.write().remove_pool(pool);
        {
            let mut records = lock(&self.records);
            for dataset in &datasets {
                records.remove(dataset);
                self.status.forget(&EventKey::Dataset(dataset.clone()));
            }
        }

        let mut held = lock(&self.held);
        let dropped: Vec<DatasetKey> = held.keys().filter(|key| key.pool == pool).cloned().collect();
        for dataset in dropped {
            if let Some(bindings) = held.remove(&dataset) {
                tracing::warn!(
                    "Dropping {} held exports of {} with its pool",
                    bindings.len(),
                    dataset
                );
            }
        }

        tracing::info!("Pool {} destroyed", pool);
        Ok(())
    }
}

/// Drives the backend toward the desired model, one dataset key at a time.
#[derive(Clone)]
pub struct ReconciliationEngine {
    inner: Arc<EngineInner>,
}

impl ReconciliationEngine {
    pub fn new(
        backend: Arc<dyn BackendAdapter>,
        model: SharedModel,
        status: StatusBoard,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                backend,
                model,
                status,
                retry,
                records: Mutex::new(HashMap::new()),
                held: Mutex::new(HashMap::new()),
                pool_locks: Mutex::new(HashMap::new()),
                pool_sequences: Mutex::new(HashMap::new()),
                service_sequence: tokio::sync::Mutex::new(0),
                retries: Mutex::new(JoinSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn BackendAdapter> {
        &self.inner.backend
    }

    pub fn model(&self) -> &SharedModel {
        &self.inner.model
    }

    pub fn status(&self) -> &StatusBoard {
        &self.inner.status
    }

    /// Bindings waiting for `dataset` to be created.
    pub fn held_bindings(&self, dataset: &DatasetKey) -> Vec<ExportBinding> {
        lock(&self.inner.held)
            .get(dataset)
            .map(|held| held.values().cloned().collect())
            .unwrap_or_default()
    }

    /// What the engine believes is applied on the backend for `dataset`.
    pub async fn applied(&self, dataset: &DatasetKey) -> Applied {
        self.inner.record(dataset).lock().await.applied.clone()
    }

    /// Record what the backend already holds so the next convergence only
    /// issues the calls that are actually missing.
    ///
    /// Only pools present in the model are adopted. Exports on datasets the
    /// model does not know are always withdrawn; the datasets themselves are
    /// destroyed only with `prune_orphans`. A pool's root dataset is never
    /// scheduled for destruction.
    pub async fn adopt_actual(&self, actual: &ActualState, prune_orphans: bool) {
        let model = self.inner.model.snapshot();

        let mut datasets: BTreeSet<DatasetKey> = actual.datasets.clone();
        datasets.extend(actual.exports.iter().map(|export| export.dataset.clone()));

        for dataset in datasets {
            if model.get(&dataset.pool).is_none() {
                continue;
            }
            let declared = model.has_dataset(&dataset);

            let mut applied = Applied::from_actual(actual, &dataset);
            if !declared && (dataset.is_pool_root() || !prune_orphans) {
                applied.exists = false;
            }
            if !applied.is_empty() {
                self.inner.record(&dataset).lock().await.applied = applied;
            }
        }
    }

    /// Converge one dataset now, clearing any failure and retry budget.
    pub async fn converge(&self, dataset: &DatasetKey) -> Result<()> {
        self.inner.converge_key(dataset, false).await
    }

    /// Converge every dataset the engine knows about.
    pub async fn converge_all(&self) -> ConvergeSummary {
        self.inner.converge_all(false).await
    }

    /// Ensure a declared pool exists on the backend.
    pub async fn ensure_pool(&self, pool: &str, vdevs: &[String]) -> Result<()> {
        let pool_lock = self.inner.pool_lock(pool);
        let _exclusive = pool_lock.write().await;
        self.inner.create_pool(pool, vdevs).await
    }

    /// Operator-requested re-convergence of a key.
    ///
    /// A pool key covers its datasets and the service key covers everything.
    pub async fn resync(&self, key: &EventKey) -> ConvergeSummary {
        tracing::info!("Resync requested for {}", key);
        let datasets: Vec<DatasetKey> = match key {
            EventKey::Dataset(dataset) => vec![dataset.clone()],
            EventKey::Pool(pool) => self
                .inner
                .known_datasets()
                .into_iter()
                .filter(|dataset| &dataset.pool == pool)
                .collect(),
            EventKey::Service => self.inner.known_datasets().into_iter().collect(),
        };

        let mut summary = ConvergeSummary::default();
        for dataset in datasets {
            match self.converge(&dataset).await {
                Ok(()) => summary.converged += 1,
                Err(_) => summary.failed.push(dataset),
            }
        }
        summary
    }

    /// Cancel pending retries and wait for retry tasks to wind down.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut retries = std::mem::take(&mut *lock(&self.inner.retries));
        while retries.join_next().await.is_some() {}
    }
}

#[async_trait]
impl EventHandler for ReconciliationEngine {
    fn name(&self) -> &str {
        "reconciler"
    }

    async fn handle(&self, event: &ConfigEvent) -> Result<()> {
        match &event.payload {
            EventPayload::ServiceUpdated { enabled } => {
                self.inner.handle_service(event, *enabled).await
            }
            EventPayload::PoolCreated { pool, .. } | EventPayload::PoolDestroyed { pool } => {
                self.inner.handle_pool(pool, event).await
            }
            EventPayload::ShareCreated { dataset, .. }
            | EventPayload::ShareDeleted { dataset, .. }
            | EventPayload::ShareUpdated { dataset, .. }
            | EventPayload::DatasetCreated { dataset }
            | EventPayload::DatasetDeleted { dataset } => {
                self.inner.handle_dataset(dataset, event).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::DryRunBackend;
    use crate::model::PoolModel;
    use zshare_types::AccessMode;

    fn media() -> DatasetKey {
        DatasetKey::new("tank", "media")
    }

    fn engine() -> (ReconciliationEngine, Arc<DryRunBackend>) {
        let backend = Arc::new(DryRunBackend::new());
        let mut model = PoolModel::new();
        model.insert_pool("tank", PoolHealth::Online);
        let engine = ReconciliationEngine::new(
            backend.clone(),
            SharedModel::new(model),
            StatusBoard::new(),
            RetryPolicy::fixed(Duration::from_millis(1), 3),
        );
        (engine, backend)
    }

    fn share_created(sequence: u64, client: &str) -> ConfigEvent {
        ConfigEvent::new(
            sequence,
            EventPayload::ShareCreated {
                dataset: media(),
                export: "media".to_string(),
                options: ExportOptions::for_client(client),
            },
        )
    }

    fn dataset_created(sequence: u64) -> ConfigEvent {
        ConfigEvent::new(sequence, EventPayload::DatasetCreated { dataset: media() })
    }

    #[tokio::test]
    async fn share_is_held_until_its_dataset_exists() {
        let (engine, backend) = engine();

        engine.handle(&share_created(1, "*")).await.unwrap();
        assert_eq!(engine.held_bindings(&media()).len(), 1);
        assert!(backend.snapshot().exports.is_empty());
        let status = engine.status().get(&EventKey::Dataset(media())).unwrap();
        assert_eq!(
            status.last_error.map(|report| report.class),
            Some(ErrorClass::UnresolvedReference)
        );

        engine.handle(&dataset_created(1)).await.unwrap();
        let state = backend.snapshot();
        assert!(state.datasets.contains(&media()));
        assert_eq!(state.exports.len(), 1);
        assert!(engine.held_bindings(&media()).is_empty());
        assert_eq!(engine.status().state(&EventKey::Dataset(media())), KeyState::Idle);
    }

    #[tokio::test]
    async fn older_sequences_are_discarded() {
        let (engine, backend) = engine();
        engine.handle(&dataset_created(1)).await.unwrap();
        engine.handle(&share_created(5, "10.0.0.5")).await.unwrap();

        let error = engine.handle(&share_created(3, "10.0.0.3")).await.unwrap_err();
        assert_eq!(error.class(), ErrorClass::StaleEvent);
        assert_eq!(backend.snapshot().exports[0].options.client, "10.0.0.5");
    }

    #[tokio::test]
    async fn noop_update_does_not_touch_the_backend() {
        let (engine, backend) = engine();
        engine.handle(&dataset_created(1)).await.unwrap();
        engine.handle(&share_created(1, "*")).await.unwrap();
        let before = backend.mutations();

        let update = ConfigEvent::new(
            2,
            EventPayload::ShareUpdated {
                dataset: media(),
                export: "media".to_string(),
                patch: zshare_types::ExportOptionsPatch {
                    client: Some("*".to_string()),
                    ..Default::default()
                },
            },
        );
        engine.handle(&update).await.unwrap();
        assert_eq!(backend.mutations(), before);

        let update = ConfigEvent::new(
            3,
            EventPayload::ShareUpdated {
                dataset: media(),
                export: "media".to_string(),
                patch: zshare_types::ExportOptionsPatch {
                    access: Some(AccessMode::ReadOnly),
                    ..Default::default()
                },
            },
        );
        engine.handle(&update).await.unwrap();
        assert_eq!(backend.mutations(), before + 1);
        assert_eq!(
            backend.snapshot().exports[0].options.access,
            AccessMode::ReadOnly
        );
    }

    #[tokio::test]
    async fn disabling_the_service_withdraws_exports_but_keeps_bindings() {
        let (engine, backend) = engine();
        engine.handle(&dataset_created(1)).await.unwrap();
        engine.handle(&share_created(1, "*")).await.unwrap();

        engine
            .handle(&ConfigEvent::new(1, EventPayload::ServiceUpdated { enabled: false }))
            .await
            .unwrap();
        assert!(backend.snapshot().exports.is_empty());
        assert_eq!(
            engine.model().read().dataset(&media()).unwrap().bindings.len(),
            1
        );

        engine
            .handle(&ConfigEvent::new(2, EventPayload::ServiceUpdated { enabled: true }))
            .await
            .unwrap();
        assert_eq!(backend.snapshot().exports.len(), 1);
    }

    #[tokio::test]
    async fn dataset_in_unknown_pool_fails_the_key() {
        let (engine, _backend) = engine();
        let stray = DatasetKey::new("ghost", "data");
        let error = engine
            .handle(&ConfigEvent::new(1, EventPayload::DatasetCreated { dataset: stray.clone() }))
            .await
            .unwrap_err();

        assert_eq!(error.class(), ErrorClass::PermanentBackend);
        assert_eq!(engine.status().state(&EventKey::Dataset(stray)), KeyState::Failed);
    }

    #[tokio::test]
    async fn pool_destruction_withdraws_exports_and_forgets_datasets() {
        let (engine, backend) = engine();
        engine
            .handle(&ConfigEvent::new(
                1,
                EventPayload::PoolCreated {
                    pool: "tank".to_string(),
                    vdevs: vec!["/dev/sdb".to_string()],
                },
            ))
            .await
            .unwrap();
        engine.handle(&dataset_created(1)).await.unwrap();
        engine.handle(&share_created(1, "*")).await.unwrap();

        engine
            .handle(&ConfigEvent::new(
                2,
                EventPayload::PoolDestroyed {
                    pool: "tank".to_string(),
                },
            ))
            .await
            .unwrap();

        let state = backend.snapshot();
        assert!(state.pools.is_empty());
        assert!(state.exports.is_empty());
        assert!(engine.model().read().get("tank").is_none());
        assert!(engine.status().get(&EventKey::Dataset(media())).is_none());
    }

    #[tokio::test]
    async fn deleted_datasets_release_their_records() {
        let (engine, backend) = engine();
        engine.handle(&dataset_created(1)).await.unwrap();
        engine.handle(&share_created(1, "*")).await.unwrap();
        assert_eq!(lock(&engine.inner.records).len(), 1);

        engine
            .handle(&ConfigEvent::new(
                2,
                EventPayload::DatasetDeleted { dataset: media() },
            ))
            .await
            .unwrap();

        assert!(!backend.snapshot().datasets.contains(&media()));
        assert!(lock(&engine.inner.records).is_empty());
        assert!(engine.status().get(&EventKey::Dataset(media())).is_none());

        // Deleting an unknown dataset leaves nothing behind either.
        let other = DatasetKey::new("tank", "other");
        engine
            .handle(&ConfigEvent::new(
                1,
                EventPayload::DatasetDeleted { dataset: other },
            ))
            .await
            .unwrap();
        assert!(lock(&engine.inner.records).is_empty());

        // A re-created dataset starts a fresh sequence space.
        engine.handle(&dataset_created(1)).await.unwrap();
        assert!(engine.model().read().has_dataset(&media()));
        assert!(backend.snapshot().datasets.contains(&media()));
    }

    #[tokio::test]
    async fn adopting_actual_state_avoids_redundant_calls() {
        let (engine, backend) = engine();
        engine.model().write().upsert_dataset(&media()).unwrap();
        backend.create_dataset(&media()).await.unwrap();
        let actual = backend.list_actual_state().await.unwrap();
        let before = backend.mutations();

        engine.adopt_actual(&actual, true).await;
        engine.converge(&media()).await.unwrap();

        assert_eq!(backend.mutations(), before);
        assert!(engine.applied(&media()).await.exists);
    }
}
