// SPDX-License-Identifier: GPL-3.0-only

//! Startup reconciliation and lifecycle of the bus and engine.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use zshare_contracts::{BackendAdapter, ConfigStore};
use zshare_types::{ConfigEvent, DriftReport, EventKey, EventKindSet, KeyStatus};

use crate::bus::{BusConfig, EventBus, SubscriptionId};
use crate::engine::{ConvergeSummary, ReconciliationEngine, RetryPolicy, plan};
use crate::error::{BusError, Result};
use crate::model::{PoolModel, SharedModel};
use crate::spool::Spool;
use crate::status::StatusBoard;

/// Replayed spool events wait this long between attempts when a lane is full.
const REPLAY_DELAY: Duration = Duration::from_millis(50);
const REPLAY_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    pub bus: BusConfig,
    pub retry: RetryPolicy,
    /// Where undelivered events are written at shutdown. `None` drops them with a warning.
    pub spool_path: Option<PathBuf>,
    /// Also destroy undeclared datasets in managed pools. Their exports are
    /// withdrawn either way.
    pub prune_orphans: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    /// Differences found before any corrective action.
    pub drift: DriftReport,
    pub pools_created: Vec<String>,
    pub pools_failed: Vec<String>,
    pub summary: ConvergeSummary,
    pub replayed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub spooled: usize,
    pub dropped: usize,
}

/// Owns the event bus and the engine, and brings the backend in line with the
/// declared configuration before live events are accepted.
pub struct Supervisor {
    store: Arc<dyn ConfigStore>,
    engine: ReconciliationEngine,
    bus: EventBus,
    spool: Option<Spool>,
    prune_orphans: bool,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl Supervisor {
    pub fn new(
        backend: Arc<dyn BackendAdapter>,
        store: Arc<dyn ConfigStore>,
        config: SupervisorConfig,
    ) -> Self {
        let engine = ReconciliationEngine::new(
            backend,
            SharedModel::default(),
            StatusBoard::new(),
            config.retry,
        );

        Self {
            store,
            engine,
            bus: EventBus::new(config.bus),
            spool: config.spool_path.map(Spool::new),
            prune_orphans: config.prune_orphans,
            subscription: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn model(&self) -> &SharedModel {
        self.engine.model()
    }

    pub fn status(&self) -> &StatusBoard {
        self.engine.status()
    }

    /// Load the declared configuration, correct the backend, then start
    /// delivering events to the engine.
    pub async fn start(&self) -> Result<StartupReport> {
        let declared = self.store.load_declared().await?;
        let backend = self.engine.backend();
        tracing::info!(
            "Declared configuration: {} pool(s), {} dataset(s), {} share(s); backend {}",
            declared.pools.len(),
            declared.dataset_keys().len(),
            declared.shares.len(),
            backend.name()
        );

        let actual = backend.list_actual_state().await?;
        self.engine.model().replace(PoolModel::from_declared(&declared));
        {
            let mut model = self.engine.model().write();
            for pool in &actual.pools {
                if model.get(&pool.name).is_some() {
                    model.insert_pool(&pool.name, pool.health);
                    if !pool.health.is_usable() {
                        tracing::warn!("Pool {} is {:?}", pool.name, pool.health);
                    }
                }
            }
        }

        let drift = plan::drift(&self.engine.model().read(), &actual);
        if drift.is_clean() {
            tracing::info!("Backend matches the declared configuration");
        } else {
            tracing::info!(
                "Startup drift: {} missing / {} orphaned dataset(s), {} missing / {} orphaned / {} mismatched export(s)",
                drift.missing_datasets.len(),
                drift.orphaned_datasets.len(),
                drift.missing_exports.len(),
                drift.orphaned_exports.len(),
                drift.mismatched_exports.len()
            );
        }

        let mut report = StartupReport {
            drift,
            ..Default::default()
        };

        for pool in &declared.pools {
            if actual.has_pool(&pool.name) {
                continue;
            }
            match self.engine.ensure_pool(&pool.name, &pool.vdevs).await {
                Ok(()) => report.pools_created.push(pool.name.clone()),
                Err(error) => {
                    tracing::error!("Could not create declared pool {}: {}", pool.name, error);
                    report.pools_failed.push(pool.name.clone());
                }
            }
        }

        self.engine.adopt_actual(&actual, self.prune_orphans).await;
        report.summary = self.engine.converge_all().await;
        if !report.summary.failed.is_empty() {
            tracing::warn!(
                "{} dataset(s) did not converge at startup",
                report.summary.failed.len()
            );
        }

        self.subscribe();
        report.replayed = self.replay_spool().await?;

        tracing::info!(
            "Startup reconciliation done: {} dataset(s) converged",
            report.summary.converged
        );
        Ok(report)
    }

    fn subscribe(&self) {
        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if subscription.is_none() {
            *subscription = Some(
                self.bus
                    .subscribe(EventKindSet::all(), Arc::new(self.engine.clone())),
            );
        }
    }

    async fn replay_spool(&self) -> Result<usize> {
        let Some(spool) = &self.spool else {
            return Ok(0);
        };

        let events = spool.take().await?;
        if events.is_empty() {
            return Ok(0);
        }

        tracing::info!(
            "Replaying {} spooled event(s) from {}",
            events.len(),
            spool.path().display()
        );
        let mut replayed = 0;
        for event in events {
            match self
                .bus
                .publish_with_retry(event.clone(), REPLAY_ATTEMPTS, REPLAY_DELAY)
                .await
            {
                Ok(()) => replayed += 1,
                Err(error) => {
                    tracing::warn!(
                        "Could not replay {:?} event {} for {}: {}",
                        event.kind(),
                        event.id,
                        event.key(),
                        error
                    );
                }
            }
        }
        Ok(replayed)
    }

    pub fn publish(&self, event: ConfigEvent) -> std::result::Result<(), BusError> {
        self.bus.publish(event)
    }

    pub fn key_status(&self, key: &EventKey) -> Option<KeyStatus> {
        self.status().get(key)
    }

    pub fn all_status(&self) -> Vec<KeyStatus> {
        self.status().snapshot()
    }

    /// Compare the model with a fresh scan of the backend without changing anything.
    pub async fn detect_drift(&self) -> Result<DriftReport> {
        let actual = self.engine.backend().list_actual_state().await?;
        Ok(plan::drift(&self.engine.model().read(), &actual))
    }

    /// Drift between the declared configuration and the backend, computed
    /// before `start` and without touching the model.
    pub async fn preview(&self) -> Result<DriftReport> {
        let declared = self.store.load_declared().await?;
        let actual = self.engine.backend().list_actual_state().await?;
        Ok(plan::drift(&PoolModel::from_declared(&declared), &actual))
    }

    pub async fn resync(&self, key: &EventKey) -> ConvergeSummary {
        self.engine.resync(key).await
    }

    pub async fn resync_all(&self) -> ConvergeSummary {
        self.engine.resync(&EventKey::Service).await
    }

    /// Stop the bus, cancel retries and persist (or report) undelivered events.
    pub async fn shutdown(&self) -> ShutdownReport {
        tracing::info!("Shutting down reconciliation");
        let undelivered = self.bus.shutdown().await;
        self.engine.shutdown().await;

        let mut report = ShutdownReport::default();
        if undelivered.is_empty() {
            return report;
        }

        if let Some(spool) = &self.spool {
            match spool.append(&undelivered).await {
                Ok(()) => {
                    tracing::info!(
                        "Spooled {} undelivered event(s) to {}",
                        undelivered.len(),
                        spool.path().display()
                    );
                    report.spooled = undelivered.len();
                    return report;
                }
                Err(error) => {
                    tracing::error!("Could not write spool {}: {}", spool.path().display(), error);
                }
            }
        }

        for event in &undelivered {
            tracing::warn!(
                "Dropping undelivered {:?} event {} for {} (sequence {})",
                event.kind(),
                event.id,
                event.key(),
                event.sequence
            );
        }
        report.dropped = undelivered.len();
        report
    }
}
