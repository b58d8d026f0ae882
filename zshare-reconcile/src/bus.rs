// SPDX-License-Identifier: GPL-3.0-only

//! Keyed event bus.
//!
//! Every [`EventKey`] gets its own bounded queue drained by a dedicated lane
//! task, so events sharing a key are handled strictly in publish order while
//! different keys proceed in parallel, bounded by a shared worker semaphore.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use zshare_types::{ConfigEvent, ErrorClass, EventKey, EventKindSet};

use crate::error::{BusError, ReconcileError};

/// A consumer of configuration events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &ConfigEvent) -> Result<(), ReconcileError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events buffered per key before publishers get backpressure.
    pub queue_capacity: usize,
    /// Events handled concurrently across all keys.
    pub max_workers: usize,
    /// A lane with nothing queued for this long is closed and its task ends.
    pub lane_idle_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_workers: 8,
            lane_idle_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kinds: EventKindSet,
    handler: Arc<dyn EventHandler>,
}

struct Shared {
    config: BusConfig,
    subscribers: RwLock<Vec<Subscription>>,
    lanes: Mutex<HashMap<EventKey, mpsc::Sender<ConfigEvent>>>,
    tasks: Mutex<JoinSet<Vec<ConfigEvent>>>,
    workers: Semaphore,
    shutdown: CancellationToken,
    in_flight: AtomicUsize,
    idle: Notify,
    next_subscription: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Close an idle lane. Publishers send under the lanes lock, so an empty
    /// queue seen here stays empty.
    fn retire_lane(&self, key: &EventKey, receiver: &mpsc::Receiver<ConfigEvent>) -> bool {
        let mut lanes = lock(&self.lanes);
        if !receiver.is_empty() || self.shutdown.is_cancelled() {
            return false;
        }
        lanes.remove(key);
        tracing::debug!("Closed idle event lane for {}", key);
        true
    }

    fn handlers_for(&self, event: &ConfigEvent) -> Vec<Arc<dyn EventHandler>> {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|subscription| subscription.kinds.contains(event.kind()))
            .map(|subscription| subscription.handler.clone())
            .collect()
    }

    async fn dispatch(&self, key: &EventKey, event: &ConfigEvent) {
        let handlers = self.handlers_for(event);
        if handlers.is_empty() {
            tracing::debug!("No subscriber for {:?} on {}", event.kind(), key);
            return;
        }

        let Ok(_permit) = self.workers.acquire().await else {
            return;
        };

        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) if error.class() == ErrorClass::StaleEvent => {
                    tracing::debug!("{} skipped event {}: {}", handler.name(), event.id, error);
                }
                Ok(Err(error)) => {
                    tracing::error!(
                        "{} failed on {:?} event {} for {}: {}",
                        handler.name(),
                        event.kind(),
                        event.id,
                        key,
                        error
                    );
                }
                Err(_) => {
                    tracing::error!(
                        "{} panicked on {:?} event {} for {}",
                        handler.name(),
                        event.kind(),
                        event.id,
                        key
                    );
                }
            }
        }
    }
}

async fn run_lane(
    shared: Arc<Shared>,
    key: EventKey,
    mut receiver: mpsc::Receiver<ConfigEvent>,
) -> Vec<ConfigEvent> {
    let idle = Duration::from_millis(shared.config.lane_idle_ms);
    loop {
        let event = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => Some(event),
                None => break,
            },
            _ = tokio::time::sleep(idle) => None,
        };
        let Some(event) = event else {
            if shared.retire_lane(&key, &receiver) {
                return Vec::new();
            }
            continue;
        };

        shared.dispatch(&key, &event).await;
        shared.finish_one();
    }

    receiver.close();
    let mut undelivered = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        undelivered.push(event);
        shared.finish_one();
    }

    if !undelivered.is_empty() {
        tracing::debug!("Lane {} stopped with {} queued events", key, undelivered.len());
    }
    undelivered
}

/// Handle to the bus. Clones share the same queues and subscribers.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let workers = Semaphore::new(config.max_workers.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                subscribers: RwLock::new(Vec::new()),
                lanes: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
                workers,
                shutdown: CancellationToken::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Register `handler` for the given event kinds.
    pub fn subscribe(&self, kinds: EventKindSet, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("Subscribing {} as {:?}", handler.name(), id);
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Subscription { id, kinds, handler });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .shared
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscribers.len();
        subscribers.retain(|subscription| subscription.id != id);
        subscribers.len() != before
    }

    fn spawn_lane(&self, key: &EventKey) -> mpsc::Sender<ConfigEvent> {
        let (sender, receiver) = mpsc::channel(self.shared.config.queue_capacity.max(1));
        let mut tasks = lock(&self.shared.tasks);
        // Retired lanes have nothing to hand back.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(run_lane(self.shared.clone(), key.clone(), receiver));
        tracing::debug!("Opened event lane for {}", key);
        sender
    }

    /// Enqueue an event on its key's lane without waiting.
    ///
    /// A full lane is reported as [`BusError::Backpressure`]; the event is not
    /// queued and the producer should retry later.
    pub fn publish(&self, event: ConfigEvent) -> Result<(), BusError> {
        let key = event.key();

        // Sending under the lock keeps an idle lane from closing underneath us.
        let sent = {
            let mut lanes = lock(&self.shared.lanes);
            if self.shared.shutdown.is_cancelled() {
                return Err(BusError::Closed);
            }
            let sender = lanes
                .entry(key.clone())
                .or_insert_with(|| self.spawn_lane(&key));
            self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
            sender.try_send(event)
        };

        match sent {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                self.shared.finish_one();
                tracing::warn!(
                    "Queue for {} is full, rejecting event {} (sequence {})",
                    key,
                    event.id,
                    event.sequence
                );
                Err(BusError::Backpressure {
                    key,
                    capacity: self.shared.config.queue_capacity,
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.finish_one();
                Err(BusError::Closed)
            }
        }
    }

    /// Publish, waiting out backpressure up to `attempts` times.
    pub async fn publish_with_retry(
        &self,
        event: ConfigEvent,
        attempts: u32,
        delay: Duration,
    ) -> Result<(), BusError> {
        let mut tries = 0;
        loop {
            match self.publish(event.clone()) {
                Err(BusError::Backpressure { .. }) if tries + 1 < attempts => {
                    tries += 1;
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Lanes currently open.
    pub fn open_lanes(&self) -> usize {
        lock(&self.shared.lanes).len()
    }

    /// Events accepted but not yet fully handled.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Wait until every accepted event has been handled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stop accepting events, let in-progress handlers finish and return every
    /// event that was queued but never delivered.
    pub async fn shutdown(&self) -> Vec<ConfigEvent> {
        {
            let mut lanes = lock(&self.shared.lanes);
            self.shared.shutdown.cancel();
            lanes.clear();
        }

        let mut tasks = std::mem::take(&mut *lock(&self.shared.tasks));
        let mut undelivered = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(events) => undelivered.extend(events),
                Err(error) => tracing::error!("Event lane task failed: {}", error),
            }
        }

        undelivered
    }
}
