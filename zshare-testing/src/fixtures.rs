// SPDX-License-Identifier: GPL-3.0-only

//! Event builders and helpers shared by the integration tests.

use std::sync::Arc;
use std::time::Duration;

use zshare_reconcile::{BusConfig, RetryPolicy, Supervisor, SupervisorConfig};
use zshare_types::{
    ConfigEvent, DatasetKey, DeclaredConfig, DeclaredPool, DeclaredShare, EventPayload,
    ExportOptions, ExportOptionsPatch,
};

use crate::backend::MemoryBackend;
use crate::store::StaticConfigStore;

/// `"tank/media"` style names; a bare pool name is its root dataset.
pub fn dataset(name: &str) -> DatasetKey {
    let (pool, path) = name.split_once('/').unwrap_or((name, ""));
    DatasetKey::new(pool, path)
}

pub fn share_created(sequence: u64, name: &str, export: &str, client: &str) -> ConfigEvent {
    ConfigEvent::new(
        sequence,
        EventPayload::ShareCreated {
            dataset: dataset(name),
            export: export.to_string(),
            options: ExportOptions::for_client(client),
        },
    )
}

pub fn share_updated(
    sequence: u64,
    name: &str,
    export: &str,
    patch: ExportOptionsPatch,
) -> ConfigEvent {
    ConfigEvent::new(
        sequence,
        EventPayload::ShareUpdated {
            dataset: dataset(name),
            export: export.to_string(),
            patch,
        },
    )
}

pub fn share_deleted(sequence: u64, name: &str, export: &str) -> ConfigEvent {
    ConfigEvent::new(
        sequence,
        EventPayload::ShareDeleted {
            dataset: dataset(name),
            export: export.to_string(),
        },
    )
}

pub fn dataset_created(sequence: u64, name: &str) -> ConfigEvent {
    ConfigEvent::new(
        sequence,
        EventPayload::DatasetCreated {
            dataset: dataset(name),
        },
    )
}

pub fn dataset_deleted(sequence: u64, name: &str) -> ConfigEvent {
    ConfigEvent::new(
        sequence,
        EventPayload::DatasetDeleted {
            dataset: dataset(name),
        },
    )
}

pub fn service_updated(sequence: u64, enabled: bool) -> ConfigEvent {
    ConfigEvent::new(sequence, EventPayload::ServiceUpdated { enabled })
}

pub fn pool_created(sequence: u64, pool: &str, vdevs: &[&str]) -> ConfigEvent {
    ConfigEvent::new(
        sequence,
        EventPayload::PoolCreated {
            pool: pool.to_string(),
            vdevs: vdevs.iter().map(ToString::to_string).collect(),
        },
    )
}

pub fn pool_destroyed(sequence: u64, pool: &str) -> ConfigEvent {
    ConfigEvent::new(
        sequence,
        EventPayload::PoolDestroyed {
            pool: pool.to_string(),
        },
    )
}

/// Declared configuration from `(dataset, export, client)` triples plus bare datasets.
pub fn declared(datasets: &[&str], shares: &[(&str, &str, &str)]) -> DeclaredConfig {
    let mut pools: Vec<String> = datasets
        .iter()
        .chain(shares.iter().map(|(name, _, _)| name))
        .map(|name| dataset(name).pool)
        .collect();
    pools.sort();
    pools.dedup();

    DeclaredConfig {
        service_enabled: true,
        pools: pools
            .into_iter()
            .map(|name| DeclaredPool {
                name,
                vdevs: Vec::new(),
            })
            .collect(),
        datasets: datasets.iter().map(|name| dataset(name)).collect(),
        shares: shares
            .iter()
            .map(|(name, export, client)| DeclaredShare {
                dataset: dataset(name),
                export: export.to_string(),
                options: ExportOptions::for_client(*client),
            })
            .collect(),
    }
}

/// Supervisor config with short retry delays.
pub fn test_config(retry_delay: Duration, max_attempts: u32) -> SupervisorConfig {
    SupervisorConfig {
        bus: BusConfig {
            queue_capacity: 16,
            max_workers: 4,
            ..BusConfig::default()
        },
        retry: RetryPolicy::fixed(retry_delay, max_attempts),
        spool_path: None,
        prune_orphans: true,
    }
}

pub fn supervisor(
    backend: &MemoryBackend,
    config: DeclaredConfig,
    settings: SupervisorConfig,
) -> Supervisor {
    Supervisor::new(
        Arc::new(backend.clone()),
        Arc::new(StaticConfigStore::new(config)),
        settings,
    )
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Route test logs through the test harness. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("zshare=debug,warn")),
        )
        .with_test_writer()
        .try_init();
}
