// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use zshare_contracts::{BackendError, BackendErrorKind};
use zshare_reconcile::{BusConfig, BusError, RetryPolicy, SupervisorConfig};
use zshare_testing::fixtures::{
    dataset, dataset_created, dataset_deleted, declared, eventually, init_tracing, pool_created,
    pool_destroyed, share_created, supervisor, test_config,
};
use zshare_testing::{Call, MemoryBackend, Operation};
use zshare_types::{ErrorClass, EventKey, KeyState};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn permanent_failure_parks_the_key_until_resync() {
    init_tracing();
    let backend = MemoryBackend::new();
    let supervisor = supervisor(
        &backend,
        declared(&["tank/media"], &[]),
        test_config(Duration::from_millis(5), 3),
    );
    supervisor.start().await.unwrap();

    let media = dataset("tank/media");
    let key = EventKey::Dataset(media.clone());
    backend.fail_next(
        Operation::Bind,
        BackendError::new(BackendErrorKind::InvalidInput, "bad client"),
    );

    supervisor
        .publish(share_created(1, "tank/media", "media", "*"))
        .unwrap();
    supervisor.bus().wait_idle().await;

    let status = supervisor.key_status(&key).unwrap();
    assert_eq!(status.state, KeyState::Failed);
    let error = status.last_error.unwrap();
    assert_eq!(error.class, ErrorClass::PermanentBackend);
    assert!(error.message.contains("bad client"));
    assert_eq!(backend.calls_of(Operation::Bind).len(), 1);

    let summary = supervisor.resync(&key).await;
    assert_eq!(summary.converged, 1);
    assert_eq!(supervisor.status().state(&key), KeyState::Idle);
    assert!(backend.export(&media, "media").is_some());
}

#[tokio::test]
async fn injected_export_line_fails_the_key_without_exporting() {
    init_tracing();
    let backend = MemoryBackend::new();
    let supervisor = supervisor(
        &backend,
        declared(&["tank/media"], &[]),
        test_config(Duration::from_millis(5), 3),
    );
    supervisor.start().await.unwrap();

    let media = dataset("tank/media");
    let key = EventKey::Dataset(media.clone());
    supervisor
        .publish(share_created(1, "tank/media", "media", "10.0.0.1(ro)\n/ *"))
        .unwrap();
    supervisor.bus().wait_idle().await;

    let status = supervisor.key_status(&key).unwrap();
    assert_eq!(status.state, KeyState::Failed);
    assert_eq!(
        status.last_error.map(|report| report.class),
        Some(ErrorClass::PermanentBackend)
    );
    assert_eq!(backend.export(&media, "media"), None);
    assert!(backend.snapshot().exports.is_empty());
}

#[tokio::test]
async fn exhausted_retry_budget_fails_and_next_event_recovers() {
    init_tracing();
    let backend = MemoryBackend::new();
    let supervisor = supervisor(
        &backend,
        declared(&["tank/media"], &[]),
        test_config(Duration::from_millis(5), 3),
    );
    supervisor.start().await.unwrap();

    let key = EventKey::Dataset(dataset("tank/media"));
    backend.fail_times(Operation::Bind, 3, BackendError::busy("busy"));

    supervisor
        .publish(share_created(1, "tank/media", "media", "*"))
        .unwrap();
    assert!(eventually(WAIT, || supervisor.status().state(&key) == KeyState::Failed).await);

    let status = supervisor.key_status(&key).unwrap();
    assert_eq!(status.attempts, 3);
    assert_eq!(
        status.last_error.map(|report| report.class),
        Some(ErrorClass::TransientBackend)
    );
    assert_eq!(backend.calls_of(Operation::Bind).len(), 3);

    // A later event for the key clears the failure and tries again.
    supervisor
        .publish(share_created(2, "tank/media", "extra", "*"))
        .unwrap();
    supervisor.bus().wait_idle().await;

    assert_eq!(supervisor.status().state(&key), KeyState::Idle);
    assert_eq!(backend.snapshot().exports.len(), 2);
}

#[tokio::test]
async fn full_queue_is_reported_to_the_producer() {
    let backend = MemoryBackend::new();
    let supervisor = supervisor(
        &backend,
        declared(&["tank/media"], &[]),
        SupervisorConfig {
            bus: BusConfig {
                queue_capacity: 1,
                max_workers: 1,
                ..BusConfig::default()
            },
            ..test_config(Duration::from_millis(5), 3)
        },
    );
    supervisor.start().await.unwrap();

    // Nothing drains the lane until this task yields.
    supervisor
        .publish(share_created(1, "tank/media", "a", "*"))
        .unwrap();
    let error = supervisor
        .publish(share_created(1, "tank/media", "b", "*"))
        .unwrap_err();
    assert!(matches!(error, BusError::Backpressure { capacity: 1, .. }));

    supervisor.bus().wait_idle().await;
    supervisor
        .publish(share_created(1, "tank/media", "b", "*"))
        .unwrap();
    supervisor.bus().wait_idle().await;
    assert_eq!(backend.snapshot().exports.len(), 2);
}

#[tokio::test]
async fn queued_events_survive_a_restart_through_the_spool() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let settings = SupervisorConfig {
        spool_path: Some(dir.path().join("spool.jsonl")),
        ..test_config(Duration::from_millis(5), 3)
    };
    let config = declared(&["tank/media"], &[]);
    let media = dataset("tank/media");

    let backend = MemoryBackend::new();
    let first = supervisor(&backend, config.clone(), settings.clone());
    first.start().await.unwrap();

    backend.set_latency(Some(Duration::from_millis(100)));
    first
        .publish(share_created(1, "tank/media", "a", "*"))
        .unwrap();
    first
        .publish(share_created(1, "tank/media", "b", "*"))
        .unwrap();
    first
        .publish(share_created(1, "tank/media", "c", "*"))
        .unwrap();
    // Let the first event reach the backend.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = first.shutdown().await;
    assert_eq!(report.spooled, 2);
    assert_eq!(report.dropped, 0);
    assert!(backend.export(&media, "a").is_some());
    assert!(backend.export(&media, "b").is_none());
    assert!(first.publish(share_created(2, "tank/media", "d", "*")).is_err());

    backend.set_latency(None);
    let second = supervisor(&backend, config, settings);
    let startup = second.start().await.unwrap();
    assert_eq!(startup.replayed, 2);
    second.bus().wait_idle().await;

    assert!(backend.export(&media, "b").is_some());
    assert!(backend.export(&media, "c").is_some());
}

#[tokio::test]
async fn dataset_deletion_withdraws_exports_first() {
    let backend = MemoryBackend::new();
    let supervisor = supervisor(
        &backend,
        declared(&[], &[("tank/media", "media", "*"), ("tank/media", "guests", "*")]),
        test_config(Duration::from_millis(5), 3),
    );
    supervisor.start().await.unwrap();
    backend.take_calls();

    let media = dataset("tank/media");
    supervisor.publish(dataset_deleted(1, "tank/media")).unwrap();
    supervisor.bus().wait_idle().await;

    let calls = backend.take_calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2], Call::DestroyDataset(media.clone()));
    assert!(calls[..2].iter().all(|call| call.operation() == Operation::Unbind));
    assert!(supervisor.model().read().dataset(&media).is_none());
}

#[tokio::test]
async fn pool_lifecycle_events_run_exclusively() {
    init_tracing();
    let backend = MemoryBackend::new();
    let supervisor = supervisor(
        &backend,
        declared(&[], &[]),
        test_config(Duration::from_millis(5), 3),
    );
    supervisor.start().await.unwrap();

    supervisor
        .publish(pool_created(1, "tank", &["/dev/sdb"]))
        .unwrap();
    supervisor.bus().wait_idle().await;
    supervisor.publish(dataset_created(1, "tank/media")).unwrap();
    supervisor
        .publish(share_created(1, "tank/media", "media", "*"))
        .unwrap();
    supervisor.bus().wait_idle().await;
    assert_eq!(backend.snapshot().exports.len(), 1);

    supervisor.publish(pool_destroyed(2, "tank")).unwrap();
    supervisor.bus().wait_idle().await;

    let state = backend.snapshot();
    assert!(state.pools.is_empty());
    assert!(state.exports.is_empty());
    assert!(supervisor.model().read().get("tank").is_none());
    assert_eq!(
        supervisor
            .status()
            .state(&EventKey::Pool("tank".to_string())),
        KeyState::Idle
    );

    let calls = backend.calls();
    let unbind = calls
        .iter()
        .position(|call| call.operation() == Operation::Unbind)
        .unwrap();
    let destroy = calls
        .iter()
        .position(|call| call == &Call::DestroyPool("tank".to_string()))
        .unwrap();
    assert!(unbind < destroy);
}

#[tokio::test]
async fn transient_pool_failures_are_retried_inline() {
    let backend = MemoryBackend::new();
    let supervisor = supervisor(
        &backend,
        declared(&[], &[]),
        SupervisorConfig {
            retry: RetryPolicy::fixed(Duration::from_millis(1), 4),
            ..test_config(Duration::from_millis(1), 4)
        },
    );
    supervisor.start().await.unwrap();
    backend.fail_times(Operation::CreatePool, 2, BackendError::busy("pool busy"));

    supervisor
        .publish(pool_created(1, "tank", &["/dev/sdb"]))
        .unwrap();
    supervisor.bus().wait_idle().await;

    assert_eq!(backend.calls_of(Operation::CreatePool).len(), 3);
    assert!(backend.snapshot().has_pool("tank"));
}

#[tokio::test]
async fn preview_reports_drift_without_mutating() {
    let backend = MemoryBackend::with_state(zshare_types::ActualState {
        pools: Vec::new(),
        datasets: [dataset("tank/stale")].into(),
        exports: Vec::new(),
    });
    let supervisor = supervisor(
        &backend,
        declared(&[], &[("tank/media", "media", "*")]),
        test_config(Duration::from_millis(5), 3),
    );

    let drift = supervisor.preview().await.unwrap();
    assert_eq!(drift.missing_datasets, vec![dataset("tank/media")]);
    assert_eq!(drift.orphaned_datasets, vec![dataset("tank/stale")]);
    assert_eq!(drift.missing_exports.len(), 1);
    assert!(backend.calls().iter().all(|call| !call.is_mutation()));
    assert!(supervisor.model().read().pools().next().is_none());
}
