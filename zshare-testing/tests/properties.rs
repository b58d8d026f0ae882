// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeSet;
use std::time::Duration;

use zshare_contracts::BackendError;
use zshare_reconcile::SupervisorConfig;
use zshare_testing::fixtures::{
    dataset, dataset_created, declared, eventually, init_tracing, share_created, share_deleted,
    share_updated, supervisor, test_config,
};
use zshare_testing::{Call, MemoryBackend, Operation};
use zshare_types::{
    ActualExport, ActualState, EventKey, ExportOptions, ExportOptionsPatch, KeyState,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn duplicate_share_created_binds_once() {
    init_tracing();
    let backend = MemoryBackend::new();
    let supervisor = supervisor(
        &backend,
        declared(&["tank/media"], &[]),
        test_config(Duration::from_millis(5), 3),
    );
    supervisor.start().await.unwrap();
    backend.take_calls();

    let event = share_created(1, "tank/media", "media", "10.0.0.0/24");
    supervisor.publish(event.clone()).unwrap();
    supervisor.publish(event).unwrap();
    supervisor.bus().wait_idle().await;

    let model = supervisor.model().read();
    assert_eq!(model.dataset(&dataset("tank/media")).unwrap().bindings.len(), 1);
    assert_eq!(backend.calls_of(Operation::Bind).len(), 1);
    assert_eq!(backend.snapshot().exports.len(), 1);
}

#[tokio::test]
async fn older_sequence_never_overwrites_newer() {
    init_tracing();
    let backend = MemoryBackend::new();
    let supervisor = supervisor(
        &backend,
        declared(&["tank/media"], &[]),
        test_config(Duration::from_millis(5), 3),
    );
    supervisor.start().await.unwrap();

    supervisor
        .publish(share_created(5, "tank/media", "media", "10.0.0.5"))
        .unwrap();
    supervisor
        .publish(share_created(3, "tank/media", "media", "10.0.0.3"))
        .unwrap();
    supervisor
        .publish(share_deleted(4, "tank/media", "media"))
        .unwrap();
    supervisor.bus().wait_idle().await;

    let media = dataset("tank/media");
    assert_eq!(
        backend.export(&media, "media").map(|options| options.client),
        Some("10.0.0.5".to_string())
    );
    let model = supervisor.model().read();
    let binding = model.dataset(&media).unwrap().binding("media").unwrap();
    assert_eq!(binding.options.client, "10.0.0.5");
    assert_eq!(binding.sequence, 5);

    let status = supervisor.key_status(&EventKey::Dataset(media.clone())).unwrap();
    assert_eq!(status.last_sequence, Some(5));
    assert_eq!(status.state, KeyState::Idle);
}

#[tokio::test]
async fn retry_applies_events_that_arrived_during_backoff() {
    init_tracing();
    let backend = MemoryBackend::new();
    let supervisor = supervisor(
        &backend,
        declared(&["tank/media"], &[]),
        test_config(Duration::from_millis(200), 5),
    );
    supervisor.start().await.unwrap();
    backend.take_calls();

    let media = dataset("tank/media");
    let key = EventKey::Dataset(media.clone());
    backend.fail_next(Operation::Bind, BackendError::busy("dataset is busy"));

    supervisor
        .publish(share_created(1, "tank/media", "media", "10.0.0.1"))
        .unwrap();
    assert!(
        eventually(WAIT, || supervisor.status().state(&key) == KeyState::Retrying).await
    );

    supervisor
        .publish(share_updated(
            2,
            "tank/media",
            "media",
            ExportOptionsPatch {
                client: Some("10.0.0.2".to_string()),
                ..Default::default()
            },
        ))
        .unwrap();
    supervisor.bus().wait_idle().await;
    assert_eq!(supervisor.status().state(&key), KeyState::Retrying);

    assert!(
        eventually(WAIT, || supervisor.status().state(&key) == KeyState::Idle).await
    );

    let clients: Vec<String> = backend
        .calls_of(Operation::Bind)
        .into_iter()
        .filter_map(|call| match call {
            Call::Bind(_, _, options) => Some(options.client),
            _ => None,
        })
        .collect();
    assert_eq!(clients, vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(
        backend.export(&media, "media").map(|options| options.client),
        Some("10.0.0.2".to_string())
    );
}

#[tokio::test]
async fn startup_converges_backend_to_declared_configuration() {
    init_tracing();
    let a = dataset("tank/a");
    let b = dataset("tank/b");
    let c = dataset("tank/c");

    let backend = MemoryBackend::with_state(ActualState {
        pools: Vec::new(),
        datasets: [a.clone(), c.clone()].into(),
        exports: vec![ActualExport {
            dataset: c.clone(),
            name: "old".to_string(),
            options: ExportOptions::default(),
        }],
    });
    let supervisor = supervisor(
        &backend,
        declared(&[], &[("tank/a", "a", "10.0.0.0/24"), ("tank/b", "b", "*")]),
        test_config(Duration::from_millis(5), 3),
    );

    let report = supervisor.start().await.unwrap();
    assert_eq!(report.drift.missing_datasets, vec![b.clone()]);
    assert_eq!(report.drift.orphaned_datasets, vec![c.clone()]);
    assert!(report.summary.failed.is_empty());

    let state = backend.snapshot();
    assert_eq!(state.datasets, BTreeSet::from([a.clone(), b.clone()]));
    let exports: BTreeSet<(String, String, String)> = state
        .exports
        .iter()
        .map(|export| {
            (
                export.dataset.name(),
                export.name.clone(),
                export.options.client.clone(),
            )
        })
        .collect();
    assert_eq!(
        exports,
        BTreeSet::from([
            ("tank/a".to_string(), "a".to_string(), "10.0.0.0/24".to_string()),
            ("tank/b".to_string(), "b".to_string(), "*".to_string()),
        ])
    );

    // The orphan's export is withdrawn before the dataset goes away.
    let calls = backend.calls();
    let unbind = calls
        .iter()
        .position(|call| call == &Call::Unbind(c.clone(), "old".to_string()))
        .unwrap();
    let destroy = calls
        .iter()
        .position(|call| call == &Call::DestroyDataset(c.clone()))
        .unwrap();
    assert!(unbind < destroy);

    assert!(supervisor.detect_drift().await.unwrap().is_clean());
}

#[tokio::test]
async fn startup_withdraws_undeclared_exports_but_keeps_their_datasets() {
    init_tracing();
    let a = dataset("tank/a");
    let c = dataset("tank/c");

    let backend = MemoryBackend::with_state(ActualState {
        pools: Vec::new(),
        datasets: [a.clone(), c.clone()].into(),
        exports: vec![ActualExport {
            dataset: c.clone(),
            name: "old".to_string(),
            options: ExportOptions::default(),
        }],
    });
    let supervisor = supervisor(
        &backend,
        declared(&[], &[("tank/a", "a", "10.0.0.0/24")]),
        SupervisorConfig {
            prune_orphans: false,
            ..test_config(Duration::from_millis(5), 3)
        },
    );

    let report = supervisor.start().await.unwrap();
    assert!(report.summary.failed.is_empty());

    let state = backend.snapshot();
    assert_eq!(state.datasets, BTreeSet::from([a.clone(), c.clone()]));
    assert!(state.exports.iter().all(|export| export.dataset == a));
    assert_eq!(state.exports.len(), 1);

    let calls = backend.calls();
    assert!(calls.contains(&Call::Unbind(c.clone(), "old".to_string())));
    assert!(!calls.contains(&Call::DestroyDataset(c.clone())));

    // Only the kept dataset remains as drift.
    let drift = supervisor.detect_drift().await.unwrap();
    assert_eq!(drift.orphaned_datasets, vec![c]);
    assert!(drift.orphaned_exports.is_empty());
}

#[tokio::test]
async fn held_binding_is_applied_once_the_dataset_is_created() {
    init_tracing();
    let backend = MemoryBackend::new();
    let mut config = declared(&[], &[]);
    config.pools.push(zshare_types::DeclaredPool {
        name: "tank".to_string(),
        vdevs: Vec::new(),
    });
    let supervisor = supervisor(&backend, config, test_config(Duration::from_millis(5), 3));
    supervisor.start().await.unwrap();
    backend.take_calls();

    let x = dataset("tank/x");
    supervisor
        .publish(share_created(1, "tank/x", "x", "*"))
        .unwrap();
    supervisor.bus().wait_idle().await;

    assert!(backend.calls().iter().all(|call| !call.is_mutation()));
    assert_eq!(supervisor.engine().held_bindings(&x).len(), 1);

    supervisor.publish(dataset_created(1, "tank/x")).unwrap();
    supervisor.bus().wait_idle().await;

    assert_eq!(
        backend.take_calls(),
        vec![
            Call::CreateDataset(x.clone()),
            Call::Bind(x.clone(), "x".to_string(), ExportOptions::for_client("*")),
        ]
    );
    assert!(supervisor.engine().held_bindings(&x).is_empty());
    let status = supervisor.key_status(&EventKey::Dataset(x)).unwrap();
    assert_eq!(status.state, KeyState::Idle);
    assert!(status.last_error.is_none());
}
