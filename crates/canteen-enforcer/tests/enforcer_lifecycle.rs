//! Enforcer actor over the in-memory runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use canteen_enforcer::anchor::anchor_status_once;
use canteen_enforcer::{
    ContainerRuntime, EnforcerConfig, EnforcerError, EnforcerHandle, MemoryRuntime, RescheduleSignal,
    SupervisorConfig, spawn,
};
use canteen_ledger::retry::fast;
use canteen_ledger::{LedgerClient, LedgerSync, StoreLedger, SyncConfig};
use canteen_state::{
    ContainerState, DeploymentAssignment, LedgerEventKind, StateStore, StatusUpdate,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Harness {
    handle: EnforcerHandle,
    runtime: MemoryRuntime,
    store: StateStore,
    status_rx: mpsc::Receiver<StatusUpdate>,
    reschedule_rx: mpsc::Receiver<RescheduleSignal>,
    actor: JoinHandle<()>,
}

fn config(node_id: &str) -> EnforcerConfig {
    EnforcerConfig {
        node_id: node_id.into(),
        port_base: 0,
        container_port: None,
        supervisor: SupervisorConfig {
            pull_retries: 2,
            retry_backoff: Duration::from_millis(1),
            max_restarts: 1,
            unhealthy_threshold: 1,
            health_interval: Duration::from_millis(10),
            ..SupervisorConfig::default()
        },
        sweep_interval: Duration::from_millis(20),
        terminal_retention: Duration::from_secs(3600),
    }
}

fn start_with(runtime: MemoryRuntime, store: StateStore) -> Harness {
    start_custom(config("node-a"), runtime, store, 16)
}

fn start_custom(
    config: EnforcerConfig,
    runtime: MemoryRuntime,
    store: StateStore,
    reschedule_capacity: usize,
) -> Harness {
    let (status_tx, status_rx) = mpsc::channel(256);
    let (reschedule_tx, reschedule_rx) = mpsc::channel(reschedule_capacity);
    let (handle, actor) = spawn(
        config,
        Arc::new(runtime.clone()),
        store.clone(),
        status_tx,
        reschedule_tx,
    );
    Harness {
        handle,
        runtime,
        store,
        status_rx,
        reschedule_rx,
        actor,
    }
}

fn start() -> Harness {
    start_with(MemoryRuntime::new(), StateStore::open_in_memory().unwrap())
}

fn assignment(request_id: &str, image: &str, placements: &[(&str, u32)]) -> DeploymentAssignment {
    let placements: BTreeMap<String, u32> =
        placements.iter().map(|(n, c)| (n.to_string(), *c)).collect();
    DeploymentAssignment {
        request_id: request_id.into(),
        image: image.into(),
        commitment: canteen_state::CommitmentHash("test".into()),
        placements,
    }
}

async fn wait_states(handle: &EnforcerHandle, want: ContainerState, count: usize) {
    for _ in 0..250 {
        let records = handle.list().await.unwrap();
        if records.iter().filter(|r| r.state == want).count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} containers in {want}");
}

#[tokio::test]
async fn applies_only_this_nodes_share() {
    let h = start();
    let started = h
        .handle
        .apply_assignment(assignment("req-1", "nginx", &[("node-a", 2), ("node-b", 1)]))
        .await
        .unwrap();
    assert_eq!(started, 2);
    wait_states(&h.handle, ContainerState::Healthy, 2).await;
    assert_eq!(h.runtime.running_count("nginx"), 2);
    assert_eq!(h.handle.active_count().await.unwrap(), 2);

    let none = h
        .handle
        .apply_assignment(assignment("req-2", "redis", &[("node-b", 3)]))
        .await
        .unwrap();
    assert_eq!(none, 0);
}

#[tokio::test]
async fn reapplying_is_idempotent() {
    let h = start();
    let a = assignment("req-1", "nginx", &[("node-a", 1)]);
    assert_eq!(h.handle.apply_assignment(a.clone()).await.unwrap(), 1);
    assert_eq!(h.handle.apply_assignment(a).await.unwrap(), 0);
    wait_states(&h.handle, ContainerState::Healthy, 1).await;
    assert_eq!(h.runtime.running_count("nginx"), 1);
}

#[tokio::test]
async fn remove_image_stops_replicas() {
    let h = start();
    h.handle
        .apply_assignment(assignment("req-1", "nginx", &[("node-a", 2)]))
        .await
        .unwrap();
    h.handle
        .apply_assignment(assignment("req-2", "redis", &[("node-a", 1)]))
        .await
        .unwrap();
    wait_states(&h.handle, ContainerState::Healthy, 3).await;

    assert_eq!(h.handle.remove_image("nginx").await.unwrap(), 2);
    wait_states(&h.handle, ContainerState::Stopped, 2).await;
    assert_eq!(h.runtime.running_count("nginx"), 0);
    assert_eq!(h.runtime.running_count("redis"), 1);
    assert_eq!(h.handle.active_count().await.unwrap(), 1);
}

#[tokio::test]
async fn exhausted_pulls_fail_and_signal_reschedule() {
    let mut h = start();
    h.runtime.fail_pulls("broken", 5);
    h.handle
        .apply_assignment(assignment("req-9", "broken", &[("node-a", 1)]))
        .await
        .unwrap();

    let signal = tokio::time::timeout(Duration::from_secs(5), h.reschedule_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(signal.container_key, "req-9/0");
    assert_eq!(signal.image, "broken");
    assert!(signal.reason.contains("pull failed"));

    let record = h.store.get_container("req-9/0").unwrap().unwrap();
    assert_eq!(record.state, ContainerState::Failed);
}

#[tokio::test]
async fn unhealthy_container_restarts_then_fails() {
    let mut h = start();
    h.runtime.set_unhealthy("flaky", true);
    h.handle
        .apply_assignment(assignment("req-3", "flaky", &[("node-a", 1)]))
        .await
        .unwrap();

    let signal = tokio::time::timeout(Duration::from_secs(5), h.reschedule_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(signal.reason.contains("unhealthy"));
    let record = h.store.get_container("req-3/0").unwrap().unwrap();
    assert_eq!(record.restarts, 1);
    assert_eq!(h.runtime.running_count("flaky"), 0);
}

#[tokio::test]
async fn transitions_are_published_in_order() {
    let mut h = start();
    h.handle
        .apply_assignment(assignment("req-1", "nginx", &[("node-a", 1)]))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while seen.last() != Some(&ContainerState::Healthy) {
        let update = tokio::time::timeout(Duration::from_secs(5), h.status_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.node_id, "node-a");
        seen.push(update.state);
    }
    assert_eq!(
        seen,
        vec![ContainerState::Pulling, ContainerState::Running, ContainerState::Healthy]
    );
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let h = start();
    h.handle
        .apply_assignment(assignment("req-1", "nginx", &[("node-a", 3)]))
        .await
        .unwrap();
    wait_states(&h.handle, ContainerState::Healthy, 3).await;

    h.handle.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(h.runtime.running().is_empty());
    let records = h.store.list_containers().unwrap();
    assert!(records.iter().all(|r| r.state == ContainerState::Stopped));
    assert!(h.handle.list().await.is_err());
}

#[tokio::test]
async fn restart_cleans_exited_and_resumes_active() {
    let store = StateStore::open_in_memory().unwrap();
    let runtime = MemoryRuntime::new();
    {
        let h = start_with(runtime.clone(), store.clone());
        h.handle
            .apply_assignment(assignment("req-1", "nginx", &[("node-a", 1)]))
            .await
            .unwrap();
        wait_states(&h.handle, ContainerState::Healthy, 1).await;
        // Crash: the actor dies without draining its supervisors.
        h.actor.abort();
        let _ = h.actor.await;
    }
    runtime.add_exited(2);

    let h = start_with(runtime.clone(), store);
    wait_states(&h.handle, ContainerState::Healthy, 1).await;
    assert_eq!(runtime.cleanup_exited().await.unwrap(), 0);
}

#[tokio::test]
async fn status_digest_anchors_only_on_change() {
    let h = start();
    let ledger = StoreLedger::new(StateStore::open_in_memory().unwrap());
    let sync = LedgerSync::new(
        Arc::new(ledger.clone()),
        StateStore::open_in_memory().unwrap(),
        SyncConfig {
            retry: fast(),
            ..SyncConfig::default()
        },
    );
    h.handle
        .apply_assignment(assignment("req-1", "nginx", &[("node-a", 1)]))
        .await
        .unwrap();
    wait_states(&h.handle, ContainerState::Healthy, 1).await;

    let first = anchor_status_once(&h.handle, &sync, "node-a", None).await;
    assert!(first.is_some());
    let again = anchor_status_once(&h.handle, &sync, "node-a", first.as_ref()).await;
    assert_eq!(again, first);

    let events = ledger.events_since(0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0].kind, LedgerEventKind::StatusAnchored { .. }));
}

#[tokio::test]
async fn port_exhaustion_mid_apply_still_launches_the_rest() {
    let base = 23_400;
    let free = base + 5;
    // Hold every port of the search span except one.
    let _held: Vec<TcpListener> = (base..base + 100)
        .filter(|p| *p != free)
        .filter_map(|p| TcpListener::bind(("0.0.0.0", p)).ok())
        .collect();
    let mut config = config("node-a");
    config.port_base = base;
    config.container_port = Some(80);
    let mut h = start_custom(
        config,
        MemoryRuntime::new(),
        StateStore::open_in_memory().unwrap(),
        16,
    );

    let err = h
        .handle
        .apply_assignment(assignment("req-1", "nginx", &[("node-a", 4)]))
        .await
        .unwrap_err();
    match err {
        EnforcerError::PartialApply {
            failed, requested, ..
        } => {
            assert_eq!(failed, 3);
            assert_eq!(requested, 4);
        }
        other => panic!("unexpected error: {other}"),
    }

    let records = h.store.list_containers().unwrap();
    assert_eq!(records.len(), 4);
    let failed: Vec<_> = records
        .iter()
        .filter(|r| r.state == ContainerState::Failed)
        .collect();
    assert_eq!(failed.len(), 3);
    assert!(failed.iter().all(|r| r.reschedule_pending));
    wait_states(&h.handle, ContainerState::Healthy, 1).await;
    let healthy = h
        .store
        .list_containers()
        .unwrap()
        .into_iter()
        .find(|r| r.state == ContainerState::Healthy)
        .unwrap();
    assert_eq!(healthy.host_port, Some(free));

    let mut signalled = BTreeSet::new();
    while signalled.len() < 3 {
        let signal = tokio::time::timeout(Duration::from_secs(5), h.reschedule_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.slot.node_id, "node-a");
        assert!(signal.reason.contains("no free host port"));
        signalled.insert(signal.container_key);
    }

    // Re-applying only fills slots without a record.
    let again = h
        .handle
        .apply_assignment(assignment("req-1", "nginx", &[("node-a", 4)]))
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn full_reschedule_channel_delivers_every_signal_eventually() {
    let runtime = MemoryRuntime::new();
    runtime.fail_pulls("broken", 100);
    let mut h = start_custom(
        config("node-a"),
        runtime,
        StateStore::open_in_memory().unwrap(),
        1,
    );
    h.handle
        .apply_assignment(assignment("req-4", "broken", &[("node-a", 3)]))
        .await
        .unwrap();
    wait_states(&h.handle, ContainerState::Failed, 3).await;

    let mut keys = BTreeSet::new();
    while keys.len() < 3 {
        let signal = tokio::time::timeout(Duration::from_secs(5), h.reschedule_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.slot.container_key(), signal.container_key);
        keys.insert(signal.container_key);
    }
    assert_eq!(
        keys.into_iter().collect::<Vec<_>>(),
        vec!["req-4/0", "req-4/1", "req-4/2"]
    );

    for index in 0..3 {
        let key = format!("req-4/{index}");
        assert!(h.handle.reschedule_submitted(&key).await.unwrap());
        assert!(!h.store.get_container(&key).unwrap().unwrap().reschedule_pending);
    }
    assert!(!h.handle.reschedule_submitted("req-4/9").await.unwrap());

    // Acknowledged replicas are not signalled again.
    while h.reschedule_rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.reschedule_rx.try_recv().is_err());
}

#[tokio::test]
async fn start_failures_are_retried() {
    let h = start();
    h.runtime.fail_starts("shaky", 2);
    h.handle
        .apply_assignment(assignment("req-5", "shaky", &[("node-a", 1)]))
        .await
        .unwrap();
    wait_states(&h.handle, ContainerState::Healthy, 1).await;
    assert_eq!(h.runtime.start_attempts("shaky"), 3);
    assert_eq!(h.runtime.running_count("shaky"), 1);
}

#[tokio::test]
async fn stop_replicas_stops_only_the_named_keys() {
    let h = start();
    h.handle
        .apply_assignment(assignment("req-1", "nginx", &[("node-a", 3)]))
        .await
        .unwrap();
    wait_states(&h.handle, ContainerState::Healthy, 3).await;

    let keys = vec!["req-1/2".to_string(), "req-1/1".to_string(), "req-1/7".to_string()];
    assert_eq!(h.handle.stop_replicas(keys).await.unwrap(), 2);
    wait_states(&h.handle, ContainerState::Stopped, 2).await;
    assert_eq!(h.runtime.running_count("nginx"), 1);
    let kept = h.store.get_container("req-1/0").unwrap().unwrap();
    assert_eq!(kept.state, ContainerState::Healthy);
}

#[tokio::test]
async fn stopping_a_failed_replica_cancels_its_reschedule() {
    let mut h = start();
    h.runtime.fail_pulls("broken", 100);
    h.handle
        .apply_assignment(assignment("req-6", "broken", &[("node-a", 1)]))
        .await
        .unwrap();
    wait_states(&h.handle, ContainerState::Failed, 1).await;

    assert_eq!(h.handle.stop_replicas(vec!["req-6/0".into()]).await.unwrap(), 0);
    let record = h.store.get_container("req-6/0").unwrap().unwrap();
    assert_eq!(record.state, ContainerState::Stopped);
    assert!(!record.reschedule_pending);

    while h.reschedule_rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.reschedule_rx.try_recv().is_err());
}

#[tokio::test]
async fn terminal_records_are_pruned_after_retention() {
    let mut config = config("node-a");
    config.terminal_retention = Duration::ZERO;
    let h = start_custom(
        config,
        MemoryRuntime::new(),
        StateStore::open_in_memory().unwrap(),
        16,
    );
    h.handle
        .apply_assignment(assignment("req-1", "nginx", &[("node-a", 2)]))
        .await
        .unwrap();
    h.handle
        .apply_assignment(assignment("req-2", "redis", &[("node-a", 1)]))
        .await
        .unwrap();
    wait_states(&h.handle, ContainerState::Healthy, 3).await;

    h.handle.remove_image("nginx").await.unwrap();
    for _ in 0..250 {
        if h.store.list_containers().unwrap().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let left = h.store.list_containers().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].image, "redis");
}
