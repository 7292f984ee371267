//! Swim actor tests over the in-memory network.
//!
//! Nodes run real actors with a short protocol period; failures are
//! injected through `MemoryNetwork`.

use std::sync::Arc;
use std::time::Duration;

use canteen_cluster::swim::{self, GossipEvent, SwimConfig, SwimHandle};
use canteen_cluster::{Membership, MembershipConfig, MemoryNetwork, Piggyback};
use canteen_state::{Ciphertext, LivenessState, StateStore, TelemetryRecord};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::watch;

struct TestNode {
    id: String,
    address: String,
    handle: SwimHandle,
}

async fn start_node(
    net: &MemoryNetwork,
    index: u64,
    shutdown: watch::Receiver<bool>,
) -> TestNode {
    let id = format!("node-{index}");
    let address = format!("10.0.0.{index}:5000");
    let config = MembershipConfig {
        suspicion_rounds: 3,
        ..MembershipConfig::default()
    };
    let core = Membership::new(&id, &address, "", 1, config, StdRng::seed_from_u64(index));
    let swim_config = SwimConfig {
        protocol_period: Duration::from_millis(40),
        probe_timeout: Duration::from_millis(20),
        io_workers: 8,
    };
    let (handle, _join) = swim::spawn(
        core,
        Arc::new(net.transport(&address)),
        swim_config,
        StateStore::open_in_memory().unwrap(),
        shutdown,
    );
    net.serve(&address, handle.clone()).await;
    TestNode {
        id,
        address,
        handle,
    }
}

async fn start_cluster(net: &MemoryNetwork, n: u64) -> (Vec<TestNode>, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let mut nodes = Vec::new();
    for i in 1..=n {
        nodes.push(start_node(net, i, rx.clone()).await);
    }
    let seed = vec![nodes[0].address.clone()];
    for node in &nodes[1..] {
        node.handle.join(&seed).await.unwrap();
    }
    (nodes, tx)
}

/// Poll until `check` holds on every listed node's view, or panic.
async fn wait_for(nodes: &[&TestNode], what: &str, check: impl Fn(&canteen_state::ClusterView) -> bool) {
    for _ in 0..200 {
        let mut all = true;
        for node in nodes {
            let view = node.handle.current_view().await.unwrap();
            if !check(&view) {
                all = false;
                break;
            }
        }
        if all {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn nodes_discover_each_other_through_one_seed() {
    let net = MemoryNetwork::new(1);
    let (nodes, _shutdown) = start_cluster(&net, 4).await;
    let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let refs: Vec<&TestNode> = nodes.iter().collect();

    wait_for(&refs, "full membership", |view| {
        ids.iter().all(|id| view.state_of(id) == Some(LivenessState::Alive))
    })
    .await;
}

#[tokio::test]
async fn crashed_node_is_declared_dead_everywhere() {
    let net = MemoryNetwork::new(2);
    let (nodes, _shutdown) = start_cluster(&net, 4).await;
    let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let refs: Vec<&TestNode> = nodes.iter().collect();
    wait_for(&refs, "full membership", |view| {
        ids.iter().all(|id| view.state_of(id) == Some(LivenessState::Alive))
    })
    .await;

    net.set_down(&nodes[3].address, true).await;
    let crashed = nodes[3].id.clone();
    wait_for(&refs[..3], "crashed node dead", |view| {
        view.state_of(&crashed) == Some(LivenessState::Dead)
    })
    .await;
}

#[tokio::test]
async fn partitioned_node_rejoins_after_heal() {
    let net = MemoryNetwork::new(3);
    let (nodes, _shutdown) = start_cluster(&net, 3).await;
    let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let refs: Vec<&TestNode> = nodes.iter().collect();
    wait_for(&refs, "full membership", |view| {
        ids.iter().all(|id| view.state_of(id) == Some(LivenessState::Alive))
    })
    .await;

    let isolated = nodes[2].id.clone();
    net.partition(
        &[nodes[0].address.as_str(), nodes[1].address.as_str()],
        &[nodes[2].address.as_str()],
    )
    .await;
    wait_for(&refs[..2], "isolated node dead", |view| {
        view.state_of(&isolated) == Some(LivenessState::Dead)
    })
    .await;

    net.heal().await;
    wait_for(&refs, "views converge after heal", |view| {
        ids.iter().all(|id| view.state_of(id) == Some(LivenessState::Alive))
    })
    .await;
}

#[tokio::test]
async fn telemetry_piggyback_reaches_all_nodes() {
    let net = MemoryNetwork::new(4);
    let (nodes, _shutdown) = start_cluster(&net, 3).await;
    let mut rx = nodes[2].handle.subscribe();

    let record = TelemetryRecord {
        node_id: nodes[0].id.clone(),
        capacity: Ciphertext(vec![1, 2, 3]),
        load: Ciphertext(vec![4, 5, 6]),
        priority: Ciphertext(vec![7]),
        timestamp: 1_000,
        freshness_ms: 60_000,
    };
    nodes[0]
        .handle
        .publish(Piggyback::Telemetry(record.clone()))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(GossipEvent::Telemetry(t)) => break t,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("telemetry not disseminated");
    assert_eq!(received, record);
}

#[tokio::test]
async fn graceful_leave_is_seen_as_dead() {
    let net = MemoryNetwork::new(5);
    let (nodes, _shutdown) = start_cluster(&net, 3).await;
    let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let refs: Vec<&TestNode> = nodes.iter().collect();
    wait_for(&refs, "full membership", |view| {
        ids.iter().all(|id| view.state_of(id) == Some(LivenessState::Alive))
    })
    .await;

    nodes[1].handle.leave().await.unwrap();
    let leaver = nodes[1].id.clone();
    wait_for(&[refs[0], refs[2]], "leaver dead", |view| {
        view.state_of(&leaver) == Some(LivenessState::Dead)
    })
    .await;
}
