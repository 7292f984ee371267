//! Node mode: every subsystem of one cluster member in one process.
//!
//! Startup:
//! 1. Open the local store, resolve the node id, bump the incarnation
//! 2. Start the swim actor and serve gossip on the P2P port
//! 3. Start ledger sync and the registration loop (encrypted capacity)
//! 4. Start the enforcer, scheduling coordinator, telemetry publisher
//!    and status anchoring
//! 5. Join the bootstrap peers and serve the node API
//!
//! Shutdown leaves the cluster, stops the intake loops (ledger sync,
//! coordinator, registration, telemetry, status anchoring) so nothing new
//! reaches the enforcer, deregisters, drains containers within the grace
//! period and then stops gossip and the HTTP servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use canteen_cluster::swim::{self, SwimHandle};
use canteen_cluster::{HttpTransport, Membership, generate_node_id, gossip_router};
use canteen_enforcer::{
    ContainerRuntime, DockerRuntime, EnforcerHandle, HttpCheck, MemoryRuntime, run_status_anchor,
};
use canteen_ledger::{HttpLedger, LedgerClient, LedgerSync};
use canteen_placement::{FheBackend, KeyAuthority, SchedulingKey, SimulatedFhe};
use canteen_scheduler::{
    CoordinatorHandle, CoordinatorInputs, NodeRegistration, SchedulingContext, TelemetryPublisher,
};
use canteen_state::StateStore;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{CanteenConfig, RuntimeKind};

const STORE_FILE: &str = "canteen.redb";

/// A started node. Dropping it without [`RunningNode::shutdown`] leaves
/// containers running.
pub struct RunningNode {
    pub node_id: String,
    pub p2p_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub swim: SwimHandle,
    pub sync: LedgerSync,
    pub enforcer: EnforcerHandle,
    pub coordinator: CoordinatorHandle,
    grace: Duration,
    /// Stops the loops that feed the enforcer.
    intake_tx: watch::Sender<bool>,
    intake_tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub fn build_runtime(config: &CanteenConfig) -> Arc<dyn ContainerRuntime> {
    match config.enforcer.runtime {
        RuntimeKind::Docker => {
            let mut runtime = DockerRuntime::new(&config.enforcer.docker_bin, Duration::from_secs(30));
            if let Some(path) = &config.enforcer.http_check_path {
                runtime = runtime.with_http_check(HttpCheck {
                    path: path.clone(),
                    timeout: Duration::from_secs(2),
                });
            }
            Arc::new(runtime)
        }
        RuntimeKind::Memory => Arc::new(MemoryRuntime::new()),
    }
}

/// Resolve the node id: configured, else persisted, else freshly generated.
fn resolve_node_id(config: &CanteenConfig, store: &StateStore) -> anyhow::Result<String> {
    let id = match (&config.node.id, store.local_node_id()?) {
        (Some(id), _) => id.clone(),
        (None, Some(persisted)) => persisted,
        (None, None) => generate_node_id(&config.advertise_address()),
    };
    store.set_local_node_id(&id)?;
    Ok(id)
}

async fn serve(listener: TcpListener, router: Router, mut shutdown: watch::Receiver<bool>) {
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await;
    if let Err(e) = result {
        warn!(error = %e, "http server exited with error");
    }
}

/// Start every subsystem and return once both listeners are bound.
pub async fn start_node(
    config: CanteenConfig,
    runtime: Arc<dyn ContainerRuntime>,
) -> anyhow::Result<RunningNode> {
    config.validate()?;
    std::fs::create_dir_all(&config.node.data_dir)
        .with_context(|| format!("creating {}", config.node.data_dir.display()))?;

    // ── Local store ────────────────────────────────────────────
    let db_path = config.node.data_dir.join(STORE_FILE);
    let store = StateStore::open(&db_path)?;
    let node_id = resolve_node_id(&config, &store)?;
    let incarnation = store.bump_incarnation()?;
    let advertise = config.advertise_address();
    info!(%node_id, incarnation, path = ?db_path, "local store opened");

    let (shutdown_tx, shutdown) = watch::channel(false);
    let (intake_tx, intake) = watch::channel(false);
    let mut tasks = Vec::new();
    let mut intake_tasks = Vec::new();

    // ── Membership ─────────────────────────────────────────────
    let key = SchedulingKey::from_passphrase(&config.scheduler.scheduling_key);
    let fhe: Arc<dyn FheBackend> = Arc::new(SimulatedFhe::new(key.clone()));
    let swim_config = config.swim();
    let core = Membership::new(
        &node_id,
        &advertise,
        &key.fingerprint(),
        incarnation,
        config.membership(),
        StdRng::from_entropy(),
    );
    let transport = Arc::new(HttpTransport::new(swim_config.probe_timeout * 2));
    let (swim, swim_task) = swim::spawn(core, transport, swim_config, store.clone(), shutdown.clone());
    tasks.push(swim_task);

    let p2p_listener = TcpListener::bind(("0.0.0.0", config.node.p2p_port))
        .await
        .with_context(|| format!("binding p2p port {}", config.node.p2p_port))?;
    let p2p_addr = p2p_listener.local_addr()?;
    tasks.push(tokio::spawn(serve(
        p2p_listener,
        gossip_router(swim.clone()),
        shutdown.clone(),
    )));
    info!(%p2p_addr, %advertise, "gossip listening");

    // ── Ledger ─────────────────────────────────────────────────
    let ledger: Arc<dyn LedgerClient> = Arc::new(HttpLedger::new(
        &config.ledger.url,
        Duration::from_millis(config.ledger.request_timeout_ms),
    ));
    let sync = LedgerSync::new(ledger, store.clone(), config.sync());
    let (events_tx, events_rx) = mpsc::channel(256);
    intake_tasks.push(tokio::spawn(sync.clone().run(events_tx, intake.clone())));

    let telemetry = config.telemetry();
    let registration = NodeRegistration {
        node_id: node_id.clone(),
        config: config.registration(),
        telemetry: telemetry.clone(),
        fhe: Arc::clone(&fhe),
        sync: sync.clone(),
    };
    intake_tasks.push(tokio::spawn(registration.run(intake.clone())));

    // ── Enforcer ───────────────────────────────────────────────
    let (status_tx, status_rx) = mpsc::channel(256);
    // A full reschedule channel is not lossy: the enforcer re-sends pending
    // signals on its sweep.
    let (reschedule_tx, reschedule_rx) = mpsc::channel(64);
    let (enforcer, enforcer_task) = canteen_enforcer::spawn(
        config.enforcer(&node_id),
        runtime,
        store.clone(),
        status_tx,
        reschedule_tx,
    );
    tasks.push(enforcer_task);

    // ── Scheduling ─────────────────────────────────────────────
    let (coordinator, coordinator_task) = canteen_scheduler::spawn(
        config.coordinator(&node_id),
        SchedulingContext {
            swim: swim.clone(),
            sync: sync.clone(),
            enforcer: enforcer.clone(),
            fhe: Arc::clone(&fhe),
            authority: Arc::new(KeyAuthority::new(key)),
            store: store.clone(),
        },
        CoordinatorInputs {
            ledger_events: events_rx,
            status_updates: status_rx,
            reschedules: reschedule_rx,
        },
        intake.clone(),
    );
    intake_tasks.push(coordinator_task);

    let publisher = TelemetryPublisher {
        node_id: node_id.clone(),
        config: telemetry,
        fhe,
        enforcer: enforcer.clone(),
        swim: swim.clone(),
        coordinator: coordinator.clone(),
    };
    intake_tasks.push(tokio::spawn(publisher.run(intake.clone())));
    intake_tasks.push(tokio::spawn(run_status_anchor(
        enforcer.clone(),
        sync.clone(),
        node_id.clone(),
        Duration::from_millis(config.enforcer.status_anchor_interval_ms),
        intake,
    )));

    // ── Join ───────────────────────────────────────────────────
    let seeds: Vec<String> = config
        .node
        .bootstrap
        .iter()
        .filter(|s| **s != advertise)
        .cloned()
        .collect();
    if !seeds.is_empty() {
        match swim.join(&seeds).await {
            Ok(reached) => info!(reached, seeds = seeds.len(), "joined cluster"),
            Err(e) => warn!(error = %e, "no bootstrap peer reachable; waiting to be joined"),
        }
    }

    // ── API ────────────────────────────────────────────────────
    let api_listener = TcpListener::bind(("0.0.0.0", config.node.api_port))
        .await
        .with_context(|| format!("binding api port {}", config.node.api_port))?;
    let api_addr = api_listener.local_addr()?;
    let router = canteen_api::build_router(canteen_api::ApiState {
        swim: swim.clone(),
        sync: sync.clone(),
        enforcer: enforcer.clone(),
        coordinator: coordinator.clone(),
    });
    tasks.push(tokio::spawn(serve(api_listener, router, shutdown.clone())));
    info!(%api_addr, "node API listening");

    Ok(RunningNode {
        node_id,
        p2p_addr,
        api_addr,
        swim,
        sync,
        enforcer,
        coordinator,
        grace: Duration::from_millis(config.enforcer.shutdown_grace_ms),
        intake_tx,
        intake_tasks,
        shutdown_tx,
        tasks,
    })
}

impl RunningNode {
    /// Leave, stop intake, deregister, drain containers, then stop the rest.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!(node_id = %self.node_id, "shutting down");
        if let Err(e) = self.swim.leave().await {
            warn!(error = %e, "leave announcement failed");
        }
        let _ = self.intake_tx.send(true);
        join_within(self.intake_tasks, self.grace).await;
        if let Err(e) = self.sync.deregister_node(&self.node_id).await {
            warn!(error = %e, "ledger deregistration failed");
        }
        if let Err(e) = self.enforcer.shutdown(self.grace).await {
            warn!(error = %e, "enforcer drain failed");
        }
        let _ = self.shutdown_tx.send(true);
        join_within(self.tasks, self.grace).await;
        info!(node_id = %self.node_id, "node stopped");
        Ok(())
    }
}

/// Await `tasks`, aborting any still running after `grace`.
async fn join_within(tasks: Vec<JoinHandle<()>>, grace: Duration) {
    for task in tasks {
        let abort = task.abort_handle();
        if tokio::time::timeout(grace, task).await.is_err() {
            abort.abort();
        }
    }
}

/// `canteend node`: run until Ctrl-C.
pub async fn run_node(config: CanteenConfig) -> anyhow::Result<()> {
    let runtime = build_runtime(&config);
    let node = start_node(config, runtime).await?;
    info!(node_id = %node.node_id, "canteen node running");

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    node.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use canteen_ledger::{StoreLedger, ledger_router};
    use serde_json::json;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn start_ledger() -> String {
        start_ledger_on(0).await
    }

    async fn start_ledger_on(port: u16) -> String {
        let ledger = StoreLedger::new(StateStore::open_in_memory().unwrap());
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, ledger_router(ledger)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_config(dir: &std::path::Path, ledger_url: &str, bootstrap: Vec<String>) -> CanteenConfig {
        let mut config = CanteenConfig::default();
        config.node.data_dir = dir.to_path_buf();
        config.node.p2p_port = free_port();
        config.node.api_port = free_port();
        config.node.bootstrap = bootstrap;
        config.gossip.protocol_period_ms = 100;
        config.gossip.probe_timeout_ms = 40;
        config.scheduler.poll_interval_ms = 100;
        config.scheduler.telemetry_interval_ms = 100;
        config.ledger.url = ledger_url.to_string();
        config.ledger.poll_interval_ms = 50;
        config.ledger.retry_initial_ms = 10;
        config.ledger.retry_max_ms = 50;
        config.enforcer.runtime = RuntimeKind::Memory;
        config.enforcer.container_port = None;
        config.enforcer.health_interval_ms = 50;
        config.enforcer.status_anchor_interval_ms = 200;
        config.enforcer.shutdown_grace_ms = 2_000;
        config
    }

    async fn wait_until(what: &str, mut check: impl AsyncFnMut() -> bool) {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn node_id_and_incarnation_persist_across_restarts() {
        let ledger_url = start_ledger().await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &ledger_url, Vec::new());

        let first = start_node(config.clone(), Arc::new(MemoryRuntime::new()))
            .await
            .unwrap();
        let id = first.node_id.clone();
        let inc1 = first.swim.view().get(&id).unwrap().incarnation;
        first.shutdown().await.unwrap();
        // Let aborted tasks drop their store handles before reopening.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let second = start_node(config, Arc::new(MemoryRuntime::new()))
            .await
            .unwrap();
        assert_eq!(second.node_id, id);
        assert!(second.swim.view().get(&id).unwrap().incarnation > inc1);
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn two_nodes_deploy_over_http() {
        let ledger_url = start_ledger().await;
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();

        let mut c1 = test_config(dir1.path(), &ledger_url, Vec::new());
        c1.node.id = Some("node-1".into());
        let seed = c1.advertise_address();
        let mut c2 = test_config(dir2.path(), &ledger_url, vec![seed]);
        c2.node.id = Some("node-2".into());

        let r1 = MemoryRuntime::new();
        let r2 = MemoryRuntime::new();
        let n1 = start_node(c1, Arc::new(r1.clone())).await.unwrap();
        let n2 = start_node(c2, Arc::new(r2.clone())).await.unwrap();

        wait_until("mutual membership", async || {
            n1.swim.view().alive_ids().len() == 2 && n2.swim.view().alive_ids().len() == 2
        })
        .await;
        wait_until("telemetry from both nodes", async || {
            n1.coordinator.telemetry_nodes().await.unwrap().len() == 2
                && n2.coordinator.telemetry_nodes().await.unwrap().len() == 2
        })
        .await;

        let api = n1.api_addr.to_string();
        let body = json!({"image": "nginx", "replicas": 4}).to_string().into_bytes();
        let (status, _) = canteen_cluster::http_client::request(
            http::Method::POST,
            &api,
            "/deploy",
            Some(body),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(status, http::StatusCode::CREATED);

        // Equal capacity: least-loaded packing splits evenly.
        wait_until("replicas on both nodes", async || {
            r1.running_count("nginx") == 2 && r2.running_count("nginx") == 2
        })
        .await;

        n2.shutdown().await.unwrap();
        assert_eq!(r2.running_count("nginx"), 0);
        let members = n1.sync.client().members().await.unwrap();
        assert!(members.iter().all(|m| m.node_id != "node-2"));
        n1.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn registration_waits_for_a_late_ledger() {
        let ledger_port = free_port();
        let ledger_url = format!("http://127.0.0.1:{ledger_port}");
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), &ledger_url, Vec::new());
        config.node.id = Some("node-late".into());

        let node = start_node(config, Arc::new(MemoryRuntime::new()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        start_ledger_on(ledger_port).await;

        wait_until("registration after the ledger came up", async || {
            node.sync
                .client()
                .members()
                .await
                .is_ok_and(|members| members.iter().any(|m| m.node_id == "node-late"))
        })
        .await;
        node.shutdown().await.unwrap();
    }
}
