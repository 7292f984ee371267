//! The enforcer actor.
//!
//! Owns the CONTAINERS table and one [`Supervisor`] per active replica.
//! Released assignments come in as commands; supervisor reports come back
//! on a second channel. Every accepted transition is persisted, forwarded
//! as a [`StatusUpdate`] for gossip, and a FAILED replica additionally
//! produces a [`RescheduleSignal`].
//!
//! A FAILED record stays `reschedule_pending` until the consumer confirms
//! the replacement was submitted; a periodic sweep re-sends the signal for
//! pending records and prunes terminal records past their retention.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use canteen_state::{
    ContainerRecord, ContainerState, DeploymentAssignment, ReplicaSlot, StateStore, StatusUpdate,
    epoch_millis,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{EnforcerError, EnforcerResult};
use crate::lifecycle::advance;
use crate::runtime::{ContainerRuntime, StartSpec};
use crate::supervisor::{Report, Supervisor, SupervisorConfig};

/// Ports probed when allocating a host port.
const PORT_SEARCH_SPAN: u16 = 100;

#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    pub node_id: String,
    /// First host port to try; see [`port_base`].
    pub port_base: u16,
    /// Port exposed inside the container, or `None` for no mapping.
    pub container_port: Option<u16>,
    pub supervisor: SupervisorConfig,
    /// Period of the reschedule re-send and record pruning sweep.
    pub sweep_interval: Duration,
    /// How long STOPPED records, and FAILED ones already replaced, are kept.
    pub terminal_retention: Duration,
}

/// Host port search start for a node listening on `p2p_port`, so that
/// several nodes on one host do not contend for the same range.
pub fn port_base(p2p_port: u16) -> u16 {
    8080u16.saturating_add(p2p_port.saturating_sub(5000))
}

/// A replica that failed for good and should be placed elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleSignal {
    pub container_key: String,
    pub slot: ReplicaSlot,
    pub image: String,
    pub reason: String,
}

enum Command {
    Apply {
        assignment: DeploymentAssignment,
        reply: oneshot::Sender<EnforcerResult<usize>>,
    },
    RemoveImage {
        image: String,
        reply: oneshot::Sender<EnforcerResult<usize>>,
    },
    StopReplicas {
        keys: Vec<String>,
        reply: oneshot::Sender<EnforcerResult<usize>>,
    },
    RescheduleSubmitted {
        key: String,
        reply: oneshot::Sender<EnforcerResult<bool>>,
    },
    List {
        reply: oneshot::Sender<EnforcerResult<Vec<ContainerRecord>>>,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct EnforcerHandle {
    tx: mpsc::Sender<Command>,
}

impl EnforcerHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<EnforcerResult<T>>) -> Command,
    ) -> EnforcerResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EnforcerError::ActorStopped)?;
        rx.await.map_err(|_| EnforcerError::ActorStopped)?
    }

    /// Start this node's share of `assignment` and return how many replicas
    /// were launched. Replicas that already have a record here are skipped,
    /// so re-applying is idempotent. Every replica is attempted; if any could
    /// not be launched they are recorded FAILED, signalled for reschedule,
    /// and the call returns [`EnforcerError::PartialApply`].
    pub async fn apply_assignment(&self, assignment: DeploymentAssignment) -> EnforcerResult<usize> {
        self.call(|reply| Command::Apply { assignment, reply }).await
    }

    /// Stop every live replica of `image`; returns how many were signalled.
    pub async fn remove_image(&self, image: &str) -> EnforcerResult<usize> {
        let image = image.to_string();
        self.call(|reply| Command::RemoveImage { image, reply }).await
    }

    /// Stop the replicas with the given container keys; unknown keys are
    /// ignored. Returns how many supervisors were signalled.
    pub async fn stop_replicas(&self, keys: Vec<String>) -> EnforcerResult<usize> {
        self.call(|reply| Command::StopReplicas { keys, reply }).await
    }

    /// The replacement for a FAILED replica is on the ledger; stop
    /// re-sending its reschedule signal. Returns false for unknown keys.
    pub async fn reschedule_submitted(&self, key: &str) -> EnforcerResult<bool> {
        let key = key.to_string();
        self.call(|reply| Command::RescheduleSubmitted { key, reply })
            .await
    }

    pub async fn list(&self) -> EnforcerResult<Vec<ContainerRecord>> {
        self.call(|reply| Command::List { reply }).await
    }

    /// Replicas currently occupying a slot.
    pub async fn active_count(&self) -> EnforcerResult<u64> {
        Ok(self
            .list()
            .await?
            .iter()
            .filter(|r| r.state.is_active())
            .count() as u64)
    }

    /// Stop all replicas, waiting up to `grace` for supervisors to finish.
    pub async fn shutdown(&self, grace: Duration) -> EnforcerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { grace, reply })
            .await
            .map_err(|_| EnforcerError::ActorStopped)?;
        rx.await.map_err(|_| EnforcerError::ActorStopped)
    }
}

struct Slot {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Actor {
    config: EnforcerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    store: StateStore,
    slots: HashMap<String, Slot>,
    ports: HashSet<u16>,
    /// When each pending reschedule signal was last handed over.
    signalled: HashMap<String, Instant>,
    reports_tx: mpsc::Sender<Report>,
    status_tx: mpsc::Sender<StatusUpdate>,
    reschedule_tx: mpsc::Sender<RescheduleSignal>,
}

/// Spawn the enforcer. Exited containers from earlier runs are removed and
/// replicas persisted as active are supervised again from scratch.
pub fn spawn(
    config: EnforcerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    store: StateStore,
    status_tx: mpsc::Sender<StatusUpdate>,
    reschedule_tx: mpsc::Sender<RescheduleSignal>,
) -> (EnforcerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let (reports_tx, reports_rx) = mpsc::channel(256);
    let actor = Actor {
        config,
        runtime,
        store,
        slots: HashMap::new(),
        ports: HashSet::new(),
        signalled: HashMap::new(),
        reports_tx,
        status_tx,
        reschedule_tx,
    };
    let join = tokio::spawn(actor.run(rx, reports_rx));
    (EnforcerHandle { tx }, join)
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut reports: mpsc::Receiver<Report>) {
        self.recover().await;
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Apply { assignment, reply }) => {
                        let _ = reply.send(self.apply(&assignment));
                    }
                    Some(Command::RemoveImage { image, reply }) => {
                        let _ = reply.send(self.remove_image(&image));
                    }
                    Some(Command::StopReplicas { keys, reply }) => {
                        let _ = reply.send(self.stop_replicas(&keys));
                    }
                    Some(Command::RescheduleSubmitted { key, reply }) => {
                        let _ = reply.send(self.reschedule_submitted(&key));
                    }
                    Some(Command::List { reply }) => {
                        let _ = reply.send(self.store.list_containers().map_err(Into::into));
                    }
                    Some(Command::Shutdown { grace, reply }) => {
                        self.drain(&mut reports, grace).await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.drain(&mut reports, Duration::ZERO).await;
                        return;
                    }
                },
                Some(report) = reports.recv() => self.on_report(report),
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    // ── Startup ────────────────────────────────────────────────────

    async fn recover(&mut self) {
        match self.runtime.cleanup_exited().await {
            Ok(n) if n > 0 => info!(removed = n, "removed exited containers from earlier runs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "exited container cleanup failed"),
        }

        let records = match self.store.list_containers() {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "cannot read container records");
                return;
            }
        };
        for mut record in records.into_iter().filter(|r| r.state.is_active()) {
            if let Some(handle) = record.handle.take() {
                if let Err(e) = self.runtime.stop(&handle).await {
                    debug!(key = %record.key, error = %e, "stale container already gone");
                }
            }
            record.state = ContainerState::Requested;
            record.host_port = None;
            record.restarts = 0;
            record.updated_at = epoch_millis();
            info!(key = %record.key, image = %record.image, "resuming supervision");
            if let Err(e) = self.launch(record) {
                error!(error = %e, "failed to resume container");
            }
        }
    }

    // ── Commands ───────────────────────────────────────────────────

    fn apply(&mut self, assignment: &DeploymentAssignment) -> EnforcerResult<usize> {
        let node_id = self.config.node_id.clone();
        let replicas = assignment.replicas_for(&node_id);
        if replicas == 0 {
            return Ok(0);
        }
        let existing: HashSet<String> = self
            .store
            .list_containers()?
            .into_iter()
            .filter(|r| r.request_id == assignment.request_id)
            .map(|r| r.key)
            .collect();
        if existing.len() >= replicas as usize {
            debug!(request_id = %assignment.request_id, "assignment already applied");
            return Ok(0);
        }

        info!(
            request_id = %assignment.request_id,
            image = %assignment.image,
            replicas,
            "applying assignment"
        );
        let mut launched = 0;
        let mut failures = Vec::new();
        for index in 0..replicas {
            let key = ContainerRecord::make_key(&assignment.request_id, index);
            if existing.contains(&key) {
                continue;
            }
            let record = ContainerRecord {
                key,
                request_id: assignment.request_id.clone(),
                image: assignment.image.clone(),
                state: ContainerState::Requested,
                handle: None,
                host_port: None,
                restarts: 0,
                last_error: None,
                updated_at: epoch_millis(),
                reschedule_pending: false,
            };
            match self.launch(record) {
                Ok(()) => launched += 1,
                Err(e) => failures.push(e.to_string()),
            }
        }

        match failures.first() {
            None => Ok(launched),
            Some(first) => {
                warn!(
                    request_id = %assignment.request_id,
                    launched,
                    failed = failures.len(),
                    error = %first,
                    "assignment partially applied"
                );
                Err(EnforcerError::PartialApply {
                    request_id: assignment.request_id.clone(),
                    failed: failures.len(),
                    requested: replicas,
                    error: first.clone(),
                })
            }
        }
    }

    fn remove_image(&mut self, image: &str) -> EnforcerResult<usize> {
        let mut signalled = 0;
        for record in self.store.list_containers()? {
            if record.image == image && self.stop_record(record)? {
                signalled += 1;
            }
        }
        info!(%image, signalled, "image removed");
        Ok(signalled)
    }

    fn stop_replicas(&mut self, keys: &[String]) -> EnforcerResult<usize> {
        let mut signalled = 0;
        for key in keys {
            let Some(record) = self.store.get_container(key)? else {
                debug!(%key, "no such replica to stop");
                continue;
            };
            if self.stop_record(record)? {
                signalled += 1;
            }
        }
        info!(replicas = keys.len(), signalled, "surplus replicas stopped");
        Ok(signalled)
    }

    /// Stop one replica. Returns true when a supervisor was signalled; a
    /// replica without one (already FAILED) is closed directly.
    fn stop_record(&mut self, mut record: ContainerRecord) -> EnforcerResult<bool> {
        if record.state == ContainerState::Stopped {
            return Ok(false);
        }
        if let Some(slot) = self.slots.get(&record.key) {
            let _ = slot.stop.send(true);
            return Ok(true);
        }
        record.reschedule_pending = false;
        self.signalled.remove(&record.key);
        if advance(&mut record, ContainerState::Stopped)? {
            self.persist(&record);
            self.emit_status(&record);
        }
        Ok(false)
    }

    fn reschedule_submitted(&mut self, key: &str) -> EnforcerResult<bool> {
        self.signalled.remove(key);
        let Some(mut record) = self.store.get_container(key)? else {
            return Ok(false);
        };
        if record.reschedule_pending {
            record.reschedule_pending = false;
            self.store.put_container(&record)?;
            debug!(%key, "reschedule acknowledged");
        }
        Ok(true)
    }

    // ── Supervision ────────────────────────────────────────────────

    fn allocate_port(&mut self) -> EnforcerResult<Option<u16>> {
        if self.config.container_port.is_none() {
            return Ok(None);
        }
        let start = self.config.port_base;
        let end = start.saturating_add(PORT_SEARCH_SPAN);
        for port in start..end {
            if self.ports.contains(&port) {
                continue;
            }
            if TcpListener::bind(("0.0.0.0", port)).is_ok() {
                self.ports.insert(port);
                return Ok(Some(port));
            }
        }
        Err(EnforcerError::NoFreePort { start, end })
    }

    fn launch(&mut self, mut record: ContainerRecord) -> EnforcerResult<()> {
        record.host_port = match self.allocate_port() {
            Ok(port) => port,
            Err(e) => {
                // Never admitted, so it skips the pull stage.
                record.state = ContainerState::Failed;
                record.last_error = Some(e.to_string());
                record.reschedule_pending = true;
                self.persist(&record);
                self.emit_status(&record);
                self.signal_reschedule(&record);
                return Err(e);
            }
        };
        self.persist(&record);

        let (stop, stop_rx) = watch::channel(false);
        let supervisor = Supervisor {
            key: record.key.clone(),
            image: record.image.clone(),
            spec: StartSpec {
                name: container_name(&record.key),
                host_port: record.host_port,
                container_port: self.config.container_port.unwrap_or(80),
            },
            runtime: Arc::clone(&self.runtime),
            config: self.config.supervisor.clone(),
            reports: self.reports_tx.clone(),
            stop: stop_rx,
        };
        let task = tokio::spawn(supervisor.run());
        self.slots.insert(record.key, Slot { stop, task });
        Ok(())
    }

    fn on_report(&mut self, report: Report) {
        let mut record = match self.store.get_container(&report.key) {
            Ok(Some(r)) => r,
            Ok(None) => {
                warn!(key = %report.key, "report for unknown container");
                return;
            }
            Err(e) => {
                error!(key = %report.key, error = %e, "cannot load container record");
                return;
            }
        };

        let changed = match advance(&mut record, report.state) {
            Ok(changed) => changed,
            Err(e) => {
                warn!(key = %report.key, error = %e, "ignoring report");
                return;
            }
        };
        let restarted = record.restarts != report.restarts;
        if report.handle.is_some() {
            record.handle = report.handle;
        }
        record.restarts = report.restarts;
        if report.error.is_some() {
            record.last_error = report.error;
        }
        if !changed && !restarted {
            return;
        }
        if changed && record.state == ContainerState::Failed {
            record.reschedule_pending = true;
        }
        record.updated_at = epoch_millis();
        self.persist(&record);
        self.emit_status(&record);
        info!(key = %record.key, state = %record.state, restarts = record.restarts, "container transition");

        if !record.state.is_active() {
            self.slots.remove(&record.key);
            if let Some(port) = record.host_port {
                self.ports.remove(&port);
            }
            if record.state == ContainerState::Failed {
                self.signal_reschedule(&record);
            }
        }
    }

    async fn drain(&mut self, reports: &mut mpsc::Receiver<Report>, grace: Duration) {
        for slot in self.slots.values() {
            let _ = slot.stop.send(true);
        }
        let deadline = Instant::now() + grace;
        while !self.slots.is_empty() {
            match tokio::time::timeout_at(deadline, reports.recv()).await {
                Ok(Some(report)) => self.on_report(report),
                Ok(None) | Err(_) => break,
            }
        }

        let leftover: Vec<(String, Slot)> = self.slots.drain().collect();
        for (key, slot) in leftover {
            slot.task.abort();
            warn!(%key, "supervisor aborted after grace period");
            if let Ok(Some(mut record)) = self.store.get_container(&key) {
                if advance(&mut record, ContainerState::Stopped).unwrap_or(false) {
                    self.persist(&record);
                }
            }
        }
        info!("enforcer stopped");
    }

    // ── Outputs ────────────────────────────────────────────────────

    fn persist(&self, record: &ContainerRecord) {
        if let Err(e) = self.store.put_container(record) {
            error!(key = %record.key, error = %e, "failed to persist container record");
        }
    }

    fn emit_status(&self, record: &ContainerRecord) {
        let update = StatusUpdate {
            node_id: self.config.node_id.clone(),
            container_key: record.key.clone(),
            image: record.image.clone(),
            state: record.state,
            updated_at: record.updated_at,
        };
        if self.status_tx.try_send(update).is_err() {
            debug!(key = %record.key, "status channel full, update dropped");
        }
    }

    /// Hand a reschedule signal over without blocking the actor. A full
    /// channel leaves the record pending for the next sweep.
    fn signal_reschedule(&mut self, record: &ContainerRecord) {
        let Some(slot) = record.slot(&self.config.node_id) else {
            error!(key = %record.key, "container key carries no replica index");
            return;
        };
        let signal = RescheduleSignal {
            container_key: record.key.clone(),
            slot,
            image: record.image.clone(),
            reason: record
                .last_error
                .clone()
                .unwrap_or_else(|| "container failed".into()),
        };
        match self.reschedule_tx.try_send(signal) {
            Ok(()) => {
                self.signalled.insert(record.key.clone(), Instant::now());
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(key = %record.key, "reschedule channel full, retrying on next sweep");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(key = %record.key, "reschedule consumer gone");
            }
        }
    }

    // ── Sweep ──────────────────────────────────────────────────────

    /// Re-send unacknowledged reschedule signals and prune terminal records
    /// older than the retention.
    fn sweep(&mut self) {
        let records = match self.store.list_containers() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "sweep cannot read container records");
                return;
            }
        };
        let now = epoch_millis();
        let retention = self.config.terminal_retention.as_millis() as u64;
        let resend_after = self.config.sweep_interval;
        let mut pruned = 0;
        for record in records {
            if record.state == ContainerState::Failed && record.reschedule_pending {
                let due = self
                    .signalled
                    .get(&record.key)
                    .is_none_or(|at| at.elapsed() >= resend_after);
                if due {
                    debug!(key = %record.key, "re-sending reschedule signal");
                    self.signal_reschedule(&record);
                }
                continue;
            }
            let terminal = matches!(record.state, ContainerState::Stopped | ContainerState::Failed);
            if terminal && now.saturating_sub(record.updated_at) >= retention {
                match self.store.delete_container(&record.key) {
                    Ok(_) => {
                        self.signalled.remove(&record.key);
                        pruned += 1;
                    }
                    Err(e) => warn!(key = %record.key, error = %e, "failed to prune container record"),
                }
            }
        }
        if pruned > 0 {
            debug!(pruned, "expired container records pruned");
        }
    }
}

fn container_name(key: &str) -> String {
    format!("canteen-{}", key.replace('/', "-"))
}
