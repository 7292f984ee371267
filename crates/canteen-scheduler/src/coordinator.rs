//! The scheduling coordinator.
//!
//! A single actor owns the telemetry table and the queue of requests that
//! have no anchored outcome yet. For each queued request it computes the
//! leader from the current ALIVE set; only on the leader does an evaluation
//! task run (packing under encryption, release, finalize, anchor). A view
//! change that moves leadership aborts the local task, and the new leader
//! picks the request up from its own queue.
//!
//! Anchored outcomes come back as ledger events on every node. Each node
//! verifies the commitment, records the outcome and hands its own share to
//! the enforcer. A ledger event is committed back to the sync only once its
//! effects are persisted; otherwise it is released and delivered again.
//! Scale targets are enforced by stopping this node's share of the surplus
//! chosen by [`surplus_slots`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use canteen_cluster::{GossipEvent, Piggyback, SwimHandle};
use canteen_enforcer::{EnforcerError, EnforcerHandle, RescheduleSignal};
use canteen_ledger::{AnchorReceipt, LedgerSync};
use canteen_placement::commitment::{outcome_commitment, verify_commitment};
use canteen_placement::packing::effective_constraints;
use canteen_placement::{
    DecryptionAuthority, FheBackend, PlacementError, elect_leader, evaluate_schedule, finalize,
    is_leader, precheck, select_inputs,
};
use canteen_state::{
    AssignmentNotice, AssignmentOutcome, CommitmentHash, DeploymentRequest, ImageScale, ImageSpec,
    ContainerState, LedgerEvent, LedgerEventKind, NodeId, PlacementConstraints, RequestId,
    RequestRecord, ScaleTarget, StateStore, StatusUpdate, TelemetryRecord, epoch_millis,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::scaling::surplus_slots;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub node_id: String,
    /// Upper bound on one release by the decryption authority.
    pub decryption_timeout: Duration,
    /// Delay before the first retry of a failed evaluation; doubles per attempt.
    pub requeue_initial: Duration,
    pub requeue_max: Duration,
    /// How long an assignment notice from a peer holds off local evaluation
    /// of the same request while the ledger event catches up.
    pub notice_hold: Duration,
    /// How often deferred requests are reconsidered.
    pub tick: Duration,
    /// How long STOPPED and FAILED container statuses stay in the cluster view.
    pub status_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            decryption_timeout: Duration::from_secs(5),
            requeue_initial: Duration::from_millis(500),
            requeue_max: Duration::from_secs(30),
            notice_hold: Duration::from_secs(5),
            tick: Duration::from_millis(250),
            status_retention: Duration::from_secs(600),
        }
    }
}

/// Backoff before attempt `attempts + 1`.
pub fn requeue_delay(config: &CoordinatorConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    config
        .requeue_initial
        .saturating_mul(1u32 << exponent)
        .min(config.requeue_max)
}

/// Whether an anchored outcome hashes to the commitment it was anchored
/// under, including the commitment embedded in an assignment.
pub fn outcome_matches(commitment: &CommitmentHash, outcome: &AssignmentOutcome) -> bool {
    outcome_commitment(outcome) == *commitment && outcome.assignment().is_none_or(verify_commitment)
}

/// Everything an evaluation needs besides the request itself.
#[derive(Clone)]
pub struct SchedulingContext {
    pub swim: SwimHandle,
    pub sync: LedgerSync,
    pub enforcer: EnforcerHandle,
    pub fhe: Arc<dyn FheBackend>,
    pub authority: Arc<dyn DecryptionAuthority>,
    pub store: StateStore,
}

/// Streams the coordinator consumes besides gossip and the view.
pub struct CoordinatorInputs {
    pub ledger_events: mpsc::Receiver<LedgerEvent>,
    /// Container transitions from the local enforcer.
    pub status_updates: mpsc::Receiver<StatusUpdate>,
    pub reschedules: mpsc::Receiver<RescheduleSignal>,
}

/// A queued request as reported by [`CoordinatorHandle::deployments`].
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub request: DeploymentRequest,
    pub leader: Option<NodeId>,
    pub evaluating: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentsSnapshot {
    pub pending: Vec<PendingRequest>,
    pub completed: Vec<RequestRecord>,
}

enum Command {
    Telemetry(TelemetryRecord),
    Deployments {
        reply: oneshot::Sender<SchedulerResult<DeploymentsSnapshot>>,
    },
    ClusterContainers {
        reply: oneshot::Sender<Vec<StatusUpdate>>,
    },
    TelemetryNodes {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Feed a telemetry record produced on this node.
    pub async fn observe_telemetry(&self, record: TelemetryRecord) -> SchedulerResult<()> {
        self.tx
            .send(Command::Telemetry(record))
            .await
            .map_err(|_| SchedulerError::ActorStopped)
    }

    /// Queued requests and recorded outcomes.
    pub async fn deployments(&self) -> SchedulerResult<DeploymentsSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Deployments { reply })
            .await
            .map_err(|_| SchedulerError::ActorStopped)?;
        rx.await.map_err(|_| SchedulerError::ActorStopped)?
    }

    /// Latest known state of every container in the cluster, this node's
    /// included, as learned from status gossip.
    pub async fn cluster_containers(&self) -> SchedulerResult<Vec<StatusUpdate>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ClusterContainers { reply })
            .await
            .map_err(|_| SchedulerError::ActorStopped)?;
        rx.await.map_err(|_| SchedulerError::ActorStopped)
    }

    /// Nodes whose latest telemetry is still fresh, sorted by id.
    pub async fn telemetry_nodes(&self) -> SchedulerResult<Vec<NodeId>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::TelemetryNodes { reply })
            .await
            .map_err(|_| SchedulerError::ActorStopped)?;
        rx.await.map_err(|_| SchedulerError::ActorStopped)
    }
}

struct Pending {
    request: DeploymentRequest,
    attempts: u32,
    not_before: Instant,
    last_error: Option<String>,
}

struct Running {
    generation: u64,
    task: JoinHandle<()>,
}

struct Evaluated {
    request_id: RequestId,
    generation: u64,
    result: SchedulerResult<AnchorReceipt>,
}

struct Job {
    request: DeploymentRequest,
    records: Vec<TelemetryRecord>,
    alive: BTreeSet<NodeId>,
}

struct Actor {
    config: CoordinatorConfig,
    ctx: SchedulingContext,
    telemetry: HashMap<NodeId, TelemetryRecord>,
    statuses: BTreeMap<(NodeId, String), StatusUpdate>,
    pending: BTreeMap<RequestId, Pending>,
    running: HashMap<RequestId, Running>,
    generation: u64,
    alive: BTreeSet<NodeId>,
    done_tx: mpsc::Sender<Evaluated>,
}

/// Spawn the coordinator. Requests recorded without an outcome by an
/// earlier run are queued again.
pub fn spawn(
    config: CoordinatorConfig,
    ctx: SchedulingContext,
    inputs: CoordinatorInputs,
    shutdown: watch::Receiver<bool>,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let (done_tx, done_rx) = mpsc::channel(64);
    let actor = Actor {
        config,
        ctx,
        telemetry: HashMap::new(),
        statuses: BTreeMap::new(),
        pending: BTreeMap::new(),
        running: HashMap::new(),
        generation: 0,
        alive: BTreeSet::new(),
        done_tx,
    };
    let join = tokio::spawn(actor.run(rx, done_rx, inputs, shutdown));
    (CoordinatorHandle { tx }, join)
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut done: mpsc::Receiver<Evaluated>,
        mut inputs: CoordinatorInputs,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut gossip = self.ctx.swim.subscribe();
        let mut view = self.ctx.swim.watch_view();
        self.alive = view.borrow_and_update().alive_ids();
        self.recover();

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let (mut commands_open, mut ledger_open, mut statuses_open) = (true, true, true);
        let (mut reschedules_open, mut gossip_open, mut view_open) = (true, true, true);
        info!(node_id = %self.config.node_id, "coordinator started");

        loop {
            tokio::select! {
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => commands_open = false,
                },
                Some(evaluated) = done.recv() => self.on_evaluated(evaluated),
                event = inputs.ledger_events.recv(), if ledger_open => match event {
                    Some(event) => {
                        if self.on_ledger_event(&event).await {
                            if let Err(e) = self.ctx.sync.commit(&event) {
                                warn!(seq = event.seq, error = %e, "failed to commit ledger event");
                                self.ctx.sync.release(&event);
                            }
                        } else {
                            self.ctx.sync.release(&event);
                        }
                    }
                    None => ledger_open = false,
                },
                event = gossip.recv(), if gossip_open => match event {
                    Ok(event) => self.on_gossip(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "coordinator lagged behind gossip");
                    }
                    Err(broadcast::error::RecvError::Closed) => gossip_open = false,
                },
                changed = view.changed(), if view_open => match changed {
                    Ok(()) => {
                        let alive = view.borrow_and_update().alive_ids();
                        self.on_alive_changed(alive);
                    }
                    Err(_) => view_open = false,
                },
                update = inputs.status_updates.recv(), if statuses_open => match update {
                    Some(update) => self.on_local_status(update).await,
                    None => statuses_open = false,
                },
                signal = inputs.reschedules.recv(), if reschedules_open => match signal {
                    Some(signal) => self.on_reschedule(signal),
                    None => reschedules_open = false,
                },
                _ = ticker.tick() => {
                    self.prune_statuses();
                    self.dispatch();
                }
                _ = shutdown.changed() => break,
            }
        }

        for (request_id, running) in self.running.drain() {
            running.task.abort();
            debug!(%request_id, "evaluation abandoned at shutdown");
        }
        info!(node_id = %self.config.node_id, "coordinator stopped");
    }

    fn recover(&mut self) {
        let records = match self.ctx.store.list_requests() {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "cannot read request records");
                return;
            }
        };
        for record in records.into_iter().filter(|r| r.outcome.is_none()) {
            debug!(request_id = %record.request.id, "requeued unfinished request");
            self.enqueue(record.request);
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Telemetry(record) => self.observe(record),
            Command::Deployments { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::ClusterContainers { reply } => {
                let _ = reply.send(self.statuses.values().cloned().collect());
            }
            Command::TelemetryNodes { reply } => {
                let now = epoch_millis();
                let mut nodes: Vec<NodeId> = self
                    .telemetry
                    .values()
                    .filter(|r| r.is_fresh(now))
                    .map(|r| r.node_id.clone())
                    .collect();
                nodes.sort();
                let _ = reply.send(nodes);
            }
        }
    }

    fn snapshot(&self) -> SchedulerResult<DeploymentsSnapshot> {
        let completed = self
            .ctx
            .store
            .list_requests()?
            .into_iter()
            .filter(|r| r.outcome.is_some())
            .collect();
        let pending = self
            .pending
            .iter()
            .map(|(id, p)| PendingRequest {
                request: p.request.clone(),
                leader: elect_leader(id, &self.alive),
                evaluating: self.running.contains_key(id),
                attempts: p.attempts,
                last_error: p.last_error.clone(),
            })
            .collect();
        Ok(DeploymentsSnapshot { pending, completed })
    }

    // ── Requests ───────────────────────────────────────────────────

    fn enqueue(&mut self, request: DeploymentRequest) {
        self.pending.insert(
            request.id.clone(),
            Pending {
                request,
                attempts: 0,
                not_before: Instant::now(),
                last_error: None,
            },
        );
    }

    /// Record and queue a request added at ledger sequence `seq`. Returns
    /// false when the record could not be persisted.
    fn admit(&mut self, request: DeploymentRequest, seq: u64) -> bool {
        match self.ctx.store.get_request(&request.id) {
            Ok(Some(existing)) if existing.outcome.is_some() => return true,
            Ok(_) => {}
            Err(e) => {
                error!(request_id = %request.id, error = %e, "cannot read request record");
                return false;
            }
        }
        let record = RequestRecord {
            request: request.clone(),
            outcome: None,
            commitment: None,
            added_seq: seq,
        };
        if let Err(e) = self.ctx.store.put_request(&record) {
            error!(request_id = %request.id, error = %e, "failed to persist request");
            return false;
        }
        info!(
            request_id = %request.id,
            image = %request.image,
            replicas = request.replicas,
            leader = ?elect_leader(&request.id, &self.alive),
            "deployment request queued"
        );
        self.enqueue(request);
        self.dispatch();
        true
    }

    /// Start evaluations for every due request this node leads.
    fn dispatch(&mut self) {
        let now = Instant::now();
        let node_id = &self.config.node_id;
        let due: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(id, p)| {
                p.not_before <= now
                    && !self.running.contains_key(*id)
                    && is_leader(id, &self.alive, node_id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in due {
            self.start_evaluation(request_id);
        }
    }

    fn start_evaluation(&mut self, request_id: RequestId) {
        let Some(pending) = self.pending.get(&request_id) else {
            return;
        };
        let job = Job {
            request: pending.request.clone(),
            records: self.telemetry.values().cloned().collect(),
            alive: self.alive.clone(),
        };
        self.generation += 1;
        let generation = self.generation;
        debug!(%request_id, attempt = pending.attempts + 1, "leading evaluation");

        let ctx = self.ctx.clone();
        let timeout = self.config.decryption_timeout;
        let done = self.done_tx.clone();
        let id = request_id.clone();
        let task = tokio::spawn(async move {
            let result = schedule_request(&ctx, timeout, job).await;
            let _ = done
                .send(Evaluated {
                    request_id: id,
                    generation,
                    result,
                })
                .await;
        });
        self.running
            .insert(request_id, Running { generation, task });
    }

    fn on_evaluated(&mut self, evaluated: Evaluated) {
        let current = self
            .running
            .get(&evaluated.request_id)
            .is_some_and(|r| r.generation == evaluated.generation);
        if !current {
            return;
        }
        self.running.remove(&evaluated.request_id);
        let request_id = evaluated.request_id;

        match evaluated.result {
            Ok(receipt) => {
                if receipt.recorded {
                    info!(%request_id, hash = %receipt.hash, "scheduling outcome anchored");
                } else {
                    info!(%request_id, hash = %receipt.hash, "request already anchored elsewhere");
                }
                // The ledger event finalizes it on every node, this one included.
                self.pending.remove(&request_id);
            }
            Err(e) => {
                let requeueable = e.is_requeueable();
                let Some(pending) = self.pending.get_mut(&request_id) else {
                    return;
                };
                pending.attempts += 1;
                let delay = if requeueable {
                    requeue_delay(&self.config, pending.attempts)
                } else {
                    self.config.requeue_max
                };
                pending.not_before = Instant::now() + delay;
                pending.last_error = Some(e.to_string());
                if requeueable {
                    warn!(
                        %request_id,
                        attempts = pending.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "evaluation failed, requeued"
                    );
                } else {
                    error!(%request_id, attempts = pending.attempts, error = %e, "evaluation failed");
                }
            }
        }
    }

    fn abandon(&mut self, request_id: &str) -> bool {
        match self.running.remove(request_id) {
            Some(running) => {
                running.task.abort();
                true
            }
            None => false,
        }
    }

    // ── Membership ─────────────────────────────────────────────────

    fn on_alive_changed(&mut self, alive: BTreeSet<NodeId>) {
        if alive == self.alive {
            return;
        }
        debug!(alive = alive.len(), "alive set changed, recomputing leadership");
        self.alive = alive;
        let node_id = &self.config.node_id;
        let alive = &self.alive;
        self.statuses
            .retain(|(owner, _), _| owner == node_id || alive.contains(owner));

        let node_id = self.config.node_id.clone();
        let lost: Vec<RequestId> = self
            .running
            .keys()
            .filter(|id| !is_leader(id, &self.alive, &node_id))
            .cloned()
            .collect();
        for request_id in lost {
            if self.abandon(&request_id) {
                info!(
                    %request_id,
                    leader = ?elect_leader(&request_id, &self.alive),
                    "leadership moved, evaluation abandoned"
                );
            }
        }
        self.dispatch();
    }

    // ── Ledger ─────────────────────────────────────────────────────

    /// Apply one ledger event. Returns true once its effects are persisted,
    /// false when it should be delivered again.
    async fn on_ledger_event(&mut self, event: &LedgerEvent) -> bool {
        match &event.kind {
            LedgerEventKind::ImageAdded { request } => self.admit(request.clone(), event.seq),
            LedgerEventKind::ImageRemoved { image } => self.on_image_removed(image, event.seq).await,
            LedgerEventKind::ImageScaled { image, replicas } => {
                self.on_image_scaled(image, *replicas, event.seq).await
            }
            LedgerEventKind::ImageDeployment {
                request_id,
                commitment,
                outcome,
            } => {
                self.on_anchored(request_id, commitment.clone(), outcome.clone())
                    .await
            }
            LedgerEventKind::StatusAnchored { node_id, commitment } => {
                debug!(seq = event.seq, %node_id, %commitment, "status digest anchored");
                true
            }
        }
    }

    async fn on_anchored(
        &mut self,
        request_id: &str,
        commitment: CommitmentHash,
        outcome: AssignmentOutcome,
    ) -> bool {
        self.abandon(request_id);
        self.pending.remove(request_id);

        if outcome.request_id() != request_id || !outcome_matches(&commitment, &outcome) {
            warn!(%request_id, %commitment, "anchored outcome does not match its commitment, ignored");
            return true;
        }

        match self.ctx.store.get_request(request_id) {
            Ok(Some(mut record)) if record.outcome.is_none() => {
                record.outcome = Some(outcome.clone());
                record.commitment = Some(commitment.clone());
                if let Err(e) = self.ctx.store.put_request(&record) {
                    error!(%request_id, error = %e, "failed to record outcome");
                    return false;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => warn!(%request_id, "outcome for a request never seen"),
            Err(e) => {
                error!(%request_id, error = %e, "cannot read request record");
                return false;
            }
        }

        match outcome {
            AssignmentOutcome::Assigned(assignment) => {
                info!(
                    %request_id,
                    image = %assignment.image,
                    placements = ?assignment.placements,
                    "assignment final"
                );
                let image = assignment.image.clone();
                match self.ctx.enforcer.apply_assignment(assignment).await {
                    Ok(0) => {}
                    Ok(started) => info!(%request_id, replicas = started, "starting local share"),
                    // Failed replicas are recorded and rescheduled by the enforcer.
                    Err(e @ EnforcerError::PartialApply { .. }) => {
                        warn!(%request_id, error = %e, "local share partially started")
                    }
                    Err(e) => {
                        error!(%request_id, error = %e, "failed to apply assignment");
                        return false;
                    }
                }
                self.enforce_scale(&image).await
            }
            AssignmentOutcome::Unsatisfiable { reason, image, .. } => {
                warn!(%request_id, %reason, "request unsatisfiable");
                self.enforce_scale(&image).await
            }
        }
    }

    async fn on_image_removed(&mut self, image: &str, seq: u64) -> bool {
        let dropped: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.request.image == image)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in &dropped {
            self.abandon(request_id);
            self.pending.remove(request_id);
        }
        let scale = ImageScale {
            removed_seq: seq,
            target: None,
        };
        if let Err(e) = self.ctx.store.put_image_scale(image, &scale) {
            error!(%image, error = %e, "failed to record image removal");
            return false;
        }
        match self.ctx.enforcer.remove_image(image).await {
            Ok(stopped) => {
                info!(%image, stopped, dropped = dropped.len(), "image removed");
                true
            }
            Err(e) => {
                error!(%image, error = %e, "failed to remove image");
                false
            }
        }
    }

    async fn on_image_scaled(&mut self, image: &str, replicas: u32, seq: u64) -> bool {
        let mut scale = match self.ctx.store.image_scale(image) {
            Ok(scale) => scale,
            Err(e) => {
                error!(%image, error = %e, "cannot read scale target");
                return false;
            }
        };
        if scale.target.is_none_or(|t| t.seq < seq) {
            scale.target = Some(ScaleTarget { replicas, seq });
            if let Err(e) = self.ctx.store.put_image_scale(image, &scale) {
                error!(%image, error = %e, "failed to record scale target");
                return false;
            }
        }
        info!(%image, replicas, seq, "scale target set");
        self.enforce_scale(image).await
    }

    /// Stop this node's replicas of `image` beyond its scale target.
    async fn enforce_scale(&self, image: &str) -> bool {
        let scale = match self.ctx.store.image_scale(image) {
            Ok(scale) if scale.target.is_some() => scale,
            Ok(_) => return true,
            Err(e) => {
                error!(%image, error = %e, "cannot read scale target");
                return false;
            }
        };
        let records = match self.ctx.store.list_requests() {
            Ok(records) => records,
            Err(e) => {
                error!(%image, error = %e, "cannot read request records");
                return false;
            }
        };
        let keys: Vec<String> = surplus_slots(&records, image, &scale)
            .into_iter()
            .filter(|slot| slot.node_id == self.config.node_id)
            .map(|slot| slot.container_key())
            .collect();
        if keys.is_empty() {
            return true;
        }
        match self.ctx.enforcer.stop_replicas(keys).await {
            Ok(stopped) => {
                if stopped > 0 {
                    info!(%image, stopped, "surplus replicas stopped");
                }
                true
            }
            Err(e) => {
                error!(%image, error = %e, "failed to stop surplus replicas");
                false
            }
        }
    }

    /// Ask the ledger for a replacement elsewhere. A replica that is no
    /// longer pending (stopped as surplus or already acknowledged) is skipped.
    /// The enforcer keeps re-sending the signal until the submission succeeds.
    fn on_reschedule(&self, signal: RescheduleSignal) {
        match self.ctx.store.get_container(&signal.container_key) {
            Ok(Some(record)) if record.reschedule_pending => {}
            Ok(_) => {
                debug!(container = %signal.container_key, "replica no longer awaits reschedule");
                return;
            }
            Err(e) => warn!(container = %signal.container_key, error = %e, "cannot read container record"),
        }
        let spec = ImageSpec {
            name: signal.image.clone(),
            replicas: 1,
            constraints: PlacementConstraints {
                max_per_node: None,
                exclude: vec![self.config.node_id.clone()],
            },
            reschedule_of: Some(signal.slot.clone()),
        };
        let sync = self.ctx.sync.clone();
        let enforcer = self.ctx.enforcer.clone();
        tokio::spawn(async move {
            match sync.add_image(spec).await {
                Ok(request) => {
                    info!(
                        container = %signal.container_key,
                        image = %signal.image,
                        request_id = %request.id,
                        reason = %signal.reason,
                        "replica rescheduled"
                    );
                    if let Err(e) = enforcer.reschedule_submitted(&signal.container_key).await {
                        debug!(container = %signal.container_key, error = %e, "reschedule acknowledgement lost");
                    }
                }
                Err(e) => error!(
                    container = %signal.container_key,
                    error = %e,
                    "failed to submit reschedule request, will retry"
                ),
            }
        });
    }

    // ── Gossip ─────────────────────────────────────────────────────

    fn observe(&mut self, record: TelemetryRecord) {
        match self.telemetry.get(&record.node_id) {
            Some(current) if current.timestamp >= record.timestamp => {}
            _ => {
                self.telemetry.insert(record.node_id.clone(), record);
            }
        }
    }

    fn record_status(&mut self, update: StatusUpdate) {
        let key = (update.node_id.clone(), update.container_key.clone());
        match self.statuses.get(&key) {
            Some(current) if current.updated_at > update.updated_at => {}
            _ => {
                self.statuses.insert(key, update);
            }
        }
    }

    fn on_gossip(&mut self, event: GossipEvent) {
        match event {
            GossipEvent::Telemetry(record) => self.observe(record),
            GossipEvent::Status(update) => self.record_status(update),
            GossipEvent::Assignment(notice) => self.on_notice(notice),
        }
    }

    /// A peer anchored an outcome. Stop working on the request and give the
    /// ledger event time to arrive; an unverifiable notice is ignored.
    fn on_notice(&mut self, notice: AssignmentNotice) {
        if !outcome_matches(&notice.commitment, &notice.outcome) {
            debug!(commitment = %notice.commitment, "assignment notice failed verification");
            return;
        }
        let request_id = notice.outcome.request_id().to_string();
        if self.abandon(&request_id) {
            debug!(%request_id, "peer anchored first, evaluation abandoned");
        }
        if let Some(pending) = self.pending.get_mut(&request_id) {
            pending.not_before = Instant::now() + self.config.notice_hold;
        }
    }

    /// Forget terminal statuses past the retention.
    fn prune_statuses(&mut self) {
        let now = epoch_millis();
        let retention = self.config.status_retention.as_millis() as u64;
        let before = self.statuses.len();
        self.statuses.retain(|_, update| {
            !matches!(update.state, ContainerState::Stopped | ContainerState::Failed)
                || now.saturating_sub(update.updated_at) < retention
        });
        let pruned = before - self.statuses.len();
        if pruned > 0 {
            debug!(pruned, "expired container statuses pruned");
        }
    }

    async fn on_local_status(&mut self, update: StatusUpdate) {
        self.record_status(update.clone());
        if let Err(e) = self.ctx.swim.publish(Piggyback::Status(update)).await {
            debug!(error = %e, "status gossip unavailable");
        }
    }
}

/// `evaluateSchedule` + `releaseAssignment` + anchor for one request.
/// Nothing outside this task changes before the anchor call.
async fn schedule_request(
    ctx: &SchedulingContext,
    decryption_timeout: Duration,
    job: Job,
) -> SchedulerResult<AnchorReceipt> {
    let outcome = match precheck(&job.request) {
        Some(outcome) => outcome,
        None => evaluate(ctx, decryption_timeout, job).await?,
    };
    let receipt = ctx.sync.anchor_assignment(&outcome).await?;
    if receipt.recorded {
        let notice = AssignmentNotice {
            commitment: receipt.hash.clone(),
            outcome,
        };
        if let Err(e) = ctx.swim.publish(Piggyback::Assignment(notice)).await {
            warn!(error = %e, "failed to gossip assignment notice");
        }
    }
    Ok(receipt)
}

async fn evaluate(
    ctx: &SchedulingContext,
    decryption_timeout: Duration,
    job: Job,
) -> SchedulerResult<AssignmentOutcome> {
    let policy = ctx.sync.cluster_policy().await;
    let constraints = effective_constraints(&job.request, &policy);
    let records: Vec<TelemetryRecord> = job
        .records
        .into_iter()
        .map(|mut record| {
            if let Some(freshness) = policy.telemetry_freshness_ms {
                record.freshness_ms = freshness;
            }
            record
        })
        .collect();

    let now = epoch_millis();
    if select_inputs(&records, &job.alive, &[], now).is_empty() {
        return Err(SchedulerError::NoTelemetry(job.request.id));
    }
    let inputs = select_inputs(&records, &job.alive, &constraints.exclude, now);

    let fhe = Arc::clone(&ctx.fhe);
    let request = job.request;
    let encrypted = tokio::task::spawn_blocking(move || {
        evaluate_schedule(fhe.as_ref(), &request, &constraints, &inputs)
    })
    .await
    .map_err(|e| SchedulerError::Evaluation(e.to_string()))??;

    let released = tokio::time::timeout(decryption_timeout, ctx.authority.release(&encrypted))
        .await
        .map_err(|_| {
            PlacementError::DecryptionUnavailable(format!(
                "no release within {}ms",
                decryption_timeout.as_millis()
            ))
        })??;
    Ok(finalize(released)?)
}
