//! Swim actor — the single owner of a node's Cluster View.
//!
//! The actor task holds the [`Membership`] core and applies every mutation
//! in arrival order. Everything that touches the network (direct probes,
//! ping-req fan-out, joins, answering ping-req on behalf of a peer) runs in
//! separate tasks gated by a bounded semaphore, so a slow peer can never
//! stall the protocol period.
//!
//! Consumers observe the cluster through three channels:
//! - `watch` for the latest view (only sent when liveness changes),
//! - `broadcast` for non-membership gossip payloads new to this node,
//! - request/response commands on [`SwimHandle`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use canteen_state::{
    AssignmentNotice, ClusterView, LivenessState, StateStore, StatusUpdate, TelemetryRecord,
};

use crate::error::{ClusterError, ClusterResult};
use crate::membership::{Membership, ProbeTarget};
use crate::message::{Envelope, MessageKind, Piggyback};
use crate::transport::GossipTransport;

/// Timing and resource limits for the swim actor.
#[derive(Debug, Clone)]
pub struct SwimConfig {
    /// Length of one protocol round.
    pub protocol_period: Duration,
    /// Timeout for a direct probe; indirect probes get twice this.
    pub probe_timeout: Duration,
    /// Maximum concurrent network tasks.
    pub io_workers: usize,
}

impl Default for SwimConfig {
    fn default() -> Self {
        Self {
            protocol_period: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            io_workers: 16,
        }
    }
}

/// Gossip payloads other than membership, surfaced to subscribers.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    Telemetry(TelemetryRecord),
    Status(StatusUpdate),
    Assignment(AssignmentNotice),
}

enum Command {
    Inbound {
        envelope: Envelope,
        reply: oneshot::Sender<ClusterResult<Envelope>>,
    },
    Absorb(Envelope),
    Outbound {
        kind: MessageKind,
        recipient: Option<String>,
        reply: oneshot::Sender<Envelope>,
    },
    ProbeResult {
        target: String,
        ok: bool,
    },
    Helpers {
        target: String,
        reply: oneshot::Sender<Vec<ProbeTarget>>,
    },
    Publish(Piggyback),
    View {
        reply: oneshot::Sender<ClusterView>,
    },
    Leave {
        reply: oneshot::Sender<Vec<ProbeTarget>>,
    },
}

/// Cloneable handle to a running swim actor.
#[derive(Clone)]
pub struct SwimHandle {
    local_id: String,
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<GossipEvent>,
    view: watch::Receiver<ClusterView>,
    transport: Arc<dyn GossipTransport>,
    pool: Arc<Semaphore>,
    probe_timeout: Duration,
    seq: Arc<AtomicU64>,
}

/// Start the swim actor for `core`.
pub fn spawn(
    core: Membership,
    transport: Arc<dyn GossipTransport>,
    config: SwimConfig,
    store: StateStore,
    shutdown: watch::Receiver<bool>,
) -> (SwimHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let (events, _) = broadcast::channel(1024);
    let (view_tx, view_rx) = watch::channel(core.current_view());

    let handle = SwimHandle {
        local_id: core.local_id().to_string(),
        tx,
        events,
        view: view_rx,
        transport,
        pool: Arc::new(Semaphore::new(config.io_workers.max(1))),
        probe_timeout: config.probe_timeout,
        seq: Arc::new(AtomicU64::new(1)),
    };

    let actor = Actor {
        core,
        handle: handle.clone(),
        store,
        view_tx,
        fingerprint: Vec::new(),
    };
    let join = tokio::spawn(actor.run(rx, config.protocol_period, shutdown));
    (handle, join)
}

struct Actor {
    core: Membership,
    handle: SwimHandle,
    store: StateStore,
    view_tx: watch::Sender<ClusterView>,
    /// `(id, state, incarnation)` of the last published view.
    fingerprint: Vec<(String, LivenessState, u64)>,
}

impl Actor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(node_id = %self.core.local_id(), ?period, "swim actor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let plan = self.core.tick();
                    for target in plan.probes {
                        let handle = self.handle.clone();
                        tokio::spawn(async move { handle.run_probe(target).await; });
                    }
                    self.publish_view();
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    info!(node_id = %self.core.local_id(), "swim actor shutting down");
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Inbound { envelope, reply } => {
                self.absorb(&envelope);
                match envelope.kind {
                    MessageKind::PingReq {
                        seq,
                        target,
                        target_address,
                    } => {
                        // Probe on the requester's behalf without blocking the loop.
                        let handle = self.handle.clone();
                        let requester = envelope.sender.clone();
                        tokio::spawn(async move {
                            let reached = handle.ping(&target, &target_address).await.is_ok();
                            let kind = if reached {
                                MessageKind::Ack { seq }
                            } else {
                                MessageKind::Nack { seq }
                            };
                            let result = handle.outbound(kind, Some(requester)).await;
                            let _ = reply.send(result);
                        });
                    }
                    MessageKind::Ping { seq } => {
                        let ack = self.core.envelope(MessageKind::Ack { seq }, Some(&envelope.sender));
                        let _ = reply.send(Ok(ack));
                    }
                    MessageKind::Join | MessageKind::Ack { .. } | MessageKind::Nack { .. } => {
                        let ack = self.core.envelope(MessageKind::Ack { seq: 0 }, Some(&envelope.sender));
                        let _ = reply.send(Ok(ack));
                    }
                }
            }
            Command::Absorb(envelope) => self.absorb(&envelope),
            Command::Outbound {
                kind,
                recipient,
                reply,
            } => {
                let _ = reply.send(self.core.envelope(kind, recipient.as_deref()));
            }
            Command::ProbeResult { target, ok } => {
                if ok {
                    self.core.probe_succeeded(&target);
                } else if self.core.probe_failed(&target) {
                    self.publish_view();
                }
            }
            Command::Helpers { target, reply } => {
                let _ = reply.send(self.core.indirect_helpers(&target));
            }
            Command::Publish(item) => {
                self.core.publish(item);
            }
            Command::View { reply } => {
                let _ = reply.send(self.core.current_view());
            }
            Command::Leave { reply } => {
                let peers = self.core.leave();
                self.persist_incarnation();
                self.publish_view();
                let _ = reply.send(peers);
            }
        }
    }

    fn absorb(&mut self, envelope: &Envelope) {
        let before = self.core.incarnation();
        for item in self.core.absorb(envelope) {
            let event = match item {
                Piggyback::Telemetry(t) => GossipEvent::Telemetry(t),
                Piggyback::Status(s) => GossipEvent::Status(s),
                Piggyback::Assignment(a) => GossipEvent::Assignment(a),
                Piggyback::Membership(_) => continue,
            };
            // No subscribers is fine.
            let _ = self.handle.events.send(event);
        }
        if self.core.incarnation() != before {
            self.persist_incarnation();
        }
        self.publish_view();
    }

    fn persist_incarnation(&self) {
        if let Err(e) = self.store.record_incarnation(self.core.incarnation()) {
            warn!(error = %e, "failed to persist incarnation");
        }
    }

    fn publish_view(&mut self) {
        let view = self.core.current_view();
        let fingerprint: Vec<_> = view
            .members
            .iter()
            .map(|m| (m.id.clone(), m.state, m.incarnation))
            .collect();
        if fingerprint != self.fingerprint {
            self.fingerprint = fingerprint;
            self.view_tx.send_replace(view);
        }
    }
}

impl SwimHandle {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// `handleGossip`: apply an inbound envelope and produce the reply.
    pub async fn handle_envelope(&self, envelope: Envelope) -> ClusterResult<Envelope> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Inbound { envelope, reply }).await?;
        rx.await.map_err(|_| ClusterError::ActorStopped)?
    }

    /// `join`: contact bootstrap peers. Returns how many answered.
    pub async fn join(&self, seeds: &[String]) -> ClusterResult<usize> {
        let mut reached = 0;
        for seed in seeds {
            let envelope = self.outbound(MessageKind::Join, None).await?;
            let _permit = self.permit().await?;
            match tokio::time::timeout(self.probe_timeout * 4, self.transport.exchange(seed, envelope)).await {
                Ok(Ok(reply)) => {
                    self.send(Command::Absorb(reply)).await?;
                    reached += 1;
                    info!(%seed, "joined via bootstrap peer");
                }
                Ok(Err(e)) => warn!(%seed, error = %e, "bootstrap peer unreachable"),
                Err(_) => warn!(%seed, "bootstrap peer timed out"),
            }
        }
        if reached == 0 && !seeds.is_empty() {
            return Err(ClusterError::NetworkUnreachable(
                "no bootstrap peer answered".to_string(),
            ));
        }
        Ok(reached)
    }

    /// `probe`: run a direct probe (falling back to ping-req) against a
    /// known peer and feed the outcome to the failure detector.
    pub async fn probe(&self, peer_id: &str) -> ClusterResult<bool> {
        let view = self.current_view().await?;
        let member = view
            .get(peer_id)
            .ok_or_else(|| ClusterError::UnknownPeer(peer_id.to_string()))?;
        let target = ProbeTarget {
            id: member.id.clone(),
            address: member.address.clone(),
        };
        Ok(self.run_probe(target).await)
    }

    /// `currentView`: the actor's view right now.
    pub async fn current_view(&self) -> ClusterResult<ClusterView> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::View { reply }).await?;
        rx.await.map_err(|_| ClusterError::ActorStopped)
    }

    /// Last published view without a round-trip to the actor.
    pub fn view(&self) -> ClusterView {
        self.view.borrow().clone()
    }

    /// Receiver that wakes whenever member liveness changes.
    pub fn watch_view(&self) -> watch::Receiver<ClusterView> {
        self.view.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GossipEvent> {
        self.events.subscribe()
    }

    /// Queue a payload for piggybacked dissemination.
    pub async fn publish(&self, item: Piggyback) -> ClusterResult<()> {
        self.send(Command::Publish(item)).await
    }

    /// Announce departure and push the notice to a few peers directly.
    pub async fn leave(&self) -> ClusterResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Leave { reply }).await?;
        let peers = rx.await.map_err(|_| ClusterError::ActorStopped)?;
        let mut set = JoinSet::new();
        for peer in peers {
            let handle = self.clone();
            set.spawn(async move {
                let _ = handle.ping(&peer.id, &peer.address).await;
            });
        }
        while set.join_next().await.is_some() {}
        Ok(())
    }

    // ── Internal helpers ───────────────────────────────────────────

    async fn send(&self, cmd: Command) -> ClusterResult<()> {
        self.tx.send(cmd).await.map_err(|_| ClusterError::ActorStopped)
    }

    async fn outbound(&self, kind: MessageKind, recipient: Option<String>) -> ClusterResult<Envelope> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Outbound {
            kind,
            recipient,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClusterError::ActorStopped)
    }

    async fn permit(&self) -> ClusterResult<tokio::sync::OwnedSemaphorePermit> {
        self.pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClusterError::ActorStopped)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Direct ping. Ok only if the peer acked within the probe timeout.
    async fn ping(&self, id: &str, address: &str) -> ClusterResult<()> {
        let envelope = self
            .outbound(MessageKind::Ping { seq: self.next_seq() }, Some(id.to_string()))
            .await?;
        let _permit = self.permit().await?;
        let reply = tokio::time::timeout(self.probe_timeout, self.transport.exchange(address, envelope))
            .await
            .map_err(|_| ClusterError::Timeout(address.to_string()))??;
        let acked = reply.is_ack();
        self.send(Command::Absorb(reply)).await?;
        if acked {
            Ok(())
        } else {
            Err(ClusterError::NetworkUnreachable(address.to_string()))
        }
    }

    /// Ask `helper` to probe `target` for us.
    async fn ping_req(&self, helper: ProbeTarget, target: ProbeTarget) -> bool {
        let kind = MessageKind::PingReq {
            seq: self.next_seq(),
            target: target.id.clone(),
            target_address: target.address.clone(),
        };
        let Ok(envelope) = self.outbound(kind, Some(helper.id.clone())).await else {
            return false;
        };
        let Ok(_permit) = self.permit().await else {
            return false;
        };
        match tokio::time::timeout(
            self.probe_timeout * 2,
            self.transport.exchange(&helper.address, envelope),
        )
        .await
        {
            Ok(Ok(reply)) => {
                let acked = reply.is_ack();
                let _ = self.send(Command::Absorb(reply)).await;
                acked
            }
            _ => false,
        }
    }

    /// Full probe of one target; reports the outcome to the actor.
    async fn run_probe(&self, target: ProbeTarget) -> bool {
        let mut ok = self.ping(&target.id, &target.address).await.is_ok();
        if !ok {
            debug!(target = %target.id, "direct probe failed, trying indirect");
            let (reply, rx) = oneshot::channel();
            let helpers = match self.send(Command::Helpers { target: target.id.clone(), reply }).await {
                Ok(()) => rx.await.unwrap_or_default(),
                Err(_) => Vec::new(),
            };
            let mut set = JoinSet::new();
            for helper in helpers {
                let handle = self.clone();
                let target = target.clone();
                set.spawn(async move { handle.ping_req(helper, target).await });
            }
            while let Some(result) = set.join_next().await {
                if matches!(result, Ok(true)) {
                    ok = true;
                    set.abort_all();
                    break;
                }
            }
        }
        let _ = self
            .send(Command::ProbeResult {
                target: target.id,
                ok,
            })
            .await;
        ok
    }
}
