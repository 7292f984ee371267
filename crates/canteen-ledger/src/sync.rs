//! Ledger synchronisation for one node.
//!
//! [`LedgerSync`] wraps a [`LedgerClient`] with retry, deduplication and a
//! health signal. Delivery is at-least-once: a polled event stays in flight
//! until its consumer calls [`LedgerSync::commit`] once the event's effects
//! are persisted, and only committed events enter the store's seen-set. The
//! persisted cursor trails the oldest uncommitted event, so an event that was
//! delivered but not committed before a crash is delivered again after the
//! restart. Overlapping polls skip events already in flight.
//!
//! When retries are exhausted the sync flips to [`LedgerHealth::Degraded`]
//! and keeps serving cached state; the next successful call flips it back.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use canteen_placement::commitment::{anchor_for_outcome, anchor_for_status};
use canteen_state::{
    AssignmentOutcome, Ciphertext, ClusterPolicy, CommitmentHash, ContainerState,
    DeploymentRequest, ImageSpec, LedgerEvent, LedgerEventKind, StateStore,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::client::LedgerClient;
use crate::error::{LedgerError, LedgerResult};
use crate::retry::{RetryConfig, retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerHealth {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub retry: RetryConfig,
    /// Maximum events fetched per poll.
    pub batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            retry: RetryConfig::default(),
            batch: 128,
        }
    }
}

/// Result of anchoring an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorReceipt {
    /// Hash now on the ledger for the request.
    pub hash: CommitmentHash,
    /// Whether our submission is the one that was recorded.
    pub recorded: bool,
}

struct Inner {
    client: Arc<dyn LedgerClient>,
    store: StateStore,
    config: SyncConfig,
    health: watch::Sender<LedgerHealth>,
    policy: StdMutex<ClusterPolicy>,
    /// Sequence numbers delivered but neither committed nor released.
    in_flight: StdMutex<BTreeSet<u64>>,
    poll_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct LedgerSync {
    inner: Arc<Inner>,
}

fn event_digest(event: &LedgerEvent) -> LedgerResult<String> {
    let bytes = serde_json::to_vec(event).map_err(|e| LedgerError::Codec(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

impl LedgerSync {
    pub fn new(client: Arc<dyn LedgerClient>, store: StateStore, config: SyncConfig) -> Self {
        let (health, _) = watch::channel(LedgerHealth::Healthy);
        Self {
            inner: Arc::new(Inner {
                client,
                store,
                config,
                health,
                policy: StdMutex::new(ClusterPolicy::default()),
                in_flight: StdMutex::new(BTreeSet::new()),
                poll_lock: Mutex::new(()),
            }),
        }
    }

    pub fn client(&self) -> &Arc<dyn LedgerClient> {
        &self.inner.client
    }

    pub fn health(&self) -> LedgerHealth {
        *self.inner.health.borrow()
    }

    pub fn watch_health(&self) -> watch::Receiver<LedgerHealth> {
        self.inner.health.subscribe()
    }

    fn set_health(&self, next: LedgerHealth) {
        let changed = self.inner.health.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            match next {
                LedgerHealth::Degraded => warn!("ledger degraded, serving cached state"),
                LedgerHealth::Healthy => info!("ledger reachable again"),
            }
        }
    }

    /// Retry `op` and fold the outcome into the health signal.
    async fn call<T, F, Fut>(&self, what: &str, op: F) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = LedgerResult<T>>,
    {
        let result = retry(&self.inner.config.retry, what, op).await;
        match &result {
            Ok(_) => self.set_health(LedgerHealth::Healthy),
            Err(e) if e.is_retryable() => self.set_health(LedgerHealth::Degraded),
            Err(_) => {}
        }
        result
    }

    // ── Reads ──────────────────────────────────────────────────────

    fn in_flight(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch events after the persisted cursor and return the ones neither
    /// committed nor already in flight. Each returned event must later be
    /// passed to [`commit`](Self::commit) or [`release`](Self::release).
    pub async fn poll_once(&self) -> LedgerResult<Vec<LedgerEvent>> {
        let _guard = self.inner.poll_lock.lock().await;
        let store = &self.inner.store;
        let cursor = store.sync_cursor()?;
        let batch = self.inner.config.batch;
        let client = &self.inner.client;
        let events = self
            .call("events_since", || client.events_since(cursor, batch))
            .await?;

        let mut fresh = Vec::with_capacity(events.len());
        let mut committed_through = cursor;
        let mut contiguous = true;
        {
            let mut in_flight = self.in_flight();
            for event in events {
                if store.is_seen(event.seq, &event_digest(&event)?)? {
                    if contiguous {
                        committed_through = event.seq;
                    }
                    continue;
                }
                contiguous = false;
                if in_flight.insert(event.seq) {
                    fresh.push(event);
                }
            }
        }
        if committed_through != cursor {
            store.advance_sync_cursor(committed_through)?;
            debug!(cursor = committed_through, fresh = fresh.len(), "ledger cursor advanced");
        }
        Ok(fresh)
    }

    /// Mark `event` handled; it is never delivered again, across restarts.
    pub fn commit(&self, event: &LedgerEvent) -> LedgerResult<()> {
        self.inner.store.mark_seen(event.seq, &event_digest(event)?)?;
        self.in_flight().remove(&event.seq);
        Ok(())
    }

    /// Give `event` back; the next poll delivers it again.
    pub fn release(&self, event: &LedgerEvent) {
        self.in_flight().remove(&event.seq);
        debug!(seq = event.seq, "ledger event released for redelivery");
    }

    /// New deployment requests since the last poll. Every polled event is
    /// committed, including the ones that are not requests.
    pub async fn poll_deployment_requests(&self) -> LedgerResult<Vec<DeploymentRequest>> {
        let mut requests = Vec::new();
        for event in self.poll_once().await? {
            self.commit(&event)?;
            if let LedgerEventKind::ImageAdded { request } = event.kind {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    /// Current cluster policy, or the last known one if the ledger is down.
    pub async fn cluster_policy(&self) -> ClusterPolicy {
        let client = &self.inner.client;
        match self.call("cluster_policy", || client.cluster_policy()).await {
            Ok(bytes) => match ClusterPolicy::from_bytes(&bytes) {
                Ok(policy) => {
                    if let Ok(mut cached) = self.inner.policy.lock() {
                        *cached = policy.clone();
                    }
                    policy
                }
                Err(e) => {
                    warn!(error = %e, "undecodable cluster policy, keeping cached");
                    self.cached_policy()
                }
            },
            Err(_) => self.cached_policy(),
        }
    }

    fn cached_policy(&self) -> ClusterPolicy {
        self.inner
            .policy
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    // ── Writes ─────────────────────────────────────────────────────

    pub async fn register_node(&self, node_id: &str, capacity: Ciphertext) -> LedgerResult<()> {
        let client = &self.inner.client;
        self.call("register_node", || client.register_node(node_id, capacity.clone()))
            .await
    }

    pub async fn deregister_node(&self, node_id: &str) -> LedgerResult<()> {
        let client = &self.inner.client;
        self.call("deregister_node", || client.deregister_node(node_id))
            .await
    }

    pub async fn add_image(&self, spec: ImageSpec) -> LedgerResult<DeploymentRequest> {
        let client = &self.inner.client;
        self.call("add_image", || client.add_image(spec.clone())).await
    }

    pub async fn remove_image(&self, name: &str) -> LedgerResult<()> {
        let client = &self.inner.client;
        self.call("remove_image", || client.remove_image(name)).await
    }

    pub async fn scale_image(&self, name: &str, replicas: u32) -> LedgerResult<()> {
        let client = &self.inner.client;
        self.call("scale_image", || client.scale_image(name, replicas))
            .await
    }

    /// Anchor a scheduling outcome. If another node anchored the request
    /// first, the receipt carries that node's hash and `recorded == false`.
    pub async fn anchor_assignment(&self, outcome: &AssignmentOutcome) -> LedgerResult<AnchorReceipt> {
        let anchor = anchor_for_outcome(outcome);
        let client = &self.inner.client;
        let recorded = self
            .call("anchor_deployment", || client.anchor_deployment(anchor.clone()))
            .await?;
        if recorded {
            info!(request_id = %outcome.request_id(), hash = %anchor.hash, "outcome anchored");
            return Ok(AnchorReceipt {
                hash: anchor.hash,
                recorded,
            });
        }
        let request_id = outcome.request_id();
        let existing = self
            .call("anchored", || client.anchored(request_id))
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("anchor for {request_id}")))?;
        debug!(%request_id, hash = %existing.hash, "request already anchored");
        Ok(AnchorReceipt {
            hash: existing.hash,
            recorded: false,
        })
    }

    /// Anchor a status digest; returns false if this exact digest exists.
    pub async fn anchor_status(
        &self,
        node_id: &str,
        containers: std::collections::BTreeMap<String, ContainerState>,
    ) -> LedgerResult<bool> {
        let anchor = anchor_for_status(node_id, containers);
        let client = &self.inner.client;
        self.call("anchor_status", || client.anchor_deployment(anchor.clone()))
            .await
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// Poll on the configured interval and forward fresh events until
    /// shutdown. Failures are logged and retried on the next tick. The
    /// receiver commits what it handles; events it never received are
    /// released.
    pub async fn run(self, events: mpsc::Sender<LedgerEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!("ledger sync stopping");
                    return;
                }
            }
            match self.poll_once().await {
                Ok(fresh) => {
                    let mut fresh = fresh.into_iter();
                    while let Some(event) = fresh.next() {
                        if let Err(mpsc::error::SendError(event)) = events.send(event).await {
                            self.release(&event);
                            fresh.for_each(|rest| self.release(&rest));
                            return;
                        }
                    }
                }
                Err(e) => debug!(error = %e, "ledger poll failed"),
            }
        }
    }
}
