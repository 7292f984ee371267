//! Gossip transports.
//!
//! [`GossipTransport`] is a single request/response exchange of envelopes.
//! `HttpTransport` posts JSON to a peer's `/gossip` route; `MemoryNetwork`
//! connects in-process nodes and can drop messages, take nodes down, or
//! partition the cluster for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};
use crate::http_client;
use crate::message::Envelope;
use crate::swim::SwimHandle;

/// Delivers one envelope to a peer and returns its reply.
#[async_trait]
pub trait GossipTransport: Send + Sync + 'static {
    async fn exchange(&self, address: &str, envelope: Envelope) -> ClusterResult<Envelope>;
}

// ── HTTP ───────────────────────────────────────────────────────────

/// JSON-over-HTTP transport used between real nodes.
pub struct HttpTransport {
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl GossipTransport for HttpTransport {
    async fn exchange(&self, address: &str, envelope: Envelope) -> ClusterResult<Envelope> {
        http_client::json(Method::POST, address, "/gossip", Some(&envelope), self.timeout).await
    }
}

// ── In-memory ──────────────────────────────────────────────────────

/// A request delivered to an in-memory endpoint.
pub struct Inbound {
    pub envelope: Envelope,
    pub reply: oneshot::Sender<ClusterResult<Envelope>>,
}

struct NetState {
    endpoints: HashMap<String, mpsc::Sender<Inbound>>,
    down: HashSet<String>,
    /// Unordered address pairs that cannot talk to each other.
    cuts: HashSet<(String, String)>,
    loss: f64,
    rng: StdRng,
}

/// Shared in-process network for multi-node tests.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemoryNetwork {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState {
                endpoints: HashMap::new(),
                down: HashSet::new(),
                cuts: HashSet::new(),
                loss: 0.0,
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    /// Transport for the node listening at `local_address`.
    pub fn transport(&self, local_address: &str) -> MemoryTransport {
        MemoryTransport {
            net: self.clone(),
            local: local_address.to_string(),
        }
    }

    /// Attach a swim node to `address` and serve its inbound envelopes.
    pub async fn serve(&self, address: &str, handle: SwimHandle) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<Inbound>(256);
        self.state
            .lock()
            .await
            .endpoints
            .insert(address.to_string(), tx);
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let handle = handle.clone();
                tokio::spawn(async move {
                    let result = handle.handle_envelope(inbound.envelope).await;
                    let _ = inbound.reply.send(result);
                });
            }
        })
    }

    /// Probability that any single exchange is lost.
    pub async fn set_loss(&self, loss: f64) {
        self.state.lock().await.loss = loss.clamp(0.0, 1.0);
    }

    /// Take a node off the network (or bring it back).
    pub async fn set_down(&self, address: &str, down: bool) {
        let mut state = self.state.lock().await;
        if down {
            state.down.insert(address.to_string());
        } else {
            state.down.remove(address);
        }
    }

    /// Cut every link between the two groups.
    pub async fn partition(&self, left: &[&str], right: &[&str]) {
        let mut state = self.state.lock().await;
        for a in left {
            for b in right {
                state.cuts.insert(link(a, b));
            }
        }
    }

    /// Remove all partitions.
    pub async fn heal(&self) {
        self.state.lock().await.cuts.clear();
    }

    async fn route(&self, from: &str, to: &str) -> ClusterResult<mpsc::Sender<Inbound>> {
        let mut state = self.state.lock().await;
        let unreachable = || ClusterError::NetworkUnreachable(format!("{from} -> {to}"));
        if state.down.contains(from) || state.down.contains(to) {
            return Err(unreachable());
        }
        if state.cuts.contains(&link(from, to)) {
            return Err(unreachable());
        }
        let loss = state.loss;
        if loss > 0.0 && state.rng.gen_bool(loss) {
            debug!(%from, %to, "simulated message loss");
            return Err(unreachable());
        }
        state.endpoints.get(to).cloned().ok_or_else(unreachable)
    }
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    net: MemoryNetwork,
    local: String,
}

#[async_trait]
impl GossipTransport for MemoryTransport {
    async fn exchange(&self, address: &str, envelope: Envelope) -> ClusterResult<Envelope> {
        let endpoint = self.net.route(&self.local, address).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        endpoint
            .send(Inbound {
                envelope,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClusterError::NetworkUnreachable(address.to_string()))?;
        reply_rx
            .await
            .map_err(|_| ClusterError::NetworkUnreachable(address.to_string()))?
    }
}
