//! HTTP binding of the ledger contract.
//!
//! [`ledger_router`] serves a [`StoreLedger`] under `/ledger`; [`HttpLedger`]
//! is the matching client used by nodes pointed at a remote ledger URL.
//!
//! | Method | Path | Contract operation |
//! |---|---|---|
//! | GET | `/ledger/nodes` | `members` |
//! | POST | `/ledger/nodes` | `register_node` |
//! | DELETE | `/ledger/nodes/{id}` | `deregister_node` |
//! | POST | `/ledger/images` | `add_image` |
//! | POST | `/ledger/images/remove` | `remove_image` |
//! | POST | `/ledger/images/scale` | `scale_image` |
//! | POST | `/ledger/anchors` | `anchor_deployment` |
//! | GET | `/ledger/anchors/{request_id}` | `anchored` |
//! | GET | `/ledger/policy` | `cluster_policy` |
//! | GET | `/ledger/events?after=N&limit=M` | `events_since` |

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use canteen_cluster::http_client;
use canteen_state::{
    AnchorCommitment, Ciphertext, DeploymentRequest, ImageSpec, LedgerEvent, RegisteredNode,
};
use http::Method;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{LedgerClient, StoreLedger};
use crate::error::{LedgerError, LedgerResult};

const DEFAULT_EVENT_LIMIT: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterNodeBody {
    pub node_id: String,
    pub encrypted_capacity: Ciphertext,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveImageBody {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScaleImageBody {
    pub name: String,
    pub replicas: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnchorReply {
    pub recorded: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyReply {
    /// Hex-encoded policy bytes.
    pub policy: String,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub after: u64,
    pub limit: Option<usize>,
}

// ── Server ────────────────────────────────────────────────────────

pub fn ledger_router(ledger: StoreLedger) -> Router {
    let routes = Router::new()
        .route("/nodes", get(list_nodes).post(register_node))
        .route("/nodes/{id}", delete(deregister_node))
        .route("/images", post(add_image))
        .route("/images/remove", post(remove_image))
        .route("/images/scale", post(scale_image))
        .route("/anchors", post(anchor))
        .route("/anchors/{request_id}", get(anchored))
        .route("/policy", get(policy))
        .route("/events", get(events))
        .with_state(ledger);
    Router::new().nest("/ledger", routes)
}

fn error_response(err: LedgerError) -> Response {
    let status = match &err {
        LedgerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::Rejected(_) | LedgerError::Codec(_) => StatusCode::BAD_REQUEST,
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

fn reply<T: Serialize>(result: LedgerResult<T>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /ledger/nodes
async fn list_nodes(State(ledger): State<StoreLedger>) -> Response {
    reply(ledger.members().await)
}

/// POST /ledger/nodes
async fn register_node(
    State(ledger): State<StoreLedger>,
    Json(body): Json<RegisterNodeBody>,
) -> Response {
    reply(
        ledger
            .register_node(&body.node_id, body.encrypted_capacity)
            .await
            .map(|()| true),
    )
}

/// DELETE /ledger/nodes/{id}
async fn deregister_node(State(ledger): State<StoreLedger>, Path(id): Path<String>) -> Response {
    reply(ledger.deregister_node(&id).await.map(|()| true))
}

/// POST /ledger/images
async fn add_image(State(ledger): State<StoreLedger>, Json(spec): Json<ImageSpec>) -> Response {
    reply(ledger.add_image(spec).await)
}

/// POST /ledger/images/remove
async fn remove_image(
    State(ledger): State<StoreLedger>,
    Json(body): Json<RemoveImageBody>,
) -> Response {
    reply(ledger.remove_image(&body.name).await.map(|()| true))
}

/// POST /ledger/images/scale
async fn scale_image(
    State(ledger): State<StoreLedger>,
    Json(body): Json<ScaleImageBody>,
) -> Response {
    reply(
        ledger
            .scale_image(&body.name, body.replicas)
            .await
            .map(|()| true),
    )
}

/// POST /ledger/anchors
async fn anchor(
    State(ledger): State<StoreLedger>,
    Json(commitment): Json<AnchorCommitment>,
) -> Response {
    reply(
        ledger
            .anchor_deployment(commitment)
            .await
            .map(|recorded| AnchorReply { recorded }),
    )
}

/// GET /ledger/anchors/{request_id}
async fn anchored(
    State(ledger): State<StoreLedger>,
    Path(request_id): Path<String>,
) -> Response {
    reply(ledger.anchored(&request_id).await)
}

/// GET /ledger/policy
async fn policy(State(ledger): State<StoreLedger>) -> Response {
    reply(ledger.cluster_policy().await.map(|bytes| PolicyReply {
        policy: hex::encode(bytes),
    }))
}

/// GET /ledger/events
async fn events(State(ledger): State<StoreLedger>, Query(q): Query<EventsQuery>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(DEFAULT_EVENT_LIMIT);
    reply(ledger.events_since(q.after, limit).await)
}

// ── Client ────────────────────────────────────────────────────────

/// [`LedgerClient`] speaking to a remote `canteend ledger`.
pub struct HttpLedger {
    address: String,
    timeout: Duration,
}

impl HttpLedger {
    /// `url` may be `host:port` or `http://host:port[/]`.
    pub fn new(url: &str, timeout: Duration) -> Self {
        let address = url
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Self { address, timeout }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn call<B: Serialize + Sync, R: serde::de::DeserializeOwned + Send>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> LedgerResult<R> {
        debug!(address = %self.address, %method, %path, "ledger rpc");
        Ok(http_client::json(method, &self.address, path, body, self.timeout).await?)
    }
}

#[async_trait]
impl LedgerClient for HttpLedger {
    async fn register_node(
        &self,
        node_id: &str,
        encrypted_capacity: Ciphertext,
    ) -> LedgerResult<()> {
        let body = RegisterNodeBody {
            node_id: node_id.to_string(),
            encrypted_capacity,
        };
        let _: IgnoredAny = self.call(Method::POST, "/ledger/nodes", Some(&body)).await?;
        Ok(())
    }

    async fn deregister_node(&self, node_id: &str) -> LedgerResult<()> {
        let path = format!("/ledger/nodes/{node_id}");
        let _: IgnoredAny = self.call(Method::DELETE, &path, None::<&()>).await?;
        Ok(())
    }

    async fn members(&self) -> LedgerResult<Vec<RegisteredNode>> {
        self.call(Method::GET, "/ledger/nodes", None::<&()>).await
    }

    async fn add_image(&self, spec: ImageSpec) -> LedgerResult<DeploymentRequest> {
        self.call(Method::POST, "/ledger/images", Some(&spec)).await
    }

    async fn remove_image(&self, name: &str) -> LedgerResult<()> {
        let body = RemoveImageBody {
            name: name.to_string(),
        };
        let _: IgnoredAny = self
            .call(Method::POST, "/ledger/images/remove", Some(&body))
            .await?;
        Ok(())
    }

    async fn scale_image(&self, name: &str, replicas: u32) -> LedgerResult<()> {
        let body = ScaleImageBody {
            name: name.to_string(),
            replicas,
        };
        let _: IgnoredAny = self
            .call(Method::POST, "/ledger/images/scale", Some(&body))
            .await?;
        Ok(())
    }

    async fn anchor_deployment(&self, commitment: AnchorCommitment) -> LedgerResult<bool> {
        let reply: AnchorReply = self
            .call(Method::POST, "/ledger/anchors", Some(&commitment))
            .await?;
        Ok(reply.recorded)
    }

    async fn anchored(&self, request_id: &str) -> LedgerResult<Option<AnchorCommitment>> {
        let path = format!("/ledger/anchors/{request_id}");
        self.call(Method::GET, &path, None::<&()>).await
    }

    async fn cluster_policy(&self) -> LedgerResult<Vec<u8>> {
        let reply: PolicyReply = self.call(Method::GET, "/ledger/policy", None::<&()>).await?;
        hex::decode(&reply.policy).map_err(|e| LedgerError::Codec(e.to_string()))
    }

    async fn events_since(&self, after: u64, limit: usize) -> LedgerResult<Vec<LedgerEvent>> {
        let path = format!("/ledger/events?after={after}&limit={limit}");
        self.call(Method::GET, &path, None::<&()>).await
    }
}
