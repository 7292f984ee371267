//! Node API handlers.
//!
//! Reads go to the owning actor through its handle; writes go to the ledger
//! through `LedgerSync` and take effect when the ledger event comes back.

use std::collections::BTreeSet;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use canteen_ledger::{LedgerClient, LedgerError, LedgerHealth};
use canteen_state::{
    ContainerRecord, ImageSpec, LivenessState, NodeId, PlacementConstraints, StatusUpdate,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a failed ledger submission.
fn ledger_status(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::Rejected(_) => StatusCode::BAD_REQUEST,
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::Codec(_) => StatusCode::BAD_GATEWAY,
        LedgerError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Node ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub state: Option<LivenessState>,
    pub incarnation: u64,
    pub alive_members: usize,
    pub ledger: LedgerHealth,
}

/// GET /status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let view = state.swim.view();
    let local = view.get(state.swim.local_id());
    ApiResponse::ok(NodeStatus {
        node_id: state.swim.local_id().to_string(),
        state: local.map(|m| m.state),
        incarnation: local.map(|m| m.incarnation).unwrap_or(0),
        alive_members: view.alive_ids().len(),
        ledger: state.sync.health(),
    })
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let status = match state.sync.health() {
        LedgerHealth::Healthy => "healthy",
        LedgerHealth::Degraded => "degraded",
    };
    ApiResponse::ok(serde_json::json!({
        "status": status,
        "node_id": state.swim.local_id(),
    }))
}

// ── Membership ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub address: String,
    pub state: LivenessState,
    pub incarnation: u64,
    pub last_seen: u64,
    /// Whether a fresh telemetry record from this member is on hand.
    pub telemetry_fresh: bool,
    pub is_self: bool,
}

/// GET /peers
pub async fn peers(State(state): State<ApiState>) -> impl IntoResponse {
    let fresh: BTreeSet<NodeId> = match state.coordinator.telemetry_nodes().await {
        Ok(ids) => ids.into_iter().collect(),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    let view = state.swim.view();
    let peers: Vec<PeerInfo> = view
        .members
        .iter()
        .map(|m| PeerInfo {
            id: m.id.clone(),
            address: m.address.clone(),
            state: m.state,
            incarnation: m.incarnation,
            last_seen: m.last_seen,
            telemetry_fresh: fresh.contains(&m.id),
            is_self: m.id == view.local_id,
        })
        .collect();
    ApiResponse::ok(peers).into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterMember {
    pub node_id: NodeId,
    pub registered_at: u64,
    /// ALIVE in this node's gossip view.
    pub reachable: bool,
    pub is_self: bool,
}

/// GET /cluster
///
/// The ledger's member registry joined with gossip liveness.
pub async fn cluster(State(state): State<ApiState>) -> impl IntoResponse {
    let registered = match state.sync.client().members().await {
        Ok(nodes) => nodes,
        Err(e) => return error_response(&e.to_string(), ledger_status(&e)).into_response(),
    };
    let view = state.swim.view();
    let alive = view.alive_ids();
    let members: Vec<ClusterMember> = registered
        .into_iter()
        .map(|n| ClusterMember {
            reachable: alive.contains(&n.node_id),
            is_self: n.node_id == view.local_id,
            node_id: n.node_id,
            registered_at: n.registered_at,
        })
        .collect();
    ApiResponse::ok(members).into_response()
}

// ── Containers ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ContainersView {
    pub local: Vec<ContainerRecord>,
    /// Latest gossiped status per container across the cluster.
    pub cluster: Vec<StatusUpdate>,
}

/// GET /containers
pub async fn containers(State(state): State<ApiState>) -> impl IntoResponse {
    let local = match state.enforcer.list().await {
        Ok(records) => records,
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    let cluster = match state.coordinator.cluster_containers().await {
        Ok(updates) => updates,
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    ApiResponse::ok(ContainersView { local, cluster }).into_response()
}

// ── Deployments ────────────────────────────────────────────────

/// GET /deployments
pub async fn deployments(State(state): State<ApiState>) -> impl IntoResponse {
    match state.coordinator.deployments().await {
        Ok(snapshot) => ApiResponse::ok(snapshot).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

fn one() -> u32 {
    1
}

/// Deploy request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployBody {
    pub image: String,
    #[serde(default = "one")]
    pub replicas: u32,
    #[serde(default)]
    pub max_per_node: Option<u32>,
}

/// POST /deploy
pub async fn deploy(
    State(state): State<ApiState>,
    Json(body): Json<DeployBody>,
) -> impl IntoResponse {
    if body.image.trim().is_empty() {
        return error_response("image name is required", StatusCode::BAD_REQUEST).into_response();
    }
    if body.replicas == 0 {
        return error_response("replicas must be a positive integer", StatusCode::BAD_REQUEST)
            .into_response();
    }
    let spec = ImageSpec {
        name: body.image,
        replicas: body.replicas,
        constraints: PlacementConstraints {
            max_per_node: body.max_per_node,
            exclude: Vec::new(),
        },
        reschedule_of: None,
    };
    match state.sync.add_image(spec).await {
        Ok(request) => {
            info!(request_id = %request.id, image = %request.image, "deploy submitted");
            (StatusCode::CREATED, ApiResponse::ok(request)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "deploy submission failed");
            error_response(&e.to_string(), ledger_status(&e)).into_response()
        }
    }
}

/// Undeploy request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndeployBody {
    pub image: String,
}

/// POST /undeploy
pub async fn undeploy(
    State(state): State<ApiState>,
    Json(body): Json<UndeployBody>,
) -> impl IntoResponse {
    if body.image.trim().is_empty() {
        return error_response("image name is required", StatusCode::BAD_REQUEST).into_response();
    }
    match state.sync.remove_image(&body.image).await {
        Ok(()) => {
            info!(image = %body.image, "undeploy submitted");
            ApiResponse::ok(serde_json::json!({ "image": body.image })).into_response()
        }
        Err(e) => error_response(&e.to_string(), ledger_status(&e)).into_response(),
    }
}

/// Scale request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleBody {
    pub image: String,
    pub replicas: u32,
}

/// POST /scale
///
/// Trims the replicas of `image` requested so far down to `replicas`.
pub async fn scale(State(state): State<ApiState>, Json(body): Json<ScaleBody>) -> impl IntoResponse {
    if body.image.trim().is_empty() {
        return error_response("image name is required", StatusCode::BAD_REQUEST).into_response();
    }
    match state.sync.scale_image(&body.image, body.replicas).await {
        Ok(()) => {
            info!(image = %body.image, replicas = body.replicas, "scale submitted");
            ApiResponse::ok(serde_json::json!({ "image": body.image, "replicas": body.replicas }))
                .into_response()
        }
        Err(e) => error_response(&e.to_string(), ledger_status(&e)).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_map_to_statuses() {
        assert_eq!(
            ledger_status(&LedgerError::unavailable("down")),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ledger_status(&LedgerError::Rejected("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ledger_status(&LedgerError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn deploy_body_defaults_to_one_replica() {
        let body: DeployBody = serde_json::from_str(r#"{"image":"nginx:latest"}"#).unwrap();
        assert_eq!(body.replicas, 1);
        assert_eq!(body.max_per_node, None);
    }
}
