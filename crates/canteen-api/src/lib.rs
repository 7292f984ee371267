//! canteen-api — the local node HTTP surface.
//!
//! Read-only views over the node's actors plus three write routes that
//! submit to the ledger. Every response uses the `{success, data, error}`
//! envelope.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/status` | Node id, liveness, incarnation, ledger health |
//! | GET | `/health` | Liveness probe; reports `degraded` when the ledger is |
//! | GET | `/peers` | Cluster view with telemetry freshness |
//! | GET | `/cluster` | Ledger-registered members and gossip reachability |
//! | GET | `/containers` | Local replicas and gossiped cluster status |
//! | GET | `/deployments` | Pending requests and anchored outcomes |
//! | POST | `/deploy` | Submit `{image, replicas}` to the ledger |
//! | POST | `/undeploy` | Remove an image through the ledger |
//! | POST | `/scale` | Trim an image to `{image, replicas}` through the ledger |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use canteen_cluster::SwimHandle;
use canteen_enforcer::EnforcerHandle;
use canteen_ledger::LedgerSync;
use canteen_scheduler::CoordinatorHandle;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub swim: SwimHandle,
    pub sync: LedgerSync,
    pub enforcer: EnforcerHandle,
    pub coordinator: CoordinatorHandle,
}

/// Build the node API router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/health", get(handlers::health))
        .route("/peers", get(handlers::peers))
        .route("/cluster", get(handlers::cluster))
        .route("/containers", get(handlers::containers))
        .route("/deployments", get(handlers::deployments))
        .route("/deploy", post(handlers::deploy))
        .route("/undeploy", post(handlers::undeploy))
        .route("/scale", post(handlers::scale))
        .with_state(state)
}
