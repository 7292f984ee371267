//! Gossip endpoint — the receiving side of [`HttpTransport`](crate::transport::HttpTransport).
//!
//! Mounted on the node's P2P port. Each `POST /gossip` carries one envelope
//! and is answered with the reply envelope produced by the swim actor.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use tracing::debug;

use crate::message::Envelope;
use crate::swim::SwimHandle;

/// Build the router serving `POST /gossip`.
pub fn gossip_router(handle: SwimHandle) -> Router {
    Router::new()
        .route("/gossip", post(receive_gossip))
        .with_state(handle)
}

async fn receive_gossip(
    State(handle): State<SwimHandle>,
    Json(envelope): Json<Envelope>,
) -> impl IntoResponse {
    let sender = envelope.sender.clone();
    match handle.handle_envelope(envelope).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => {
            debug!(%sender, error = %e, "gossip exchange failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}
