//! Minimal HTTP/1.1 JSON client over hyper.
//!
//! One connection per request; callers are gossip exchanges, ledger RPCs,
//! and the CLI, none of which benefit from pooling at this scale.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};

/// Send one request to `address` (`host:port`) and return status and body.
pub async fn request(
    method: Method,
    address: &str,
    path: &str,
    body: Option<Vec<u8>>,
    timeout: Duration,
) -> ClusterResult<(StatusCode, Bytes)> {
    let target = format!("http://{address}{path}");

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| ClusterError::NetworkUnreachable(format!("{address}: {e}")))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ClusterError::NetworkUnreachable(format!("{address}: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", address)
            .header("content-type", "application/json")
            .header("user-agent", "canteen/0.1")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ClusterError::Codec(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ClusterError::NetworkUnreachable(format!("{target}: {e}")))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ClusterError::NetworkUnreachable(format!("{target}: {e}")))?
            .to_bytes();
        Ok((status, bytes))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%target, "request timed out");
            Err(ClusterError::Timeout(target))
        }
    }
}

/// Send a JSON request and decode a JSON reply; non-2xx becomes an error.
pub async fn json<B: Serialize, R: DeserializeOwned>(
    method: Method,
    address: &str,
    path: &str,
    body: Option<&B>,
    timeout: Duration,
) -> ClusterResult<R> {
    let payload = match body {
        Some(b) => Some(serde_json::to_vec(b).map_err(|e| ClusterError::Codec(e.to_string()))?),
        None => None,
    };
    let (status, bytes) = request(method, address, path, payload, timeout).await?;
    if !status.is_success() {
        return Err(ClusterError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    serde_json::from_slice(&bytes).map_err(|e| ClusterError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_refused_is_unreachable() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = request(Method::GET, &addr, "/", None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn round_trips_json_against_axum() {
        use axum::{Json, Router, routing::post};

        let app = Router::new().route(
            "/echo",
            post(|Json(v): Json<serde_json::Value>| async move { Json(v) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sent = serde_json::json!({"hello": "world"});
        let got: serde_json::Value =
            json(Method::POST, &addr, "/echo", Some(&sent), Duration::from_secs(2))
                .await
                .unwrap();
        assert_eq!(got, sent);
    }
}
