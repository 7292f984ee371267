//! Operator commands against a running node's API.

use std::time::Duration;

use canteen_cluster::http_client;
use http::Method;
use serde_json::{Value, json};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn call(method: Method, api: &str, path: &str, body: Option<Value>) -> anyhow::Result<Value> {
    let payload = body.map(|b| b.to_string().into_bytes());
    let (status, bytes) = http_client::request(method, api, path, payload, TIMEOUT)
        .await
        .map_err(|e| anyhow::anyhow!("{api}{path}: {e}"))?;
    let reply: Value = serde_json::from_slice(&bytes)
        .map_err(|e| anyhow::anyhow!("{api}{path}: invalid reply ({status}): {e}"))?;
    if !status.is_success() || reply["success"] != true {
        let error = reply["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("{path} failed ({status}): {error}");
    }
    Ok(reply["data"].clone())
}

fn print(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn deploy(
    api: &str,
    image: &str,
    replicas: u32,
    max_per_node: Option<u32>,
) -> anyhow::Result<()> {
    let data = call(
        Method::POST,
        api,
        "/deploy",
        Some(json!({ "image": image, "replicas": replicas, "max_per_node": max_per_node })),
    )
    .await?;
    println!(
        "submitted {} as {} ({} replicas)",
        image,
        data["id"].as_str().unwrap_or("?"),
        replicas
    );
    Ok(())
}

pub async fn undeploy(api: &str, image: &str) -> anyhow::Result<()> {
    call(Method::POST, api, "/undeploy", Some(json!({ "image": image }))).await?;
    println!("removal of {image} submitted");
    Ok(())
}

pub async fn scale(api: &str, image: &str, replicas: u32) -> anyhow::Result<()> {
    call(
        Method::POST,
        api,
        "/scale",
        Some(json!({ "image": image, "replicas": replicas })),
    )
    .await?;
    println!("scale of {image} to {replicas} replicas submitted");
    Ok(())
}

/// Print one of the read-only views (`status`, `peers`, `cluster`,
/// `containers`, `deployments`).
pub async fn show(api: &str, view: &str) -> anyhow::Result<()> {
    let data = call(Method::GET, api, &format!("/{view}"), None).await?;
    print(&data)
}
