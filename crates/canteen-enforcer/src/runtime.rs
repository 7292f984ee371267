//! Container runtimes.
//!
//! [`DockerRuntime`] drives the local `docker` CLI through
//! `tokio::process`, each call bounded by a timeout. [`MemoryRuntime`] keeps
//! containers in a map and lets tests script pull failures and unhealthy
//! images.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::checker::{ProbeResult, http_probe};
use crate::error::{EnforcerError, EnforcerResult};

/// Label attached to every container this node starts.
pub const MANAGED_LABEL: &str = "canteen.managed=true";

/// How to start one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSpec {
    /// Container name; unique per replica.
    pub name: String,
    /// Host port mapped to `container_port`, if any.
    pub host_port: Option<u16>,
    pub container_port: u16,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn pull(&self, image: &str) -> EnforcerResult<()>;

    /// Start a container and return its runtime handle.
    async fn start(&self, image: &str, spec: &StartSpec) -> EnforcerResult<String>;

    async fn stop(&self, handle: &str) -> EnforcerResult<()>;

    async fn health_check(&self, handle: &str) -> EnforcerResult<bool>;

    /// Remove exited containers left behind by earlier runs.
    async fn cleanup_exited(&self) -> EnforcerResult<usize>;
}

// ── Docker CLI ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpCheck {
    pub path: String,
    pub timeout: Duration,
}

pub struct DockerRuntime {
    bin: String,
    op_timeout: Duration,
    pull_timeout: Duration,
    http_check: Option<HttpCheck>,
    /// Host port per handle, for the optional HTTP check.
    ports: Mutex<HashMap<String, u16>>,
}

impl DockerRuntime {
    pub fn new(bin: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            op_timeout,
            pull_timeout: op_timeout * 10,
            http_check: None,
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// Also require an HTTP 2xx from the container's host port.
    pub fn with_http_check(mut self, check: HttpCheck) -> Self {
        self.http_check = Some(check);
        self
    }

    async fn docker(&self, args: &[&str], timeout: Duration) -> EnforcerResult<String> {
        let mut command = Command::new(&self.bin);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let what = format!("{} {}", self.bin, args.first().copied().unwrap_or_default());
        let child = command
            .spawn()
            .map_err(|e| EnforcerError::Runtime(format!("{what}: spawn failed: {e}")))?;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| EnforcerError::Timeout(what.clone()))?
            .map_err(|e| EnforcerError::Runtime(format!("{what}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(EnforcerError::Runtime(format!("{what}: {stderr}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn port_of(&self, handle: &str) -> Option<u16> {
        self.ports.lock().ok()?.get(handle).copied()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> EnforcerResult<()> {
        debug!(%image, "docker pull");
        self.docker(&["pull", image], self.pull_timeout).await?;
        Ok(())
    }

    async fn start(&self, image: &str, spec: &StartSpec) -> EnforcerResult<String> {
        let mapping = spec
            .host_port
            .map(|host| format!("{host}:{}", spec.container_port));
        let mut args = vec!["run", "-d", "--name", spec.name.as_str(), "--label", MANAGED_LABEL];
        if let Some(mapping) = &mapping {
            args.push("-p");
            args.push(mapping);
        }
        args.push(image);

        let handle = self.docker(&args, self.op_timeout).await?;
        if handle.is_empty() {
            return Err(EnforcerError::Runtime(format!("docker run {image}: no container id")));
        }
        if let (Some(port), Ok(mut ports)) = (spec.host_port, self.ports.lock()) {
            ports.insert(handle.clone(), port);
        }
        info!(%image, name = %spec.name, handle = %short(&handle), "container started");
        Ok(handle)
    }

    async fn stop(&self, handle: &str) -> EnforcerResult<()> {
        self.docker(&["rm", "-f", handle], self.op_timeout).await?;
        if let Ok(mut ports) = self.ports.lock() {
            ports.remove(handle);
        }
        debug!(handle = %short(handle), "container removed");
        Ok(())
    }

    async fn health_check(&self, handle: &str) -> EnforcerResult<bool> {
        let running = self
            .docker(&["inspect", "-f", "{{.State.Running}}", handle], self.op_timeout)
            .await?;
        if running != "true" {
            return Ok(false);
        }
        match (&self.http_check, self.port_of(handle)) {
            (Some(check), Some(port)) => {
                let address = format!("127.0.0.1:{port}");
                Ok(http_probe(&address, &check.path, check.timeout).await == ProbeResult::Healthy)
            }
            _ => Ok(true),
        }
    }

    async fn cleanup_exited(&self) -> EnforcerResult<usize> {
        let label = format!("label={MANAGED_LABEL}");
        let listed = self
            .docker(
                &["ps", "-aq", "--filter", "status=exited", "--filter", &label],
                self.op_timeout,
            )
            .await?;
        let mut removed = 0;
        for id in listed.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.docker(&["rm", id], self.op_timeout).await?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "cleaned up exited containers");
        }
        Ok(removed)
    }
}

fn short(handle: &str) -> &str {
    &handle[..handle.len().min(12)]
}

// ── In-memory ─────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    running: BTreeMap<String, (String, StartSpec)>,
    pull_failures: HashMap<String, u32>,
    pull_attempts: HashMap<String, u32>,
    unhealthy: HashSet<String>,
    start_failures: HashMap<String, u32>,
    start_attempts: HashMap<String, u32>,
    exited: usize,
}

/// Scriptable runtime for tests and in-process clusters.
#[derive(Clone, Default)]
pub struct MemoryRuntime {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> EnforcerResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| EnforcerError::Runtime("memory runtime poisoned".into()))?;
        Ok(f(&mut state))
    }

    /// The next `count` pulls of `image` fail.
    pub fn fail_pulls(&self, image: &str, count: u32) {
        let _ = self.with(|s| s.pull_failures.insert(image.to_string(), count));
    }

    /// The next `count` starts of `image` fail.
    pub fn fail_starts(&self, image: &str, count: u32) {
        let _ = self.with(|s| s.start_failures.insert(image.to_string(), count));
    }

    /// Containers of `image` report unhealthy while set.
    pub fn set_unhealthy(&self, image: &str, unhealthy: bool) {
        let _ = self.with(|s| {
            if unhealthy {
                s.unhealthy.insert(image.to_string());
            } else {
                s.unhealthy.remove(image);
            }
        });
    }

    /// Pretend earlier runs left `count` exited containers behind.
    pub fn add_exited(&self, count: usize) {
        let _ = self.with(|s| s.exited += count);
    }

    pub fn pull_attempts(&self, image: &str) -> u32 {
        self.with(|s| s.pull_attempts.get(image).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn start_attempts(&self, image: &str) -> u32 {
        self.with(|s| s.start_attempts.get(image).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// `(handle, image)` of every running container.
    pub fn running(&self) -> Vec<(String, String)> {
        self.with(|s| {
            s.running
                .iter()
                .map(|(h, (image, _))| (h.clone(), image.clone()))
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn running_count(&self, image: &str) -> usize {
        self.running().iter().filter(|(_, i)| i == image).count()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn pull(&self, image: &str) -> EnforcerResult<()> {
        self.with(|s| {
            *s.pull_attempts.entry(image.to_string()).or_default() += 1;
            match s.pull_failures.get_mut(image) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(EnforcerError::Runtime(format!("pull {image}: registry error")))
                }
                _ => Ok(()),
            }
        })?
    }

    async fn start(&self, image: &str, spec: &StartSpec) -> EnforcerResult<String> {
        self.with(|s| {
            *s.start_attempts.entry(image.to_string()).or_default() += 1;
            if let Some(left) = s.start_failures.get_mut(image) {
                if *left > 0 {
                    *left -= 1;
                    return Err(EnforcerError::Runtime(format!("start {image}: refused")));
                }
            }
            s.next_id += 1;
            let handle = format!("mem-{:06}", s.next_id);
            s.running
                .insert(handle.clone(), (image.to_string(), spec.clone()));
            Ok(handle)
        })?
    }

    async fn stop(&self, handle: &str) -> EnforcerResult<()> {
        self.with(|s| {
            s.running.remove(handle);
        })
    }

    async fn health_check(&self, handle: &str) -> EnforcerResult<bool> {
        self.with(|s| match s.running.get(handle) {
            Some((image, _)) => !s.unhealthy.contains(image),
            None => false,
        })
    }

    async fn cleanup_exited(&self) -> EnforcerResult<usize> {
        self.with(|s| std::mem::take(&mut s.exited))
    }
}
