//! Health probing for running containers.
//!
//! [`HealthTracker`] turns a stream of probe results into a verdict with
//! a consecutive-failure threshold and exponential backoff between probes;
//! [`http_probe`] is the optional HTTP check against a container's host port.

use std::time::Duration;

use canteen_cluster::http_client;
use http::Method;
use tracing::{debug, warn};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The check passed.
    Healthy,
    /// The check ran and failed (non-2xx, container not running).
    Unhealthy,
    /// The check could not be executed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Tracks consecutive probe results for one container.
#[derive(Debug)]
pub struct HealthTracker {
    verdict: Verdict,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32, interval: Duration) -> Self {
        Self {
            verdict: Verdict::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: (interval * 8).max(interval),
        }
    }

    /// Record a probe result and return the new verdict.
    pub fn record(&mut self, result: ProbeResult) -> Verdict {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.current_backoff = self.base_interval;
                if self.verdict != Verdict::Healthy {
                    debug!("container healthy");
                }
                self.verdict = Verdict::Healthy;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                // Back off while failing, capped.
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);
                if self.consecutive_failures >= self.unhealthy_threshold {
                    if self.verdict != Verdict::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "container marked unhealthy"
                        );
                    }
                    self.verdict = Verdict::Unhealthy;
                }
            }
        }
        self.verdict
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }

    /// Start over after a restart.
    pub fn reset(&mut self) {
        self.verdict = Verdict::Unknown;
        self.consecutive_failures = 0;
        self.current_backoff = self.base_interval;
    }
}

/// GET `http://{address}{path}`: 2xx is `Healthy`, other statuses
/// `Unhealthy`, connection errors and timeouts `Failed`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    match http_client::request(Method::GET, address, path, None, timeout).await {
        Ok((status, _)) if status.is_success() => ProbeResult::Healthy,
        Ok((status, _)) => {
            debug!(%status, %address, %path, "health probe non-2xx");
            ProbeResult::Unhealthy
        }
        Err(e) => {
            debug!(error = %e, %address, %path, "health probe failed");
            ProbeResult::Failed
        }
    }
}
