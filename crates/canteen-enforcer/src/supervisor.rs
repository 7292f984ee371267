//! Per-container supervision.
//!
//! One task per replica drives it through pull, start and health probing,
//! restarting in place up to a budget. It never touches the store; every
//! transition goes back to the enforcer actor as a [`Report`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use canteen_state::ContainerState;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::checker::{HealthTracker, ProbeResult, Verdict};
use crate::error::EnforcerResult;
use crate::runtime::{ContainerRuntime, StartSpec};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Pull attempts before the replica fails.
    pub pull_retries: u32,
    /// Start attempts before the replica fails, both at launch and on every
    /// in-place restart.
    pub start_retries: u32,
    /// Delay after the first failed pull or start; doubles per attempt.
    pub retry_backoff: Duration,
    /// Ceiling for the doubled delay.
    pub max_backoff: Duration,
    /// In-place restarts before an unhealthy replica fails.
    pub max_restarts: u32,
    /// Consecutive failed probes that make a replica unhealthy.
    pub unhealthy_threshold: u32,
    pub health_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pull_retries: 3,
            start_retries: 3,
            retry_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_restarts: 3,
            unhealthy_threshold: 3,
            health_interval: Duration::from_secs(5),
        }
    }
}

/// A state change observed by a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub key: String,
    pub state: ContainerState,
    pub handle: Option<String>,
    pub restarts: u32,
    pub error: Option<String>,
}

pub struct Supervisor {
    pub key: String,
    pub image: String,
    pub spec: StartSpec,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub config: SupervisorConfig,
    pub reports: mpsc::Sender<Report>,
    pub stop: watch::Receiver<bool>,
}

enum Step<T> {
    Done(T),
    Stopped,
}

fn next_backoff(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

impl Supervisor {
    async fn report(
        &self,
        state: ContainerState,
        handle: Option<&str>,
        restarts: u32,
        error: Option<String>,
    ) {
        let report = Report {
            key: self.key.clone(),
            state,
            handle: handle.map(str::to_string),
            restarts,
            error,
        };
        if self.reports.send(report).await.is_err() {
            debug!(key = %self.key, "enforcer gone, dropping report");
        }
    }

    /// Sleep unless asked to stop first.
    async fn pause(&mut self, delay: Duration) -> Step<()> {
        if *self.stop.borrow() {
            return Step::Stopped;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Step::Done(()),
            _ = self.stop.changed() => Step::Stopped,
        }
    }

    /// Run `op` up to `attempts` times with capped exponential backoff.
    async fn retry_step<T, F, Fut>(
        &mut self,
        what: &'static str,
        attempts: u32,
        mut op: F,
    ) -> Step<Result<T, String>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EnforcerResult<T>>,
    {
        let attempts = attempts.max(1);
        let mut delay = self.config.retry_backoff;
        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Step::Done(Ok(value)),
                Err(e) if attempt == attempts => {
                    return Step::Done(Err(format!("{what} failed after {attempts} attempts: {e}")));
                }
                Err(e) => {
                    warn!(key = %self.key, image = %self.image, step = what, attempt, error = %e, "runtime step failed, retrying");
                    if let Step::Stopped = self.pause(delay).await {
                        return Step::Stopped;
                    }
                    delay = next_backoff(delay, self.config.max_backoff);
                }
            }
        }
        Step::Done(Err(format!("{what} never attempted")))
    }

    async fn pull(&mut self) -> Step<Result<(), String>> {
        let runtime = self.runtime.clone();
        let image = self.image.clone();
        let attempts = self.config.pull_retries;
        self.retry_step("pull", attempts, move || {
            let runtime = runtime.clone();
            let image = image.clone();
            async move { runtime.pull(&image).await }
        })
        .await
    }

    async fn start(&mut self) -> Step<Result<String, String>> {
        let runtime = self.runtime.clone();
        let image = self.image.clone();
        let spec = self.spec.clone();
        let attempts = self.config.start_retries;
        self.retry_step("start", attempts, move || {
            let runtime = runtime.clone();
            let image = image.clone();
            let spec = spec.clone();
            async move { runtime.start(&image, &spec).await }
        })
        .await
    }

    async fn stop_container(&self, handle: &str) {
        if let Err(e) = self.runtime.stop(handle).await {
            warn!(key = %self.key, %handle, error = %e, "failed to stop container");
        }
    }

    /// Drive the replica until it is stopped or fails.
    pub async fn run(mut self) {
        self.report(ContainerState::Pulling, None, 0, None).await;

        match self.pull().await {
            Step::Stopped => {
                self.report(ContainerState::Stopped, None, 0, None).await;
                return;
            }
            Step::Done(Err(error)) => {
                self.report(ContainerState::Failed, None, 0, Some(error)).await;
                return;
            }
            Step::Done(Ok(())) => {}
        }

        let mut handle = match self.start().await {
            Step::Done(Ok(h)) => h,
            Step::Done(Err(error)) => {
                self.report(ContainerState::Failed, None, 0, Some(error)).await;
                return;
            }
            Step::Stopped => {
                self.report(ContainerState::Stopped, None, 0, None).await;
                return;
            }
        };
        let mut restarts = 0;
        self.report(ContainerState::Running, Some(&handle), restarts, None)
            .await;

        let mut tracker = HealthTracker::new(
            self.config.unhealthy_threshold,
            self.config.health_interval,
        );
        loop {
            if let Step::Stopped = self.pause(tracker.next_interval()).await {
                self.stop_container(&handle).await;
                self.report(ContainerState::Stopped, Some(&handle), restarts, None)
                    .await;
                return;
            }

            let probe = match self.runtime.health_check(&handle).await {
                Ok(true) => ProbeResult::Healthy,
                Ok(false) => ProbeResult::Unhealthy,
                Err(e) => {
                    debug!(key = %self.key, error = %e, "health check errored");
                    ProbeResult::Failed
                }
            };
            let before = tracker.verdict();
            match tracker.record(probe) {
                Verdict::Healthy if before != Verdict::Healthy => {
                    self.report(ContainerState::Healthy, Some(&handle), restarts, None)
                        .await;
                }
                Verdict::Unhealthy if restarts < self.config.max_restarts => {
                    restarts += 1;
                    info!(key = %self.key, restarts, "restarting unhealthy container");
                    self.stop_container(&handle).await;
                    match self.start().await {
                        Step::Done(Ok(h)) => handle = h,
                        Step::Done(Err(error)) => {
                            self.report(ContainerState::Failed, None, restarts, Some(error))
                                .await;
                            return;
                        }
                        Step::Stopped => {
                            self.report(ContainerState::Stopped, None, restarts, None)
                                .await;
                            return;
                        }
                    }
                    tracker.reset();
                    self.report(ContainerState::Running, Some(&handle), restarts, None)
                        .await;
                }
                Verdict::Unhealthy => {
                    self.stop_container(&handle).await;
                    let error = format!("unhealthy after {restarts} restarts");
                    warn!(key = %self.key, %error, "container failed");
                    self.report(ContainerState::Failed, Some(&handle), restarts, Some(error))
                        .await;
                    return;
                }
                _ => {}
            }
        }
    }
}
