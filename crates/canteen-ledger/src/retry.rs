//! Bounded retry with exponential backoff for ledger RPCs.
//!
//! `delay(attempt) = min(initial * multiplier^(attempt-1), max)`, plus an
//! optional random jitter of up to a quarter of the delay. Only
//! errors for which [`LedgerError::is_retryable`](crate::error::LedgerError::is_retryable)
//! holds are retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::LedgerResult;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Delay before retry number `attempt` (1-indexed).
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let max_ms = config.max_delay.as_millis() as f64;
    let base = config.initial_delay.as_millis() as f64 * config.multiplier.powi(exponent);
    let clamped = if base.is_nan() || base < 0.0 {
        0.0
    } else {
        base.min(max_ms)
    };
    let mut delay = clamped as u64;

    if config.jitter {
        let quarter = delay / 4;
        if quarter > 0 {
            let jitter = rand::thread_rng().gen_range(0..=quarter);
            delay = delay.saturating_add(jitter).min(max_ms as u64);
        }
    }
    Duration::from_millis(delay)
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget runs out. The last error is returned on exhaustion.
pub async fn retry<T, F, Fut>(config: &RetryConfig, what: &str, mut operation: F) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(%what, attempt, "ledger call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                warn!(%what, attempts = attempt, error = %e, "ledger retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = compute_delay(config, attempt);
                debug!(%what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying ledger call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Short delays and three attempts; used by in-process clusters and tests.
pub fn fast() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_clamps() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(compute_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(compute_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(compute_delay(&config, 4), Duration::from_millis(800));
        assert_eq!(compute_delay(&config, 5), Duration::from_millis(1_000));
        assert_eq!(compute_delay(&config, 60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_a_quarter_and_varies() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        };
        let samples: Vec<Duration> = (0..64).map(|_| compute_delay(&config, 2)).collect();
        for d in &samples {
            assert!(*d >= Duration::from_millis(800));
            assert!(*d <= Duration::from_millis(1_000));
        }
        // 64 draws from 201 values are all equal with negligible probability.
        assert!(samples.iter().any(|d| *d != samples[0]));

        for attempt in 1..8 {
            assert!(compute_delay(&config, attempt) <= config.max_delay);
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast(), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LedgerError::unavailable("down"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: LedgerResult<()> = retry(&fast(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::unavailable("down"))
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: LedgerResult<()> = retry(&fast(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::Rejected("bad".into()))
        })
        .await;
        assert!(matches!(result, Err(LedgerError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
