use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::error::UploadResult;

/// Bounded exponential backoff applied to each chunk request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately, used when latency doesn't matter (tests, local server)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay to wait after `failed_attempt` (1-based) before trying again.
    ///
    /// Returns `None` once the attempt budget is spent.
    pub fn delay_after(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt >= self.max_attempts.max(1) {
            return None;
        }

        let exponent = failed_attempt.saturating_sub(1) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);

        Some(Duration::from_millis(delay_ms as u64))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy gives up
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> UploadResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UploadResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => match policy.delay_after(attempt) {
                Some(delay) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, policy.max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}
