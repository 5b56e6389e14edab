//! Retry policy with exponential backoff and jitter.
//!
//! Backoff doubles with each attempt and is capped; rate-limit rejections
//! wait a configurable multiple longer. A random jitter fraction is added so
//! concurrent retries do not synchronize against the provider.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::GatewayError;

/// Retry configuration for gateway calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries before giving up.
    pub max_retries: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
    /// Multiplier applied to the backoff after a rate-limit rejection.
    pub rate_limit_multiplier: u32,
    /// Jitter fraction in `[0, 1]` added to each backoff.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            rate_limit_multiplier: 4,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Execute `operation`, retrying transient failures with backoff.
    ///
    /// Non-transient errors return immediately; transient errors are retried
    /// until the budget is exhausted, after which the last error is returned.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_transient() || attempt >= self.max_retries {
                        return Err(err);
                    }

                    let backoff = self.backoff_for(attempt, &err);
                    warn!(
                        attempt = attempt + 1,
                        max = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient gateway failure, backing off"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff for the given attempt: `initial * 2^attempt` capped at the
    /// maximum, stretched for rate limits, plus jitter.
    fn backoff_for(&self, attempt: u32, err: &GatewayError) -> Duration {
        let mut backoff_ms = self
            .initial_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt));

        if matches!(err, GatewayError::RateLimited) {
            backoff_ms = backoff_ms.saturating_mul(u64::from(self.rate_limit_multiplier));
        }

        backoff_ms = backoff_ms.min(self.max_backoff_ms);

        let jitter_ms = if self.jitter > 0.0 {
            let bound = (backoff_ms as f64 * self.jitter).max(1.0) as u64;
            rand::thread_rng().gen_range(0..bound)
        } else {
            0
        };

        Duration::from_millis(backoff_ms + jitter_ms)
    }
}
