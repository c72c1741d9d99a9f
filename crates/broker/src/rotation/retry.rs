//! Retry for credential creation
//!
//! Creation is the only swap step retried inline. The delay after attempt
//! `n` is `n² × base_backoff` (1s, then 4s with the default policy).

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{BrokerError, BrokerResult, UpstreamError};

/// Retry policy for credential creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Backoff unit
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
        }
    }

    /// Delay after the 1-based `attempt` failed
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(attempt.saturating_mul(attempt))
    }
}

/// Run `f` until it succeeds, fails permanently, or attempts run out
///
/// Errors that are not [transient](UpstreamError::is_transient) are returned
/// immediately as [`BrokerError::Upstream`]. Exhaustion yields
/// [`BrokerError::MaxRetriesExceeded`] carrying the last error.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut f: F,
) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match f().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        tracing::warn!(
            operation = operation_name,
            attempt,
            max_attempts,
            error = %error,
            "Attempt failed"
        );

        if !error.is_transient() {
            return Err(BrokerError::Upstream(error));
        }
        if attempt >= max_attempts {
            return Err(BrokerError::MaxRetriesExceeded {
                operation: operation_name.to_string(),
                attempts: attempt,
                source: error,
            });
        }

        let backoff = policy.backoff_duration(attempt);
        tracing::debug!(
            operation = operation_name,
            backoff_ms = backoff.as_millis() as u64,
            "Backing off before next attempt"
        );
        sleep(backoff).await;
    }
}
