use std::future::Future;
use std::time::Duration;

use sink_api::{ErrorKind, StoreError};

/// Bounded exponential backoff for store calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-call deadline; an overrun counts as `StoreUnavailable`.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts: u32,
    /// How many attempts came back `StoreRateLimited`.
    pub rate_limited: u32,
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. Returns the final result with attempt stats.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut call: F,
) -> (Result<T, StoreError>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut stats = RetryStats::default();
    let mut delay = policy.base_delay;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            tracing::warn!(
                op = what,
                attempt = attempt,
                max_attempts = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "retrying store call"
            );
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, policy.max_delay);
        }

        stats.attempts += 1;
        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::unavailable(format!(
                "{what} timed out after {}ms",
                policy.call_timeout.as_millis()
            ))),
        };

        match result {
            Ok(value) => return (Ok(value), stats),
            Err(e) => {
                if e.kind() == ErrorKind::RateLimited {
                    stats.rate_limited += 1;
                }
                if !e.is_retryable() || attempt == policy.max_retries {
                    return (Err(e), stats);
                }
                tracing::warn!(error = %e, op = what, attempt = attempt, "store call failed, will retry");
            }
        }
    }

    // The loop always returns on its last iteration.
    (
        Err(StoreError::unavailable(format!("{what}: retry budget exhausted"))),
        stats,
    )
}
