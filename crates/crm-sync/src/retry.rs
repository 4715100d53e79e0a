//! Retry with configurable backoff for adapter calls.

use std::time::Duration;

use crm_types::{CrmError, Result};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64)
                    .saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Run an adapter call, retrying transient failures.
///
/// `f` is called at most `max_attempts` times (at least once). Only errors
/// for which [`CrmError::is_transient`] holds are retried; anything else is
/// returned from the attempt that produced it. When every attempt fails
/// transiently the result is [`CrmError::RetriesExhausted`].
pub async fn retry_transient<T, F, Fut>(
    operation: &str,
    max_attempts: usize,
    policy: &BackoffPolicy,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = max_attempts.max(1);
    for attempt in 0..attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt + 1 == attempts {
                    tracing::warn!(operation, attempts, error = %e, "Retries exhausted");
                    break;
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(CrmError::RetriesExhausted {
        operation: operation.to_string(),
        attempts,
    })
}
