//! Retry with exponential backoff for connectivity failures

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Factor applied to the delay after each failed attempt
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Doubling backoff starting at `base_delay` and capped at `max_delay`
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay to wait after `attempt` failures (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Errors that know whether another attempt may succeed
pub trait Retryable {
    /// True when the failure is transient (connectivity, timeouts)
    fn is_retryable(&self) -> bool;
}

/// Execute `operation` until it succeeds, fails permanently, or the policy runs out
pub async fn retry_with_policy<F, T, E, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempts > 0 {
                    debug!("Operation succeeded after {} attempts", attempts + 1);
                }
                return Ok(result);
            }
            Err(err) => {
                attempts += 1;

                if !err.is_retryable() {
                    warn!("Non-retryable error encountered: {}", err);
                    return Err(err);
                }

                if attempts >= policy.max_attempts {
                    error!(
                        "Max retry attempts ({}) exceeded for error: {}",
                        policy.max_attempts, err
                    );
                    return Err(err);
                }

                let delay = policy.delay_for(attempts);
                let actual_delay = if policy.jitter {
                    let jitter_range = delay.as_millis() as u64 / 4;
                    delay + Duration::from_millis(fastrand::u64(0..=jitter_range))
                } else {
                    delay
                };

                debug!(
                    "Retrying operation (attempt {}/{}) after {:?} delay: {}",
                    attempts + 1,
                    policy.max_attempts,
                    actual_delay,
                    err
                );

                tokio::time::sleep(actual_delay).await;
            }
        }
    }
}
