//! Retry policy tests

use qkme_common::{retry_with_policy, RetryPolicy, Retryable};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug)]
enum TestError {
    Transient,
    Permanent,
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestError::Transient => write!(f, "transient"),
            TestError::Permanent => write!(f, "permanent"),
        }
    }
}

impl Retryable for TestError {
    fn is_retryable(&self) -> bool {
        matches!(self, TestError::Transient)
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

#[test]
fn test_delay_is_capped() {
    let policy = RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(64));

    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for(4), Duration::from_secs(8));
    assert_eq!(policy.delay_for(9), Duration::from_secs(64));
    assert_eq!(policy.delay_for(30), Duration::from_secs(64));
}

#[tokio::test]
async fn test_retries_transient_until_success() {
    let calls = AtomicU32::new(0);

    let result = retry_with_policy(&fast_policy(5), || async {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(TestError::Transient)
        } else {
            Ok(7)
        }
    })
    .await;

    assert_eq!(result.ok(), Some(7));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let calls = AtomicU32::new(0);

    let result: Result<(), TestError> = retry_with_policy(&fast_policy(3), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(TestError::Transient)
    })
    .await;

    assert!(matches!(result, Err(TestError::Transient)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_permanent_error_is_not_retried() {
    let calls = AtomicU32::new(0);

    let result: Result<(), TestError> = retry_with_policy(&fast_policy(5), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(TestError::Permanent)
    })
    .await;

    assert!(matches!(result, Err(TestError::Permanent)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
