//! Bounded polling
//!
//! Every wait in the workflow goes through `poll`: a fixed interval, a fixed
//! attempt budget, and a typed `TimeoutError` when the budget runs out.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{InstallerError, TimeoutError};

/// Interval and attempt budget of a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Waiting for a container to reach the running state
    pub const CONTAINER: RetryPolicy = RetryPolicy::new(Duration::from_secs(2), 15);

    /// Waiting for a dependency to become ready before provisioning it
    pub const DEPENDENCY: RetryPolicy = RetryPolicy::new(Duration::from_secs(2), 60);

    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Call `probe` every `policy.interval` until `predicate` accepts its value
///
/// The first probe happens after one interval. Probe errors abort the loop
/// immediately; only an exhausted budget yields `TimeoutError`.
pub async fn poll<T, F, Fut, P>(
    policy: RetryPolicy,
    operation: &str,
    mut probe: F,
    predicate: P,
) -> Result<T, InstallerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, InstallerError>>,
    P: Fn(&T) -> bool,
{
    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;
        let value = probe().await?;
        if predicate(&value) {
            debug!("{} ready after {} attempt(s)", operation, attempt);
            return Ok(value);
        }
    }

    Err(TimeoutError {
        operation: operation.to_string(),
        attempts: policy.max_attempts,
        interval: policy.interval,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::ConfigError;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_when_predicate_holds() {
        let calls = AtomicU32::new(0);
        let value = tokio_test::assert_ok!(
            poll(
                RetryPolicy::CONTAINER,
                "counter",
                || async { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) },
                |n| *n == 3,
            )
            .await
        );
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_exact_budget() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let err = poll(
            RetryPolicy::new(Duration::from_secs(2), 15),
            "never",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            },
            |ready| *ready,
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 15);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        match err {
            InstallerError::Timeout(t) => assert_eq!(t.attempts, 15),
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_aborts() {
        let calls = AtomicU32::new(0);
        let err = poll(
            RetryPolicy::CONTAINER,
            "broken",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<bool, _>(
                    ConfigError::MissingField {
                        field: "x".to_string(),
                    }
                    .into(),
                )
            },
            |_| true,
        )
        .await
        .unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
