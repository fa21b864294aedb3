//! Retry for the connection phase of upstream calls
//!
//! Only the request that opens a stream is retried. Once bytes have been
//! forwarded to the client a failure ends the segment instead.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up once this much time has been spent retrying
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(20),
        }
    }
}

impl RetryConfig {
    /// A config that makes exactly one attempt.
    pub fn disabled() -> Self {
        Self {
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            max_elapsed: Duration::ZERO,
        }
    }
}

/// Run `operation`, retrying errors for which [`RelayError::is_retryable`] holds.
pub async fn retry_with_backoff<F, Fut, T>(config: RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if config.max_elapsed.is_zero() {
        return operation().await;
    }

    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_interval)
        .with_max_interval(config.max_interval)
        .with_multiplier(2.0)
        .with_max_elapsed_time(Some(config.max_elapsed))
        .build();

    let operation = &operation;
    backoff::future::retry(policy, move || async move {
        operation().await.map_err(|e| {
            if e.is_retryable() {
                tracing::warn!(error = %e, "upstream call failed, retrying");
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result = retry_with_backoff(fast(), move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RelayError::api_error(503, "busy"))
            } else {
                Ok("ok")
            }
        })
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<()> = retry_with_backoff(fast(), move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::api_error(401, "bad key"))
        })
        .await;

        assert_eq!(result, Err(RelayError::api_error(401, "bad key")));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_makes_one_attempt() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<()> = retry_with_backoff(RetryConfig::disabled(), move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::api_error(503, "busy"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
