//! Retry and timeout helpers for connector calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{ConnectorError, ConnectorResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay before first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(600),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate delay for a given attempt (0-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self
                .backoff_multiplier
                .powi(i32::try_from(attempt).unwrap_or(i32::MAX));

        let delay_ms = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Up to 25% jitter
            let jitter_factor = 1.0 + (rand::random::<f64>() * 0.25);
            delay_ms * jitter_factor
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// Repeats an operation after retryable failures, sleeping per
/// [`RetryConfig`] between attempts.
///
/// The caller decides which errors are worth another attempt, so the same
/// schedule serves connector calls and deferred hub tasks.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails with an error
    /// `should_retry` rejects, or the retry budget is spent.
    ///
    /// On success returns the value and the number of attempts made.
    pub async fn run<T, E, F, Fut, P>(&self, should_retry: P, mut operation: F) -> Result<(T, u32), E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok((value, retries + 1)),
                Err(e) if should_retry(&e) && retries < self.config.max_retries => {
                    let delay = self.config.delay_for(retries);
                    warn!(
                        attempt = retries + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Bound a connector call by `limit`.
///
/// An elapsed timer becomes [`ConnectorError::Timeout`]: the far side may
/// or may not have applied the change.
pub async fn with_timeout<F, T>(limit: Duration, operation: F) -> ConnectorResult<T>
where
    F: Future<Output = ConnectorResult<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::Timeout {
            timeout_secs: limit.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig {
            jitter: false,
            ..fast_config(10)
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(1));
        assert_eq!(config.delay_for(1), Duration::from_millis(2));
        assert_eq!(config.delay_for(20), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fast_config(3));

        let counter = calls.clone();
        let (value, attempts) = executor
            .run(ConnectorError::is_transient, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ConnectorError::connection_failed("refused"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fast_config(3));

        let counter = calls.clone();
        let result: Result<((), u32), ConnectorError> = executor
            .run(ConnectorError::is_transient, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ConnectorError::not_found("alice"))
                }
            })
            .await;

        assert!(matches!(result, Err(ConnectorError::ObjectNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fast_config(2));

        let counter = calls.clone();
        let result: Result<((), u32), String> = executor
            .run(
                |_: &String| true,
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err("board offline".to_string())
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap_err(), "board offline");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_unknown_outcome() {
        let result: ConnectorResult<()> = with_timeout(Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_outcome_unknown());
        assert!(err.is_transient());
    }
}
