//! # Backoff Retry Policy
//!
//! Pure exponential backoff: attempt 1 runs immediately, attempt k+1 is
//! delayed by `min(initial_delay * backoff_factor^(k-1), max_delay)`. The
//! policy is failure-agnostic unless the caller supplies a retryability
//! predicate; exhausting the attempt budget re-raises the last failure tagged
//! with the total attempt count.

use crate::config::BackoffConfig;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Failure of a retried operation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RetryError<E> {
    /// All attempts were used; `source` is the last failure.
    #[error("operation failed after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },

    /// The retryability predicate rejected the failure; no further attempts
    /// were made.
    #[error("operation failed with non-retryable error after {attempts} attempts: {source}")]
    Aborted { attempts: u32, source: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Aborted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn source(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source, .. } => source,
        }
    }

    pub fn into_source(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source, .. } => source,
        }
    }
}

/// Stateless retry executor configured from [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay inserted before attempt `attempt + 1`, given `attempt` completed
    /// attempts (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.config.backoff_factor.powi(exponent as i32);
        let delay_ms = (self.config.initial_delay_ms as f64 * factor)
            .min(self.config.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Execute with retries; every failure is considered retryable.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_if(operation, |_| true).await
    }

    /// Execute with retries, asking `retryable` whether a failure is worth
    /// another attempt. The first non-retryable failure aborts immediately.
    pub async fn execute_if<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(source) => {
                    if !retryable(&source) {
                        warn!(attempt, error = %source, "Non-retryable failure, aborting");
                        return Err(RetryError::Aborted {
                            attempts: attempt,
                            source,
                        });
                    }
                    if attempt >= max_attempts {
                        warn!(attempt, error = %source, "Retry budget exhausted");
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, initial_ms: u64, max_ms: u64, factor: f64) -> RetryPolicy {
        RetryPolicy::new(BackoffConfig {
            max_attempts,
            initial_delay_ms: initial_ms,
            max_delay_ms: max_ms,
            backoff_factor: factor,
        })
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = policy(5, 100, 350, 2.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        // 400 would exceed the cap.
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(4), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn first_attempt_success_needs_no_delay() {
        let policy = policy(3, 10, 100, 2.0);
        let result: Result<&str, RetryError<String>> =
            policy.execute(|| async { Ok("done") }).await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = policy(3, 1, 5, 2.0);
        let calls = AtomicU32::new(0);
        let result = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let policy = policy(3, 1, 5, 2.0);
        let result: Result<(), RetryError<String>> = policy
            .execute(|| async { Err("always".to_string()) })
            .await;
        match result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source, "always");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn predicate_rejection_aborts_immediately() {
        let policy = policy(5, 1, 5, 2.0);
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<String>> = policy
            .execute_if(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("validation".to_string()) }
                },
                |err| !err.contains("validation"),
            )
            .await;
        assert!(matches!(result, Err(RetryError::Aborted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
