//! Retry with exponential backoff.
//!
//! Used by the alert pipeline in front of the alert sink. Works together
//! with [`CircuitBreaker`]: a call rejected by an open circuit is not
//! attempted at all, and a call that exhausts its retries counts as one
//! circuit failure.
//!
//! # Usage
//!
//! ```rust,ignore
//! use slawatch_core::retry::{RetryPolicy, with_retry};
//!
//! let policy = RetryPolicy::default();
//! let result = with_retry(&policy, || async { sink.send(&alert).await }).await;
//! ```

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{AlertError, Error, Result, StoreError};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Random jitter range as a fraction (0.1 = ±10%).
    pub jitter_percent: f64,
    /// Maximum number of attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    /// Alert delivery defaults: 3 attempts, 1s initial, 30s cap.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(3),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // 2^31 is already far past any max_delay
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let jitter_range = base_ms * self.jitter_percent;
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error).
    pub result: Result<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent, including delays.
    pub elapsed: Duration,
}

/// Execute an async operation with retry and exponential backoff.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_outcome(policy, operation).await.result
}

/// Execute an async operation with retry, returning the detailed outcome.
///
/// Errors that [`is_retryable`] rejects end the loop immediately.
pub async fn with_retry_outcome<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = tokio::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;

                if !is_retryable(&e) {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        warn!(
                            attempt,
                            max_attempts = max,
                            error = %e,
                            "Operation failed after all retry attempts"
                        );
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                            elapsed: start.elapsed(),
                        };
                    }
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn lock_circuit(circuit: &Mutex<CircuitBreaker>) -> std::sync::MutexGuard<'_, CircuitBreaker> {
    match circuit.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Execute an operation with retry behind a shared circuit breaker.
///
/// The breaker lock is held only to admit the call and to record its
/// outcome, never across the operation itself.
pub async fn with_retry_and_circuit<T, F, Fut>(
    policy: &RetryPolicy,
    circuit: &Mutex<CircuitBreaker>,
    operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    {
        let mut breaker = lock_circuit(circuit);
        if !breaker.allow() {
            return RetryOutcome {
                result: Err(Error::CircuitOpen {
                    circuit: breaker.name().to_string(),
                    retry_after_ms: breaker.retry_after_ms(),
                }),
                attempts: 0,
                elapsed: Duration::ZERO,
            };
        }
    }

    let outcome = with_retry_outcome(policy, operation).await;

    let mut breaker = lock_circuit(circuit);
    match &outcome.result {
        Ok(_) => breaker.record_success(),
        Err(_) => breaker.record_failure(),
    }
    outcome
}

/// Check if an error is worth retrying.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Alert(e) => match e {
            AlertError::Http(_) | AlertError::Timeout(_) => true,
            // Server-side and throttling rejections may clear up; client errors will not.
            AlertError::Rejected { status } => *status >= 500 || *status == 429,
            AlertError::Sink(_) => true,
        },
        Error::Store(e) => matches!(e, StoreError::Database(_) | StoreError::Join(_)),
        Error::Cache(_) | Error::Timeout { .. } | Error::Io(_) | Error::Runtime(_) => true,
        Error::Config(_)
        | Error::RunNotFound(_)
        | Error::CalculatorNotFound { .. }
        | Error::TenantAccessDenied { .. }
        | Error::CircuitOpen { .. }
        | Error::Json(_) => false,
    }
}
