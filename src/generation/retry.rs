//! Bounded retry with exponential backoff.
//!
//! [`execute_with_retry`] knows nothing about generation: callers hand it a
//! [`RetryPolicy`], an overall deadline and an operation whose error type can say
//! whether it is worth another attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// The operation failed with an error that must not be retried.
    Rejected { attempt: u32, error: E },
    /// The overall deadline fired before an attempt succeeded.
    DeadlineExceeded { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Rejected { attempt, .. } => *attempt,
            RetryError::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }
}

pub async fn execute_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    deadline: Instant,
    mut operation: F,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    let mut last_error = None;

    loop {
        attempt += 1;
        let result = match timeout_at(deadline, operation(attempt)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    target: "generation.retry",
                    attempt,
                    max_attempts,
                    "deadline reached during attempt"
                );
                return Err(RetryError::DeadlineExceeded {
                    attempts: attempt,
                    last: last_error,
                });
            }
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(
                        target: "generation.retry",
                        attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(RetryOutcome {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            tracing::warn!(
                target: "generation.retry",
                attempt,
                error = %err,
                "non-retryable failure"
            );
            return Err(RetryError::Rejected {
                attempt,
                error: err,
            });
        }

        if attempt >= max_attempts {
            tracing::warn!(
                target: "generation.retry",
                attempt,
                max_attempts,
                error = %err,
                "retry budget exhausted"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let backoff = policy.delay_for(attempt);
        if Instant::now() + backoff >= deadline {
            tracing::warn!(
                target: "generation.retry",
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "backoff would overrun deadline"
            );
            return Err(RetryError::DeadlineExceeded {
                attempts: attempt,
                last: Some(err),
            });
        }

        tracing::warn!(
            target: "generation.retry",
            attempt,
            max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "retryable failure"
        );
        last_error = Some(err);
        sleep(backoff).await;
    }
}
