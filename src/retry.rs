//! Bounded retry with deterministic exponential backoff.
//!
//! [`RetryEngine::execute`] wraps one unit of work. Attempt 0 runs
//! immediately; each failure is classified by an explicit policy function
//! ([`classify`] by default). Fatal errors abort at once, retryable ones are
//! retried after `min(max_delay, initial_delay * 2^(n-1))` for retry `n`
//! until `max_retries` is used up. Every failed attempt is recorded in the
//! returned [`RetryMetadata`].

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, FailureKind, Result};

/// Retry budget and backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// A policy that runs the unit exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry `retry` (1-indexed).
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Default classification policy.
///
/// Transport, timeout and resource-exhaustion failures are retryable.
/// Structural errors, resource-gate rejections, provisioning failures,
/// validation or internal executor errors and cancellation are fatal.
pub fn classify(err: &Error) -> ErrorClass {
    match err {
        Error::Timeout(_) | Error::Io(_) => ErrorClass::Retryable,
        Error::Execution { kind, .. } => match kind {
            FailureKind::Transport | FailureKind::Timeout | FailureKind::ResourceExhausted => {
                ErrorClass::Retryable
            }
            FailureKind::Validation | FailureKind::Internal => ErrorClass::Fatal,
        },
        _ => ErrorClass::Fatal,
    }
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 0-indexed attempt number.
    pub attempt: u32,
    pub error: String,
    pub class: ErrorClass,
    /// Delay slept before the next attempt; 0 if none followed.
    pub delay_ms: u64,
    pub at: DateTime<Utc>,
}

/// Diagnostics for one execution attempt chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// Number of attempts made so far.
    pub attempt: u32,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub history: Vec<RetryAttempt>,
}

impl RetryMetadata {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_retries: policy.max_retries,
            initial_delay_ms: policy.initial_delay_ms,
            max_delay_ms: policy.max_delay_ms,
            history: Vec::new(),
        }
    }

    /// Delays slept between attempts, in order.
    pub fn delays(&self) -> Vec<u64> {
        self.history
            .iter()
            .filter(|a| a.delay_ms > 0)
            .map(|a| a.delay_ms)
            .collect()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.history.last().map(|a| a.error.as_str())
    }
}

/// Result of a retried unit together with its attempt history.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub metadata: RetryMetadata,
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Runs units of work under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryEngine {
    policy: RetryPolicy,
    deadline: Option<Duration>,
    classifier: fn(&Error) -> ErrorClass,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            deadline: None,
            classifier: classify,
        }
    }

    /// Bound each attempt; an elapsed deadline fails the attempt with
    /// [`Error::Timeout`].
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Replace the classification policy.
    pub fn with_classifier(mut self, classifier: fn(&Error) -> ErrorClass) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `operation` with retries.
    ///
    /// `operation` receives the 0-indexed attempt number and a token scoped
    /// to that attempt. Cancellation is checked before every attempt and
    /// interrupts a backoff sleep. The attempt token is a child of `cancel`
    /// and is also cancelled when the attempt's deadline elapses or the
    /// attempt is dropped, so whatever the attempt started must stop on it.
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut metadata = RetryMetadata::new(&self.policy);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(Error::Cancelled),
                    metadata,
                };
            }

            metadata.attempt = attempt + 1;
            let attempt_cancel = cancel.child_token();
            let _stop_attempt = attempt_cancel.clone().drop_guard();
            let result = match self.deadline {
                Some(deadline) => {
                    match tokio::time::timeout(deadline, operation(attempt, attempt_cancel.clone())).await {
                        Ok(result) => result,
                        Err(_) => {
                            attempt_cancel.cancel();
                            debug!(attempt, ?deadline, "attempt deadline elapsed, stopping it");
                            Err(Error::Timeout(deadline))
                        }
                    }
                }
                None => operation(attempt, attempt_cancel.clone()).await,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "operation succeeded after retries");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        metadata,
                    };
                }
                Err(err) => err,
            };

            let class = (self.classifier)(&err);
            let can_retry = class == ErrorClass::Retryable && attempt < self.policy.max_retries;
            let delay = if can_retry {
                self.policy.backoff(attempt + 1)
            } else {
                Duration::ZERO
            };

            metadata.history.push(RetryAttempt {
                attempt,
                error: err.to_string(),
                class,
                delay_ms: delay.as_millis() as u64,
                at: Utc::now(),
            });

            if !can_retry {
                if class == ErrorClass::Fatal {
                    debug!(attempt, error = %err, "fatal error, not retrying");
                } else {
                    warn!(attempts = attempt + 1, error = %err, "retries exhausted");
                }
                return RetryOutcome {
                    result: Err(err),
                    metadata,
                };
            }

            warn!(
                attempt = attempt + 1,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "attempt failed with retryable error, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(Error::Cancelled),
                        metadata,
                    };
                }
                _ = sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
