//! Bounded retry with exponential backoff and hard per-attempt timeouts.
//!
//! Every outbound call to the LLM backend or a tool provider goes through
//! [`execute_with_retry`] (or the breaker-gated [`execute_with_breaker`]).
//! A raw failure never propagates: callers always get a structured
//! [`RetryOutcome`] and decide how to degrade.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{debug, warn};

use crate::agent::circuit_breaker::CircuitBreaker;
use crate::config::schema::RetryConfig;
use crate::errors::{ProviderError, ToolError};

/// How a call ultimately failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The final attempt exceeded its wall-clock timeout.
    Timeout,
    /// The retry budget ran out (or the circuit refused the call).
    Exhausted,
    /// A non-retryable error short-circuited the loop.
    Exception,
}

/// Structured result of a retried operation. Never persisted.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Option<T>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub failure: Option<FailureKind>,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }

    fn success(result: T, attempts: u32, start: Instant) -> Self {
        Self {
            result: Some(result),
            attempts,
            elapsed: start.elapsed(),
            failure: None,
        }
    }

    fn failed(kind: FailureKind, attempts: u32, start: Instant) -> Self {
        Self {
            result: None,
            attempts,
            elapsed: start.elapsed(),
            failure: Some(kind),
        }
    }
}

/// Retry parameters for one class of outbound call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            attempt_timeout: Duration::from_millis(cfg.attempt_timeout_ms),
        }
    }

    /// Backoff schedule: `initial * 2^(attempt-1)` with jitter, capped at 30s.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::new()
            .with_min_delay(self.initial_delay)
            .with_max_delay(Duration::from_secs(30))
            .with_factor(2.0)
            .with_jitter()
            .with_max_times(self.max_attempts as usize)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Whether a retry could plausibly succeed for this error.
///
/// Unknown error types default to retryable.
fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(p) = err.downcast_ref::<ProviderError>() {
        return p.is_retryable();
    }
    if let Some(t) = err.downcast_ref::<ToolError>() {
        return t.is_retryable();
    }
    true
}

/// Run `operation` under the retry policy.
///
/// Failure kinds: a non-retryable error yields `Exception` immediately;
/// running out of attempts yields `Exhausted`, or `Timeout` when the final
/// attempt hit its wall-clock limit.
pub async fn execute_with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut delays = policy.backoff();
    let mut attempts = 0u32;
    let mut last_was_timeout = false;

    while attempts < policy.max_attempts {
        attempts += 1;
        match tokio::time::timeout(policy.attempt_timeout, operation()).await {
            Ok(Ok(value)) => {
                return RetryOutcome::success(value, attempts, start);
            }
            Ok(Err(e)) => {
                if !is_retryable(&e) {
                    debug!("Non-retryable failure on attempt {}: {}", attempts, e);
                    return RetryOutcome::failed(FailureKind::Exception, attempts, start);
                }
                warn!("Attempt {}/{} failed: {}", attempts, policy.max_attempts, e);
                last_was_timeout = false;
            }
            Err(_) => {
                warn!(
                    "Attempt {}/{} timed out after {:?}",
                    attempts, policy.max_attempts, policy.attempt_timeout
                );
                last_was_timeout = true;
            }
        }

        if attempts < policy.max_attempts {
            if let Some(delay) = delays.next() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    let kind = if last_was_timeout {
        FailureKind::Timeout
    } else {
        FailureKind::Exhausted
    };
    RetryOutcome::failed(kind, attempts, start)
}

/// Like [`execute_with_retry`], but consults the circuit breaker before each
/// attempt and records the result of every attempt with it.
///
/// A denial before the first attempt reports `Exhausted` with zero attempts
/// consumed and records nothing — the breaker already knows the provider is
/// down.
pub async fn execute_with_breaker<T, F, Fut>(
    breaker: &CircuitBreaker,
    provider: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut delays = policy.backoff();
    let mut attempts = 0u32;
    let mut last_was_timeout = false;

    while attempts < policy.max_attempts {
        if !breaker.allow_call(provider) {
            debug!("Circuit open for '{}', refusing call", provider);
            return RetryOutcome::failed(FailureKind::Exhausted, attempts, start);
        }

        attempts += 1;
        match tokio::time::timeout(policy.attempt_timeout, operation()).await {
            Ok(Ok(value)) => {
                breaker.record_success(provider);
                return RetryOutcome::success(value, attempts, start);
            }
            Ok(Err(e)) => {
                breaker.record_failure(provider);
                if !is_retryable(&e) {
                    debug!("Non-retryable failure on attempt {}: {}", attempts, e);
                    return RetryOutcome::failed(FailureKind::Exception, attempts, start);
                }
                warn!(
                    "'{}' attempt {}/{} failed: {}",
                    provider, attempts, policy.max_attempts, e
                );
                last_was_timeout = false;
            }
            Err(_) => {
                breaker.record_failure(provider);
                warn!(
                    "'{}' attempt {}/{} timed out after {:?}",
                    provider, attempts, policy.max_attempts, policy.attempt_timeout
                );
                last_was_timeout = true;
            }
        }

        if attempts < policy.max_attempts {
            if let Some(delay) = delays.next() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    let kind = if last_was_timeout {
        FailureKind::Timeout
    } else {
        FailureKind::Exhausted
    };
    RetryOutcome::failed(kind, attempts, start)
}
