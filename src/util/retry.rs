//! Timeout and retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetrySettings;
use crate::error::{AgentError, Result};

use super::timeout::with_timeout;

/// Wraps an outbound call with a per-attempt timeout and bounded retries.
///
/// Only [`crate::error::ErrorCategory::TransientNetwork`] errors are retried.
/// Backoff sleeps race the abort token so a cancelled run never waits out a
/// backoff.
#[derive(Debug, Clone)]
pub struct ResilientCallExecutor {
    /// Deadline applied to each attempt.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Scale each backoff by a factor in 75%..125%.
    pub jitter: bool,
}

impl Default for ResilientCallExecutor {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_retries: 2,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ResilientCallExecutor {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            max_retries: settings.max_retries,
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Run `operation` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// The closure receives the 1-based attempt number. A fatal error is
    /// returned unmodified whenever it arrives. Only a transient error on the
    /// last allowed attempt is wrapped in [`AgentError::RetriesExhausted`].
    pub async fn execute<F, Fut, T>(&self, abort: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_retries.saturating_add(1);
        let mut backoff = self.base_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(AgentError::Aborted),
                result = with_timeout(self.timeout, operation(attempt)) => result,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                if attempt > 1 {
                    tracing::debug!(attempt, error = %err, "fatal error after retry");
                }
                return Err(err);
            }
            if attempt >= max_attempts {
                tracing::warn!(attempts = attempt, error = %err, "retries exhausted");
                return Err(exhausted(err, attempt));
            }

            let delay = if self.jitter {
                backoff.mul_f64(jitter_factor())
            } else {
                backoff
            };
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after error"
            );

            tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(AgentError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }

            backoff = Duration::from_secs_f64(
                (backoff.as_secs_f64() * self.multiplier).min(self.max_backoff.as_secs_f64()),
            );
        }
    }
}

fn exhausted(err: AgentError, attempts: u32) -> AgentError {
    if attempts <= 1 {
        err
    } else {
        AgentError::RetriesExhausted {
            attempts,
            source: Box::new(err),
        }
    }
}

/// Backoff scale in `0.75..=1.25`, drawn from the random bits of a v4 uuid.
fn jitter_factor() -> f64 {
    let bits = uuid::Uuid::new_v4().as_u128();
    0.75 + (bits % 10_001) as f64 / 20_000.0
}
