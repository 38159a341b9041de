//! Retry policy for transient provider failures.
//!
//! Implements exponential backoff with configurable parameters, plus a generic
//! [`retry`] combinator that applies the policy to any async operation.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::config::AnalysisSettings;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_retries: u32,
    /// Sleep after the first failed attempt, in seconds.
    pub initial_backoff_secs: u64,
    /// Maximum backoff duration in seconds (cap for exponential growth).
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each retry.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(settings: &AnalysisSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff_secs: settings.initial_backoff_secs,
            max_backoff_secs: settings.max_backoff_secs,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Backoff in seconds after the given failed attempt (1-based).
    ///
    /// `initial_backoff * multiplier^(attempt - 1)`, capped at `max_backoff_secs`.
    pub fn backoff_secs(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_secs as f64) as u64
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.backoff_secs(attempt))
    }

    /// Attempts actually made; a policy configured with zero still tries once.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_secs: 2,
            max_backoff_secs: 60,
            backoff_multiplier: 2.0,
        }
    }
}

/// Why [`retry`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation failed with an error that must not be retried.
    #[error("{0}")]
    Fatal(E),
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The error returned by the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or runs out of attempts.
///
/// `op` receives the 1-based attempt number. Errors for which `is_retryable`
/// returns true are retried after the policy's backoff; no sleep follows the
/// final attempt.
pub async fn retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    mut op: F,
    is_retryable: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Fatal(e)),
            Err(e) if attempt >= attempts => {
                return Err(RetryError::Exhausted { attempts, last: e });
            }
            Err(e) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    "Attempt {}/{} failed with retryable error, retrying in {}s: {}",
                    attempt,
                    attempts,
                    backoff.as_secs(),
                    e
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
