//! Exponential backoff retry policy.
//!
//! The wait before retry `n` (1-based) is
//! `initial_backoff * multiplier^(n-1)`, capped at `max_backoff`, then
//! perturbed uniformly by up to `±jitter` of that value.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Default number of attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default wait before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Default ceiling for any single wait.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default growth factor between waits.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default jitter fraction.
pub const DEFAULT_JITTER: f64 = 0.1;

/// Retry configuration used around every networked call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub initial_backoff: Duration,
    /// Cap applied before jitter.
    pub max_backoff: Duration,
    /// Multiplier applied to the wait after each failure.
    pub multiplier: f64,
    /// Fraction of the wait used as the uniform jitter range.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Pre-jitter wait before retry number `retry` (1 = first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        if !capped.is_finite() || capped <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_millis(capped as u64)
    }

    /// Apply uniform jitter of up to `±jitter * base`. Never negative.
    pub fn jittered(&self, base: Duration) -> Duration {
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 || base.is_zero() {
            return base;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let secs = base.as_secs_f64() * (1.0 + offset);
        if secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Waits between attempts are
    /// abandoned as soon as `cancel` fires, in which case
    /// [`Error::Cancelled`] is returned instead of the last failure.
    pub async fn run<T, F, Fut, P>(
        &self,
        cancel: &CancellationToken,
        is_retryable: P,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_retryable(&err) || attempt >= max_attempts {
                return Err(err);
            }

            let wait = self.jittered(self.backoff(attempt));
            tracing::warn!(
                attempt,
                max_attempts,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Attempt failed, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            attempt += 1;
        }
    }

    /// [`RetryPolicy::run`] using [`Error::is_retryable`] as the predicate.
    pub async fn run_default<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(cancel, Error::is_retryable, op).await
    }
}
