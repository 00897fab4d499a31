//! Bounded exponential backoff around broker publishes.
//!
//! The outbox harvester wraps every publish in [`retry_with_backoff`] so a
//! broker hiccup is absorbed inside the tick. Only when the policy is
//! exhausted does the batch fall back to waiting out its lease.
//!
//! # Example
//!
//! ```rust
//! use courier_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::default()
//!     .with_max_retries(5)
//!     .with_initial_delay(Duration::from_millis(50))
//!     .with_max_delay(Duration::from_secs(2));
//!
//! let offset = retry_with_backoff(&policy, || async { Ok::<_, String>(42) }).await?;
//! # assert_eq!(offset, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::future::Future;
use std::time::Duration;

/// How often, and how patiently, a failed operation is tried again.
///
/// # Default Values
///
/// - `max_retries`: 3 (four attempts in total)
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Pause before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single pause
    pub max_delay: Duration,
    /// Growth factor applied to the pause after each retry
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Set the number of retries after the first attempt.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the pause before the first retry.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the cap on any single pause.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Pause before retry number `retry` (0-based):
    /// `initial_delay * multiplier ^ retry`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let seconds = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(seconds).map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Run `operation` until it succeeds or `policy` runs out of retries.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retry = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if retry > 0 {
                    tracing::info!(retries = retry, "Operation recovered after retry");
                }
                return Ok(value);
            },
            Err(err) => err,
        };

        if retry >= policy.max_retries {
            if policy.max_retries > 0 {
                RetryMetrics::record_exhausted();
                tracing::warn!(retries = retry, error = %err, "Giving up after retries");
            }
            return Err(err);
        }

        let delay = policy.delay_for_attempt(retry);
        RetryMetrics::record_attempt();
        tracing::debug!(
            retry,
            delay_ms = delay.as_millis(),
            error = %err,
            "Operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
        retry += 1;
    }
}
