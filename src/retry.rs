//! Bounded retries with exponential backoff.
//!
//! [`RetryPolicy::execute`] knows nothing about what it retries. It only asks
//! the error whether another attempt is worthwhile ([`GrexError::is_retryable`])
//! and sleeps `base_delay * multiplier^(attempt - 1)` between attempts.

use crate::error::{GrexError, Result};
use crate::shutdown::ShutdownSignal;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for upstream operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Growth factor applied per further failure.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_multiplier,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(0.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        if secs.is_finite() {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts. Returns the last error on exhaustion.
    ///
    /// Backoff sleeps are cancellation points: once `shutdown` fires, no
    /// further attempt starts and the last error is returned.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        description: &str,
        shutdown: &ShutdownSignal,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error: GrexError = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "{} succeeded after retry", description);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            warn!(
                attempt,
                max_attempts,
                "Attempt {}/{} failed for {}: {}",
                attempt,
                max_attempts,
                description,
                error
            );

            if attempt >= max_attempts {
                return Err(error);
            }

            let delay = self.delay_after(attempt);
            debug!(delay_ms = delay.as_millis(), "Retrying {}", description);
            if shutdown.pause(delay).await.is_cancelled() {
                return Err(error);
            }
            attempt += 1;
        }
    }
}
