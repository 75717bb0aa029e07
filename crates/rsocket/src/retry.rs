//! Bounded exponential backoff.

use crate::error::Result;

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Exponential backoff settings.
///
/// `max_attempts` counts every attempt, including the first one.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Total attempts before giving up.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl Backoff {
    /// Backoff doubling from `initial_delay` up to `max_delay`.
    #[must_use]
    pub const fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled.max(0.0))
        }
    }
}

impl Default for Backoff {
    /// Ten attempts, starting at 500ms and capped at one minute.
    fn default() -> Self {
        Self::new(10, Duration::from_millis(500), Duration::from_secs(60))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempts in `backoff` are used up. The last error is returned.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry_with_backoff<F, Fut, T>(backoff: &Backoff, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= max_attempts => {
                if attempt > 1 {
                    debug!("{} failed after {} attempts: {}", what, attempt, e);
                }
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.delay_after(attempt);
                debug!(
                    "{} attempt {}/{} failed, retrying in {:?}: {}",
                    what, attempt, max_attempts, delay, e
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
