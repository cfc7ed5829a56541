//! Retry with Exponential Backoff
//!
//! Used for ledger adjustments after a commit and for usage-log writes, and
//! offered to callers for the bounded retry of `reserve` on
//! `StoreUnavailable`.
//!
//! # Example
//!
//! ```no_run
//! use meterguard::retry::{retry_with_backoff, RetryPolicy};
//! use meterguard::QuotaError;
//!
//! # async fn reserve() -> Result<u64, QuotaError> { Ok(1) }
//! # async fn run() -> Result<(), QuotaError> {
//! let policy = RetryPolicy::new().max_attempts(3);
//! let value = retry_with_backoff(&policy, QuotaError::is_retryable, || reserve()).await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy
///
/// * `max_attempts` - total attempts including the first (default: 3)
/// * `base_delay_ms` - delay before the first retry (default: 50ms)
/// * `max_delay_ms` - cap for any single delay (default: 2s)
/// * `jitter` - random variation factor between 0.0 and 1.0 (default: 0.2)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// No waiting between attempts (for tests)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (zero-indexed)
    ///
    /// `base * 2^attempt`, varied by up to `jitter` in either direction, then
    /// capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.max_delay_ms);

        let spread = (exponential as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        let delay = if spread > 0 {
            let mut rng = rand::rng();
            let offset = rng.random_range(0..=spread);
            if rng.random_bool(0.5) {
                exponential.saturating_add(offset)
            } else {
                exponential.saturating_sub(offset)
            }
        } else {
            exponential
        };

        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Run `operation` until it succeeds, returns a non-retryable error, or the
/// policy's attempts are used up
///
/// Returns the operation's result, or the last error.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    should_retry: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt + 1 < attempts && should_retry(&err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
