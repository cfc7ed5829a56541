//! Store Operation Timeouts
//!
//! Every call into the shared store is bounded. An elapsed bound is reported
//! as `StoreError::Timeout`, which callers see as `StoreUnavailable`.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time;

use crate::error::StoreError;
use crate::metrics;

/// Upper bound for a single store call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTimeout {
    duration: Duration,
}

impl Default for StoreTimeout {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl StoreTimeout {
    /// Create a new store timeout
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use meterguard::store::StoreTimeout;
    ///
    /// let timeout = StoreTimeout::new(Duration::from_millis(250));
    /// assert_eq!(timeout.duration(), Duration::from_millis(250));
    /// ```
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run a store call under the timeout, recording its latency as `op`
    pub async fn run<F, T>(&self, op: &'static str, future: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let result = match time::timeout(self.duration, future).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.duration)),
        };
        metrics::STORE_OP_DURATION_SECONDS
            .with_label_values(&[op])
            .observe(started.elapsed().as_secs_f64());
        if result.is_err() {
            metrics::STORE_OP_ERRORS_TOTAL.with_label_values(&[op]).inc();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_default() {
        let timeout = StoreTimeout::default();
        assert_eq!(timeout.duration(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_run_completes() {
        let timeout = StoreTimeout::from_millis(100);
        let value = timeout.run("test", async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let timeout = StoreTimeout::from_millis(10);
        let result = timeout
            .run("test", async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, StoreError>(())
            })
            .await;
        assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn test_run_passes_errors_through() {
        let timeout = StoreTimeout::default();
        let result: Result<(), _> = timeout
            .run("test", async { Err(StoreError::Unavailable("down".into())) })
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
