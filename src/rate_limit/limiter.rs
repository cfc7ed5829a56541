//! Fixed-Window Rate Limiter
//!
//! Counts requests per account in aligned minute and hour windows. Counting
//! normally goes through the shared [`CounterStore`] so every server instance
//! sees the same totals. If the store cannot be reached and the
//! `local_fallback` capability is on, the limiter switches to process-local
//! counters until the store answers again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::config::RateLimitConfig;
use super::local::LocalCounters;
use super::window::Window;
use crate::account::ResourceLimits;
use crate::clock::Clock;
use crate::error::{QuotaError, StoreError};
use crate::metrics;
use crate::store::{CounterStore, StoreTimeout};

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,

    /// Window the decision was made in
    pub window: Window,

    /// Post-increment count (0 when the window was not counted)
    pub count: u64,

    /// Ceiling applied, `None` when unlimited
    pub limit: Option<u32>,

    /// Seconds until the window rolls over (if not allowed)
    pub retry_after_secs: Option<u64>,

    /// Whether the count came from process-local fallback counters
    pub degraded: bool,
}

impl RateLimitResult {
    /// Create an allowed result
    pub fn allowed(window: Window, count: u64, limit: Option<u32>) -> Self {
        Self {
            allowed: true,
            window,
            count,
            limit,
            retry_after_secs: None,
            degraded: false,
        }
    }

    /// Create a denied result
    pub fn denied(window: Window, count: u64, limit: u32, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            window,
            count,
            limit: Some(limit),
            retry_after_secs: Some(retry_after_secs),
            degraded: false,
        }
    }

    fn with_degraded(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }

    /// The error a caller reports for this result, if denied
    pub fn to_error(&self) -> Option<QuotaError> {
        (!self.allowed).then_some(QuotaError::RateLimitExceeded(self.window))
    }
}

/// Request-count limiter over fixed windows
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    local: LocalCounters,
    config: RateLimitConfig,
    timeout: StoreTimeout,
    clock: Arc<dyn Clock>,
    degraded: AtomicBool,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a new rate limiter over the shared counter store
    pub fn new(
        counters: Arc<dyn CounterStore>,
        config: RateLimitConfig,
        timeout: StoreTimeout,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            counters,
            local: LocalCounters::new(),
            config,
            timeout,
            clock,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Whether the last shared-store call failed and local counting is active
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Count one request for `account_id` in the current `window`
    ///
    /// The decision is `count <= ceiling`. A `None` ceiling is unlimited and
    /// is not counted at all.
    pub async fn check(
        &self,
        account_id: &str,
        window: Window,
        ceiling: Option<u32>,
    ) -> Result<RateLimitResult, QuotaError> {
        if !self.config.enabled || self.config.is_exempt(account_id) {
            return Ok(RateLimitResult::allowed(window, 0, None));
        }
        let Some(limit) = ceiling else {
            return Ok(RateLimitResult::allowed(window, 0, None));
        };

        let now = self.clock.now();
        let window_start = window.start(now);
        let key = format!("rl:{account_id}:{window}:{window_start}");
        let ttl = self.config.counter_ttl(window.length_secs());

        let (count, degraded) = match self
            .timeout
            .run("counter_increment", self.counters.increment(&key, ttl))
            .await
        {
            Ok(count) => {
                self.mark_healthy();
                (count, false)
            }
            Err(err) if self.config.local_fallback => {
                self.mark_degraded(&err);
                let scope = format!("{account_id}:{window}");
                (self.local.increment(&scope, window_start), true)
            }
            Err(err) => return Err(err.into()),
        };

        let result = if count <= u64::from(limit) {
            RateLimitResult::allowed(window, count, Some(limit))
        } else {
            debug!(
                account_id = %account_id,
                window = %window,
                count,
                limit,
                "Rate limit exceeded"
            );
            RateLimitResult::denied(window, count, limit, window.retry_after_secs(now))
        };
        Ok(result.with_degraded(degraded))
    }

    /// Check every window against `limits`, stopping at the first denial
    ///
    /// Returns the denial, or the result for the last window checked.
    pub async fn check_all(
        &self,
        account_id: &str,
        limits: &ResourceLimits,
    ) -> Result<RateLimitResult, QuotaError> {
        let mut last = RateLimitResult::allowed(Window::Hour, 0, None);
        for window in Window::ALL {
            let ceiling = match window {
                Window::Minute => limits.requests_per_minute,
                Window::Hour => limits.requests_per_hour,
            };
            last = self.check(account_id, window, ceiling).await?;
            if !last.allowed {
                break;
            }
        }
        Ok(last)
    }

    /// Drop local fallback counters from windows that already closed
    pub fn prune_local(&self) -> usize {
        let oldest_live = Window::Hour.start(self.clock.now());
        self.local.retain_since(oldest_live)
    }

    fn mark_degraded(&self, err: &StoreError) {
        metrics::RATE_LIMIT_DEGRADED_DECISIONS_TOTAL.inc();
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                error = %err,
                "Counter store unreachable, rate limits now enforced per process"
            );
            metrics::RATE_LIMITER_DEGRADED.set(1);
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Counter store reachable again, shared rate limiting restored");
            metrics::RATE_LIMITER_DEGRADED.set(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};

    fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 5).unwrap(),
        ));
        let limiter = RateLimiter::new(
            store.clone(),
            config,
            StoreTimeout::default(),
            clock.clone(),
        );
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_five_per_minute() {
        let (limiter, _store, clock) = limiter(RateLimitConfig::default());

        for i in 1..=5 {
            let result = limiter.check("acct-1", Window::Minute, Some(5)).await.unwrap();
            assert!(result.allowed, "request {i} should be allowed");
            assert_eq!(result.count, i);
        }

        let sixth = limiter.check("acct-1", Window::Minute, Some(5)).await.unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.retry_after_secs, Some(55));
        assert_eq!(sixth.to_error(), Some(QuotaError::RateLimitExceeded(Window::Minute)));

        clock.advance(Duration::seconds(55));
        let next_window = limiter.check("acct-1", Window::Minute, Some(5)).await.unwrap();
        assert!(next_window.allowed);
        assert_eq!(next_window.count, 1);
    }

    #[tokio::test]
    async fn test_unlimited_is_not_counted() {
        let (limiter, store, _clock) = limiter(RateLimitConfig::default());
        let result = limiter.check("acct-1", Window::Hour, None).await.unwrap();
        assert!(result.allowed);
        assert_eq!(store.counter_count().await, 0);
    }

    #[tokio::test]
    async fn test_zero_ceiling_blocks() {
        let (limiter, _store, _clock) = limiter(RateLimitConfig::default());
        let result = limiter.check("acct-1", Window::Minute, Some(0)).await.unwrap();
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn test_accounts_are_independent() {
        let (limiter, _store, _clock) = limiter(RateLimitConfig::default());
        assert!(limiter.check("a", Window::Minute, Some(1)).await.unwrap().allowed);
        assert!(!limiter.check("a", Window::Minute, Some(1)).await.unwrap().allowed);
        assert!(limiter.check("b", Window::Minute, Some(1)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_disabled_and_exempt() {
        let (limiter, _store, _clock) = limiter(RateLimitConfig::disabled());
        assert!(limiter.check("a", Window::Minute, Some(0)).await.unwrap().allowed);

        let config = RateLimitConfig {
            exempt_accounts: vec!["svc".to_string()],
            ..RateLimitConfig::default()
        };
        let (limiter, _store, _clock) = self::limiter(config);
        assert!(limiter.check("svc", Window::Minute, Some(0)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_check_all_stops_at_minute_denial() {
        let (limiter, _store, _clock) = limiter(RateLimitConfig::default());
        let limits = ResourceLimits {
            requests_per_minute: Some(1),
            requests_per_hour: Some(10),
            ..ResourceLimits::unlimited()
        };
        assert!(limiter.check_all("a", &limits).await.unwrap().allowed);
        let denied = limiter.check_all("a", &limits).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.window, Window::Minute);
    }

    #[tokio::test]
    async fn test_fallback_when_store_down() {
        let (limiter, store, _clock) = limiter(RateLimitConfig::default());
        store.set_outage(true);

        let first = limiter.check("a", Window::Minute, Some(1)).await.unwrap();
        assert!(first.allowed);
        assert!(first.degraded);
        assert!(limiter.is_degraded());

        let second = limiter.check("a", Window::Minute, Some(1)).await.unwrap();
        assert!(!second.allowed);

        store.set_outage(false);
        let recovered = limiter.check("a", Window::Minute, Some(5)).await.unwrap();
        assert!(!recovered.degraded);
        assert!(!limiter.is_degraded());
    }

    #[tokio::test]
    async fn test_no_fallback_reports_store_unavailable() {
        let config = RateLimitConfig {
            local_fallback: false,
            ..RateLimitConfig::default()
        };
        let (limiter, store, _clock) = limiter(config);
        store.set_outage(true);
        let err = limiter.check("a", Window::Minute, Some(1)).await.unwrap_err();
        assert_eq!(err.code(), "store_unavailable");
    }

    #[tokio::test]
    async fn test_prune_local_drops_old_windows() {
        let (limiter, store, clock) = limiter(RateLimitConfig::default());
        store.set_outage(true);
        limiter.check("a", Window::Minute, Some(5)).await.unwrap();
        clock.advance(Duration::hours(2));
        assert_eq!(limiter.prune_local(), 0);
    }
}
