//! Rate Limit Configuration
//!
//! Ceilings themselves come from each account's resolved limits; this
//! configuration only controls how the limiter behaves.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default extra lifetime for shared counters past their window
pub const DEFAULT_COUNTER_TTL_SLACK_SECS: u64 = 60;

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Count locally when the shared counter store is unreachable
    ///
    /// Limits are then enforced per process instead of globally. When
    /// disabled, an unreachable store fails the check with `StoreUnavailable`.
    pub local_fallback: bool,

    /// Extra lifetime given to shared counters past the end of their window
    pub counter_ttl_slack_secs: u64,

    /// Accounts exempt from request-count limits (internal service accounts)
    pub exempt_accounts: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_fallback: true,
            counter_ttl_slack_secs: DEFAULT_COUNTER_TTL_SLACK_SECS,
            exempt_accounts: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `METERGUARD_RATE_LIMIT_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("METERGUARD_RATE_LIMIT_ENABLED") {
            self.enabled = val.parse().unwrap_or(self.enabled);
        }

        if let Ok(val) = std::env::var("METERGUARD_RATE_LIMIT_LOCAL_FALLBACK") {
            self.local_fallback = val.parse().unwrap_or(self.local_fallback);
        }

        self
    }

    /// Lifetime of a shared counter for a window of `window_secs`
    pub fn counter_ttl(&self, window_secs: i64) -> Duration {
        Duration::from_secs(window_secs.max(0) as u64 + self.counter_ttl_slack_secs)
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether `account_id` skips request-count limits
    pub fn is_exempt(&self, account_id: &str) -> bool {
        self.exempt_accounts.iter().any(|id| id == account_id)
    }
}
