//! Accounts and Resource Limits
//!
//! An account is either top-level or a delegated sub-account of a top-level
//! account. The balance fields (`tokens_used`, `tokens_reserved`,
//! `pending_reservations`, `reset_date`) are owned by the ledger and the reset
//! scheduler; everything else is owned by the account-management collaborator.

pub mod registry;

pub use registry::AccountRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QuotaError;
use crate::permission::PermissionSet;

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Team,
    Enterprise,
}

impl Tier {
    /// Default monthly token budget for this tier
    pub fn default_monthly_limit(&self) -> u64 {
        match self {
            Tier::Free => 100_000,
            Tier::Pro => 2_000_000,
            Tier::Team => 10_000_000,
            Tier::Enterprise => 100_000_000,
        }
    }

    /// Default resource limits for this tier
    pub fn default_limits(&self) -> ResourceLimits {
        match self {
            Tier::Free => ResourceLimits {
                requests_per_minute: Some(10),
                requests_per_hour: Some(100),
                max_concurrent_reservations: Some(2),
                max_api_keys: Some(1),
            },
            Tier::Pro => ResourceLimits {
                requests_per_minute: Some(60),
                requests_per_hour: Some(1_000),
                max_concurrent_reservations: Some(10),
                max_api_keys: Some(5),
            },
            Tier::Team => ResourceLimits {
                requests_per_minute: Some(300),
                requests_per_hour: Some(10_000),
                max_concurrent_reservations: Some(50),
                max_api_keys: Some(20),
            },
            Tier::Enterprise => ResourceLimits::unlimited(),
        }
    }
}

/// Per-account resource ceilings; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Requests per fixed minute window
    pub requests_per_minute: Option<u32>,

    /// Requests per fixed hour window
    pub requests_per_hour: Option<u32>,

    /// Pending reservations held at once
    pub max_concurrent_reservations: Option<u32>,

    /// API keys the account may own (checked by the key collaborator)
    pub max_api_keys: Option<u32>,
}

impl ResourceLimits {
    /// No ceilings at all
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Field-wise minimum of two limit sets
    pub fn tightest(&self, other: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            requests_per_minute: min_limit(self.requests_per_minute, other.requests_per_minute),
            requests_per_hour: min_limit(self.requests_per_hour, other.requests_per_hour),
            max_concurrent_reservations: min_limit(
                self.max_concurrent_reservations,
                other.max_concurrent_reservations,
            ),
            max_api_keys: min_limit(self.max_api_keys, other.max_api_keys),
        }
    }
}

fn min_limit(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Account record as kept in the shared store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub parent_id: Option<String>,
    pub tier: Tier,
    pub monthly_limit: u64,
    pub tokens_used: u64,

    /// Sum of pending reservation holds
    #[serde(default)]
    pub tokens_reserved: u64,

    /// Number of pending reservations holding against this account
    #[serde(default)]
    pub pending_reservations: u32,

    pub reset_date: DateTime<Utc>,
    pub permissions: PermissionSet,
    pub limits: ResourceLimits,

    /// Bumped by the store on every successful conditional write
    #[serde(default)]
    pub version: u64,
}

impl Account {
    /// Top-level account with tier defaults
    pub fn new(id: impl Into<String>, tier: Tier, reset_date: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            tier,
            monthly_limit: tier.default_monthly_limit(),
            tokens_used: 0,
            tokens_reserved: 0,
            pending_reservations: 0,
            reset_date,
            permissions: PermissionSet::allow_all(),
            limits: tier.default_limits(),
            version: 0,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_monthly_limit(mut self, monthly_limit: u64) -> Self {
        self.monthly_limit = monthly_limit;
        self
    }

    pub fn with_tokens_used(mut self, tokens_used: u64) -> Self {
        self.tokens_used = tokens_used;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Whether this account has no parent
    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }

    /// `monthly_limit - tokens_used`
    pub fn tokens_remaining(&self) -> u64 {
        self.monthly_limit.saturating_sub(self.tokens_used)
    }

    /// Remaining tokens not covered by pending holds
    pub fn available(&self) -> u64 {
        self.tokens_remaining().saturating_sub(self.tokens_reserved)
    }

    /// Take a provisional hold of `amount` tokens and one reservation slot
    pub(crate) fn hold(&mut self, amount: u64) -> Result<(), QuotaError> {
        let available = self.available();
        if amount > available {
            return Err(QuotaError::InsufficientBalance {
                available,
                requested: amount,
            });
        }
        if let Some(limit) = self.limits.max_concurrent_reservations {
            if self.pending_reservations >= limit {
                return Err(QuotaError::ConcurrencyLimitExceeded { limit });
            }
        }
        self.tokens_reserved += amount;
        self.pending_reservations += 1;
        Ok(())
    }

    /// Return a hold without consuming anything
    pub(crate) fn release_hold(&mut self, amount: u64) {
        self.tokens_reserved = self.tokens_reserved.saturating_sub(amount);
        self.pending_reservations = self.pending_reservations.saturating_sub(1);
    }

    /// Replace a hold of `held` with real consumption of `actual`
    ///
    /// Returns how many tokens exceeded the monthly limit. `tokens_used` is
    /// clamped at `monthly_limit`; the excess is reported, not stored.
    pub(crate) fn settle(&mut self, held: u64, actual: u64) -> u64 {
        self.release_hold(held);
        self.charge(actual)
    }

    /// Consume `actual` tokens with no hold to replace
    ///
    /// Same clamping as [`settle`](Self::settle).
    pub(crate) fn charge(&mut self, actual: u64) -> u64 {
        let attempted = self.tokens_used.saturating_add(actual);
        let over_limit_by = attempted.saturating_sub(self.monthly_limit);
        self.tokens_used = attempted.min(self.monthly_limit);
        over_limit_by
    }

    /// Start a new billing period
    pub(crate) fn roll_over(&mut self, next_reset: DateTime<Utc>) {
        self.tokens_used = 0;
        self.reset_date = next_reset;
    }
}
