//! Error Types
//!
//! `QuotaError` is the taxonomy exposed to calling layers. Every variant maps
//! to a stable code so callers can render distinct messages ("upgrade plan"
//! versus "try again later"). `StoreError` covers failures of the shared store
//! and always surfaces to callers as `StoreUnavailable`.

use std::time::Duration;

use crate::rate_limit::Window;

/// Errors returned by the quota core
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    /// Unknown account id
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Endpoint or model not allowed for the account
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Request-count ceiling reached for a window
    #[error("Rate limit exceeded for {0} window")]
    RateLimitExceeded(Window),

    /// Not enough unreserved tokens left in the billing period
    #[error("Insufficient balance: available={available}, requested={requested}")]
    InsufficientBalance { available: u64, requested: u64 },

    /// Too many pending reservations for the account
    #[error("Concurrent reservation limit reached: {limit}")]
    ConcurrencyLimitExceeded { limit: u32 },

    /// No pending reservation with this id
    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    /// Reservation outlived its TTL before being committed
    #[error("Reservation expired: {0}")]
    ReservationExpired(String),

    /// Shared store unreachable, timed out, or too contended
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Parent chain deeper than two levels or cyclic
    #[error("Invalid account hierarchy: {0}")]
    HierarchyInvalid(String),

    /// Malformed request (zero amount, empty id)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl QuotaError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            QuotaError::AccountNotFound(_) => "account_not_found",
            QuotaError::PermissionDenied(_) => "permission_denied",
            QuotaError::RateLimitExceeded(_) => "rate_limit_exceeded",
            QuotaError::InsufficientBalance { .. } => "insufficient_balance",
            QuotaError::ConcurrencyLimitExceeded { .. } => "concurrency_limit_exceeded",
            QuotaError::ReservationNotFound(_) => "reservation_not_found",
            QuotaError::ReservationExpired(_) => "reservation_expired",
            QuotaError::StoreUnavailable(_) => "store_unavailable",
            QuotaError::HierarchyInvalid(_) => "hierarchy_invalid",
            QuotaError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, QuotaError::StoreUnavailable(_))
    }
}

impl From<StoreError> for QuotaError {
    fn from(err: StoreError) -> Self {
        QuotaError::StoreUnavailable(err.to_string())
    }
}

/// Errors raised by store backends
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend could not be reached
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// Operation did not complete within the configured bound
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Stored record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Insert collided with an existing record
    #[error("record already exists: {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(feature = "store-redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(format!("redis error: {err}"))
    }
}
