//! Admission Control
//!
//! Single entry point for metered requests. Each reservation walks the
//! components in a fixed order:
//!
//! ```text
//! resolve hierarchy → authorize → rate limit → ledger reserve
//!                                                   │
//!                        (caller does the metered work)
//!                                                   │
//!                                  commit (+ usage record) | release
//! ```
//!
//! Business denials (permissions, rate limits, balance, concurrency) come
//! back as [`AdmissionDecision::Denied`]; infrastructure and lookup failures
//! are errors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::account::AccountRegistry;
use crate::clock::{Clock, SystemClock};
use crate::error::QuotaError;
use crate::hierarchy::{HierarchyConfig, HierarchyResolver};
use crate::ledger::{
    Balance, CommitResult, LedgerConfig, QuotaLedger, ReleaseOutcome, Reservation,
    ReservationContext,
};
use crate::metrics;
use crate::permission::{authorize, Authorization};
use crate::rate_limit::{RateLimitConfig, RateLimiter, Window};
use crate::store::{StoreTimeout, Stores, UsageLog};
use crate::usage::recorder::UsageConfig;
use crate::usage::{UsageEvent, UsagePage, UsageQuery, UsageRecorder};

/// Why a request was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    PermissionDenied {
        message: String,
    },
    RateLimitExceeded {
        window: Window,
        retry_after_secs: Option<u64>,
    },
    InsufficientBalance {
        available: u64,
        requested: u64,
    },
    ConcurrencyLimitExceeded {
        limit: u32,
    },
}

impl DenialReason {
    /// The equivalent error, for callers that prefer `Result`
    pub fn to_error(&self) -> QuotaError {
        match self {
            DenialReason::PermissionDenied { message } => {
                QuotaError::PermissionDenied(message.clone())
            }
            DenialReason::RateLimitExceeded { window, .. } => QuotaError::RateLimitExceeded(*window),
            DenialReason::InsufficientBalance {
                available,
                requested,
            } => QuotaError::InsufficientBalance {
                available: *available,
                requested: *requested,
            },
            DenialReason::ConcurrencyLimitExceeded { limit } => {
                QuotaError::ConcurrencyLimitExceeded { limit: *limit }
            }
        }
    }

    /// Stable code, shared with the matching `QuotaError`
    pub fn code(&self) -> &'static str {
        self.to_error().code()
    }
}

/// Outcome of `reserve_tokens`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admitted(Reservation),
    Denied(DenialReason),
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted(_))
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        match self {
            AdmissionDecision::Admitted(reservation) => Some(reservation),
            AdmissionDecision::Denied(_) => None,
        }
    }

    /// Collapse a denial into its error
    pub fn into_result(self) -> Result<Reservation, QuotaError> {
        match self {
            AdmissionDecision::Admitted(reservation) => Ok(reservation),
            AdmissionDecision::Denied(reason) => Err(reason.to_error()),
        }
    }
}

/// Builder wiring the quota components over one set of stores
pub struct AdmissionBuilder {
    stores: Stores,
    clock: Arc<dyn Clock>,
    timeout: StoreTimeout,
    ledger: LedgerConfig,
    rate_limit: RateLimitConfig,
    hierarchy: HierarchyConfig,
    usage: UsageConfig,
}

impl AdmissionBuilder {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            clock: Arc::new(SystemClock),
            timeout: StoreTimeout::default(),
            ledger: LedgerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            hierarchy: HierarchyConfig::default(),
            usage: UsageConfig::default(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store_timeout(mut self, timeout: StoreTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ledger_config(mut self, config: LedgerConfig) -> Self {
        self.ledger = config;
        self
    }

    pub fn rate_limit_config(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn hierarchy_config(mut self, config: HierarchyConfig) -> Self {
        self.hierarchy = config;
        self
    }

    pub fn usage_config(mut self, config: UsageConfig) -> Self {
        self.usage = config;
        self
    }

    /// Wire every component; spawns the usage writer on the current runtime
    pub fn build(self) -> AdmissionController {
        let resolver = Arc::new(HierarchyResolver::new(
            self.stores.accounts.clone(),
            self.hierarchy,
            self.timeout,
            self.clock.clone(),
        ));
        let registry = AccountRegistry::new(
            self.stores.accounts.clone(),
            resolver.clone(),
            self.timeout,
        )
        .with_max_cas_retries(self.ledger.max_cas_retries);
        let limiter = Arc::new(RateLimiter::new(
            self.stores.counters.clone(),
            self.rate_limit,
            self.timeout,
            self.clock.clone(),
        ));
        let recorder = UsageRecorder::spawn(
            self.stores.usage.clone(),
            self.stores.dead_letters.clone(),
            self.usage,
            self.timeout,
            self.clock.clone(),
        );
        let ledger = Arc::new(
            QuotaLedger::new(&self.stores, self.ledger, self.timeout, self.clock.clone())
                .with_usage_recorder(recorder.clone()),
        );

        AdmissionController {
            resolver,
            registry,
            limiter,
            ledger,
            recorder,
            usage_log: self.stores.usage,
            timeout: self.timeout,
            clock: self.clock,
        }
    }
}

/// Orchestrates hierarchy, permissions, rate limits and the ledger
pub struct AdmissionController {
    resolver: Arc<HierarchyResolver>,
    registry: AccountRegistry,
    limiter: Arc<RateLimiter>,
    ledger: Arc<QuotaLedger>,
    recorder: UsageRecorder,
    usage_log: Arc<dyn UsageLog>,
    timeout: StoreTimeout,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("ledger", &self.ledger)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    pub fn builder(stores: Stores) -> AdmissionBuilder {
        AdmissionBuilder::new(stores)
    }

    /// Account creation and configuration updates
    pub fn accounts(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<HierarchyResolver> {
        &self.resolver
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn recorder(&self) -> &UsageRecorder {
        &self.recorder
    }

    /// Admit a metered request and hold `estimated_amount` tokens for it
    pub async fn reserve_tokens(
        &self,
        account_id: &str,
        endpoint: &str,
        model: &str,
        estimated_amount: u64,
    ) -> Result<AdmissionDecision, QuotaError> {
        self.reserve_with_context(
            account_id,
            ReservationContext::new(endpoint, model),
            estimated_amount,
        )
        .await
    }

    /// Same as [`reserve_tokens`](Self::reserve_tokens) with a full context
    /// (carries the caller's request id into the usage log)
    #[instrument(
        skip(self, context),
        fields(endpoint = %context.endpoint, model = %context.model)
    )]
    pub async fn reserve_with_context(
        &self,
        account_id: &str,
        context: ReservationContext,
        estimated_amount: u64,
    ) -> Result<AdmissionDecision, QuotaError> {
        let result = self.admit(account_id, context, estimated_amount).await;
        let outcome = match &result {
            Ok(AdmissionDecision::Admitted(_)) => "admitted",
            Ok(AdmissionDecision::Denied(reason)) => reason.code(),
            Err(err) => err.code(),
        };
        metrics::ADMISSION_DECISIONS_TOTAL
            .with_label_values(&[outcome])
            .inc();
        if let Ok(AdmissionDecision::Denied(reason)) = &result {
            info!(account_id = %account_id, reason = ?reason, "Request denied");
        }
        result
    }

    async fn admit(
        &self,
        account_id: &str,
        context: ReservationContext,
        amount: u64,
    ) -> Result<AdmissionDecision, QuotaError> {
        let resolved = self.resolver.resolve(account_id).await?;

        if let Authorization::Deny(message) =
            authorize(&resolved.effective_permissions, &context.endpoint, &context.model)
        {
            return Ok(AdmissionDecision::Denied(DenialReason::PermissionDenied {
                message,
            }));
        }

        let rate = self
            .limiter
            .check_all(account_id, &resolved.effective_limits.limits)
            .await?;
        if !rate.allowed {
            return Ok(AdmissionDecision::Denied(DenialReason::RateLimitExceeded {
                window: rate.window,
                retry_after_secs: rate.retry_after_secs,
            }));
        }

        match self.ledger.reserve(account_id, amount, context).await {
            Ok(reservation) => Ok(AdmissionDecision::Admitted(reservation)),
            Err(QuotaError::InsufficientBalance {
                available,
                requested,
            }) => Ok(AdmissionDecision::Denied(DenialReason::InsufficientBalance {
                available,
                requested,
            })),
            Err(QuotaError::ConcurrencyLimitExceeded { limit }) => Ok(AdmissionDecision::Denied(
                DenialReason::ConcurrencyLimitExceeded { limit },
            )),
            Err(err) => Err(err),
        }
    }

    /// Settle a reservation with the real consumption and record usage
    #[instrument(skip(self))]
    pub async fn commit_tokens(
        &self,
        reservation_id: &str,
        actual_amount: u64,
    ) -> Result<CommitResult, QuotaError> {
        let result = self.ledger.commit(reservation_id, actual_amount).await?;

        let reservation = &result.reservation;
        self.recorder.record(UsageEvent::for_reservation(
            reservation,
            actual_amount,
            self.clock.now(),
        ));
        debug!(
            reservation_id = %reservation_id,
            over_limit = result.over_limit,
            "Tokens committed"
        );
        Ok(result)
    }

    /// Return a reservation's hold; a no-op for resolved reservations
    #[instrument(skip(self))]
    pub async fn release_tokens(&self, reservation_id: &str) -> Result<ReleaseOutcome, QuotaError> {
        self.ledger.release(reservation_id).await
    }

    /// Current balance of an account
    pub async fn get_balance(&self, account_id: &str) -> Result<Balance, QuotaError> {
        self.ledger.balance(account_id).await
    }

    /// One page of usage visible to `account_id` since `since`
    ///
    /// A parent sees its own entries and those attributed to it by its
    /// sub-accounts.
    pub async fn get_usage(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
        cursor: Option<u64>,
        limit: usize,
    ) -> Result<UsagePage, QuotaError> {
        if limit == 0 {
            return Err(QuotaError::InvalidRequest(
                "usage page limit must be positive".to_string(),
            ));
        }
        // Unknown accounts are an error, not an empty page
        self.ledger.balance(account_id).await?;

        let query = UsageQuery::new(account_id, since)
            .with_cursor(cursor)
            .with_limit(limit);
        Ok(self
            .timeout
            .run("usage_query", self.usage_log.query(&query))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, ResourceLimits, Tier};
    use crate::clock::ManualClock;
    use crate::permission::PermissionSet;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    async fn controller(accounts: Vec<Account>) -> (AdmissionController, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let controller = AdmissionController::builder(Stores::from_backend(store.clone()))
            .clock(clock.clone())
            .build();
        for account in accounts {
            controller.accounts().create_account(account).await.unwrap();
        }
        (controller, store, clock)
    }

    fn account(id: &str) -> Account {
        Account::new(id, Tier::Pro, start() + Duration::days(20))
            .with_monthly_limit(1000)
            .with_limits(ResourceLimits::unlimited())
    }

    #[tokio::test]
    async fn test_admit_commit_records_usage() {
        let (controller, store, _clock) = controller(vec![account("a")]).await;
        let decision = controller
            .reserve_tokens("a", "/v1/messages", "claude-3-haiku", 100)
            .await
            .unwrap();
        let reservation = decision.into_result().unwrap();

        let result = controller.commit_tokens(&reservation.id, 70).await.unwrap();
        assert_eq!(result.tokens_remaining, Some(930));
        controller.recorder().flush().await;

        let usage = store.all_usage().await;
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].tokens_consumed, 70);
        assert_eq!(usage[0].request_id, reservation.id);
    }

    #[tokio::test]
    async fn test_permission_denial_is_structured() {
        let restricted = account("a").with_permissions(PermissionSet::new(["/v1/messages"], ["claude-3-haiku"]));
        let (controller, _store, _clock) = controller(vec![restricted]).await;

        let decision = controller
            .reserve_tokens("a", "/v1/messages", "claude-3-opus", 10)
            .await
            .unwrap();
        match decision {
            AdmissionDecision::Denied(reason) => assert_eq!(reason.code(), "permission_denied"),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_permissions_deny_everything() {
        let locked = account("a").with_permissions(PermissionSet::default());
        let (controller, _store, _clock) = controller(vec![locked]).await;
        let decision = controller.reserve_tokens("a", "/v1/messages", "m", 1).await.unwrap();
        assert!(!decision.is_admitted());
    }

    #[tokio::test]
    async fn test_rate_limit_denial() {
        let limited = account("a").with_limits(ResourceLimits {
            requests_per_minute: Some(1),
            ..ResourceLimits::unlimited()
        });
        let (controller, _store, clock) = controller(vec![limited]).await;

        assert!(controller.reserve_tokens("a", "/e", "m", 1).await.unwrap().is_admitted());
        let denied = controller.reserve_tokens("a", "/e", "m", 1).await.unwrap();
        assert_eq!(
            denied,
            AdmissionDecision::Denied(DenialReason::RateLimitExceeded {
                window: Window::Minute,
                retry_after_secs: Some(60),
            })
        );
        clock.advance(Duration::minutes(1));
        assert!(controller.reserve_tokens("a", "/e", "m", 1).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_balance_denial_and_lookup_errors() {
        let (controller, _store, _clock) = controller(vec![account("a")]).await;
        let denied = controller.reserve_tokens("a", "/e", "m", 1001).await.unwrap();
        assert_eq!(
            denied.into_result().unwrap_err(),
            QuotaError::InsufficientBalance {
                available: 1000,
                requested: 1001
            }
        );
        assert_eq!(
            controller.reserve_tokens("ghost", "/e", "m", 1).await.unwrap_err().code(),
            "account_not_found"
        );
        assert_eq!(
            controller.get_balance("ghost").await.unwrap_err().code(),
            "account_not_found"
        );
    }

    #[tokio::test]
    async fn test_store_outage_is_an_error_not_a_denial() {
        let (controller, store, _clock) = controller(vec![account("a")]).await;
        store.set_outage(true);
        let err = controller.reserve_tokens("a", "/e", "m", 1).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_get_usage_pages() {
        let (controller, _store, _clock) = controller(vec![account("a")]).await;
        for _ in 0..3 {
            let r = controller
                .reserve_tokens("a", "/e", "m", 10)
                .await
                .unwrap()
                .into_result()
                .unwrap();
            controller.commit_tokens(&r.id, 5).await.unwrap();
        }
        controller.recorder().flush().await;

        let first = controller
            .get_usage("a", start() - Duration::days(1), None, 2)
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        let second = controller
            .get_usage("a", start() - Duration::days(1), first.next_cursor, 2)
            .await
            .unwrap();
        assert_eq!(second.entries.len(), 1);
        assert!(second.next_cursor.is_none());

        assert_eq!(
            controller.get_usage("a", start(), None, 0).await.unwrap_err().code(),
            "invalid_request"
        );
    }

    #[tokio::test]
    async fn test_release_then_release_again() {
        let (controller, _store, _clock) = controller(vec![account("a")]).await;
        let r = controller
            .reserve_tokens("a", "/e", "m", 10)
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(controller.release_tokens(&r.id).await.unwrap(), ReleaseOutcome::Released);
        assert!(matches!(
            controller.release_tokens(&r.id).await.unwrap(),
            ReleaseOutcome::AlreadyResolved(_)
        ));
        assert_eq!(controller.get_balance("a").await.unwrap().available, 1000);
    }
}
