//! Quota Ledger
//!
//! Authoritative balances and the two-phase reserve → commit | release
//! protocol. Every balance change is an optimistic read-modify-write on a
//! versioned account record; no lock is held between reserve and commit.
//!
//! A sub-account reservation holds on the parent first and then on the
//! sub-account, so the parent's `tokens_used` always includes what its
//! sub-accounts consumed.
//!
//! # Lifecycle
//!
//! ```text
//!            reserve
//!               │
//!               ▼
//!          ┌─────────┐  commit   ┌───────────┐
//!          │ pending │ ────────▶ │ committed │
//!          └─────────┘           └───────────┘
//!            │     │   release   ┌───────────┐
//!            │     └───────────▶ │ released  │
//!            │ ttl               └───────────┘
//!            ▼
//!       ┌─────────┐
//!       │ expired │
//!       └─────────┘
//! ```
//!
//! A commit the store would not take is parked with the reconciliation
//! queue. The sweep leaves its reservation pending and applies the parked
//! commit instead, so accepted consumption is charged even past the TTL.

pub mod reconcile;
pub mod reservation;

pub use reconcile::{
    PendingAdjustment, ReconcileReport, ReconciliationItem, ReconciliationQueue,
};
pub use reservation::{Reservation, ReservationContext, ReservationStatus};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::account::Account;
use crate::clock::Clock;
use crate::error::QuotaError;
use crate::metrics;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::{AccountStore, ReservationStore, StoreTimeout, Stores};
use crate::usage::{UsageEvent, UsageRecorder};

/// Ledger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Lifetime of a pending reservation
    pub reservation_ttl_secs: u64,

    /// Attempts for one optimistic read-modify-write before giving up
    pub max_cas_retries: u32,

    /// Retries for balance adjustments after a reservation is resolved
    pub adjustment_retry: RetryPolicy,

    /// Expired reservations handled per sweep
    pub sweep_batch: usize,

    /// Parked items read per reconciliation pass
    pub reconcile_batch: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 300,
            max_cas_retries: 64,
            adjustment_retry: RetryPolicy::default(),
            sweep_batch: 500,
            reconcile_batch: 500,
        }
    }
}

impl LedgerConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::seconds(self.reservation_ttl_secs.min(i64::MAX as u64) as i64)
    }
}

/// Outcome of a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    /// The reservation in its committed state
    pub reservation: Reservation,

    pub requested_amount: u64,
    pub actual_amount: u64,

    /// Whether consumption went past the monthly limit
    pub over_limit: bool,

    /// Tokens past the limit; `tokens_used` is clamped at the limit
    pub over_limit_by: u64,

    /// Account balance after the commit, `None` when the adjustment was
    /// parked for reconciliation
    pub tokens_used: Option<u64>,
    pub tokens_remaining: Option<u64>,

    /// Whether any balance adjustment is waiting in the reconciliation queue
    pub reconciliation_pending: bool,
}

/// Outcome of a release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// The hold was returned
    Released,

    /// Nothing to do; the reservation had already left `pending`
    AlreadyResolved(ReservationStatus),
}

/// Read-only balance view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: String,
    pub monthly_limit: u64,
    pub tokens_used: u64,
    pub tokens_reserved: u64,
    pub tokens_remaining: u64,
    pub available: u64,
    pub reset_date: DateTime<Utc>,
}

impl From<&Account> for Balance {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id.clone(),
            monthly_limit: account.monthly_limit,
            tokens_used: account.tokens_used,
            tokens_reserved: account.tokens_reserved,
            tokens_remaining: account.tokens_remaining(),
            available: account.available(),
            reset_date: account.reset_date,
        }
    }
}

/// How a commit attempt left the reservation record
enum CommitMark {
    /// Now committed under our resolution id
    Marked(Reservation),

    /// TTL had elapsed; expired instead
    Expired,

    /// Someone else resolved it first
    Resolved(Reservation),
}

/// Fate of one parked item in a reconciliation pass
enum ParkedOutcome {
    Applied,
    Requeued,
    Dropped,
    ClaimedElsewhere,
}

/// Authoritative token ledger
pub struct QuotaLedger {
    accounts: Arc<dyn AccountStore>,
    reservations: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    timeout: StoreTimeout,
    config: LedgerConfig,
    reconciliation: ReconciliationQueue,
    usage: Option<UsageRecorder>,
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .field("reconciliation_outbox", &self.reconciliation.outbox_len())
            .finish_non_exhaustive()
    }
}

impl QuotaLedger {
    pub fn new(
        stores: &Stores,
        config: LedgerConfig,
        timeout: StoreTimeout,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts: stores.accounts.clone(),
            reservations: stores.reservations.clone(),
            clock,
            timeout,
            config,
            reconciliation: ReconciliationQueue::new(stores.reconciliation.clone(), timeout),
            usage: None,
        }
    }

    /// Record usage for commits finished by reconciliation
    ///
    /// Commits that complete in the caller's request are recorded by the
    /// caller; this covers the ones that complete later.
    pub fn with_usage_recorder(mut self, recorder: UsageRecorder) -> Self {
        self.usage = Some(recorder);
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Adjustments waiting to be applied
    pub fn reconciliation_queue(&self) -> &ReconciliationQueue {
        &self.reconciliation
    }

    /// Current balance of an account
    pub async fn balance(&self, account_id: &str) -> Result<Balance, QuotaError> {
        let account = self.load_account(account_id).await?;
        Ok(Balance::from(&account))
    }

    /// Look up a reservation in any state
    pub async fn reservation(&self, reservation_id: &str) -> Result<Option<Reservation>, QuotaError> {
        Ok(self
            .timeout
            .run(
                "load_reservation",
                self.reservations.load_reservation(reservation_id),
            )
            .await?)
    }

    /// Provisionally hold `amount` tokens against the account (and its
    /// parent, for a sub-account)
    ///
    /// Fails with `InsufficientBalance` when `amount` exceeds what is
    /// available on any holder, and with `StoreUnavailable` (never a
    /// balance error) when the store cannot be reached in time.
    pub async fn reserve(
        &self,
        account_id: &str,
        amount: u64,
        context: ReservationContext,
    ) -> Result<Reservation, QuotaError> {
        if amount == 0 {
            return Err(QuotaError::InvalidRequest(
                "reservation amount must be positive".to_string(),
            ));
        }

        let account = self.load_account(account_id).await?;
        let now = self.clock.now();
        let reservation = Reservation::new(
            account_id,
            account.parent_id.as_deref(),
            amount,
            context,
            now,
            self.config.reservation_ttl(),
        );

        let mut held: Vec<&str> = Vec::with_capacity(2);
        for holder in reservation.holders() {
            let attempt = self
                .modify_account(holder, |account| account.hold(amount))
                .await;
            if let Err(err) = attempt {
                self.undo_holds(&reservation, &held).await;
                return Err(err);
            }
            held.push(holder);
        }

        if let Err(err) = self
            .timeout
            .run(
                "insert_reservation",
                self.reservations.insert_reservation(&reservation),
            )
            .await
        {
            self.undo_holds(&reservation, &held).await;
            return Err(err.into());
        }

        metrics::TOKENS_RESERVED_TOTAL.inc_by(amount);
        debug!(
            reservation_id = %reservation.id,
            account_id = %account_id,
            amount,
            expires_at = %reservation.expires_at,
            "Reservation created"
        );
        Ok(reservation)
    }

    /// Replace a pending hold with the actual consumption
    ///
    /// Over-limit actuals succeed with `over_limit` set. A reservation past
    /// its TTL is expired on the spot and `ReservationExpired` returned; one
    /// that already left `pending` is `ReservationNotFound`.
    ///
    /// Writing the reservation is retried under the adjustment policy. If
    /// the store stays unreachable the commit is parked for reconciliation
    /// and `StoreUnavailable` returned; the parked commit is applied later
    /// (even past the TTL) unless the caller's own retry lands first.
    pub async fn commit(
        &self,
        reservation_id: &str,
        actual_amount: u64,
    ) -> Result<CommitResult, QuotaError> {
        let resolution_id = format!("cmt-{}", Uuid::new_v4());
        let marked = retry_with_backoff(
            &self.config.adjustment_retry,
            QuotaError::is_retryable,
            || self.mark_committed(reservation_id, actual_amount, &resolution_id, true),
        )
        .await;

        match marked {
            Ok(CommitMark::Marked(committed)) => Ok(self.settle_commit(&committed, actual_amount).await),
            Ok(CommitMark::Expired) => Err(QuotaError::ReservationExpired(reservation_id.to_string())),
            Ok(CommitMark::Resolved(_)) => {
                Err(QuotaError::ReservationNotFound(reservation_id.to_string()))
            }
            Err(QuotaError::StoreUnavailable(reason)) => {
                error!(
                    reservation_id = %reservation_id,
                    actual = actual_amount,
                    error = %reason,
                    "Commit could not be written, parked for reconciliation"
                );
                self.reconciliation
                    .push(ReconciliationItem::commit(
                        reservation_id,
                        actual_amount,
                        &resolution_id,
                        self.config.adjustment_retry.max_attempts,
                        reason.clone(),
                        self.clock.now(),
                    ))
                    .await;
                Err(QuotaError::StoreUnavailable(format!(
                    "{reason}; commit parked for reconciliation"
                )))
            }
            Err(err) => Err(err),
        }
    }

    /// Return a pending hold in full
    ///
    /// Idempotent: a reservation that already left `pending` is reported as
    /// `AlreadyResolved` and nothing changes.
    pub async fn release(&self, reservation_id: &str) -> Result<ReleaseOutcome, QuotaError> {
        let reservation = self
            .reservation(reservation_id)
            .await?
            .ok_or_else(|| QuotaError::ReservationNotFound(reservation_id.to_string()))?;
        if !reservation.status.is_pending() {
            return Ok(ReleaseOutcome::AlreadyResolved(reservation.status));
        }

        let now = self.clock.now();
        let released = reservation.resolved(ReservationStatus::Released, None, now);
        if !self.swap_reservation(&released, reservation.version).await? {
            let status = self
                .reservation(reservation_id)
                .await?
                .map(|r| r.status)
                .unwrap_or(ReservationStatus::Released);
            return Ok(ReleaseOutcome::AlreadyResolved(status));
        }

        self.return_holds(&released).await;
        debug!(reservation_id = %reservation_id, "Reservation released");
        Ok(ReleaseOutcome::Released)
    }

    /// Expire pending reservations whose TTL elapsed; returns how many
    pub async fn sweep_expired(&self) -> Result<usize, QuotaError> {
        let now = self.clock.now();
        let due = self
            .timeout
            .run(
                "expired_pending",
                self.reservations
                    .expired_pending(now, self.config.sweep_batch),
            )
            .await?;

        if due.is_empty() {
            return Ok(0);
        }

        let parked_commits: HashMap<String, ReconciliationItem> = self
            .reconciliation
            .pending(self.config.reconcile_batch)
            .await?
            .into_iter()
            .filter(ReconciliationItem::is_commit)
            .map(|item| (item.reservation_id.clone(), item))
            .collect();

        let mut expired = 0;
        for reservation in &due {
            // Commit accepted before the TTL, never written; finish it instead
            if let Some(item) = parked_commits.get(&reservation.id) {
                self.resolve_parked(item.clone()).await;
                continue;
            }
            if self.expire(reservation, now).await? {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "Expired abandoned reservations");
        }
        Ok(expired)
    }

    /// Drop resolved reservations older than `retention`
    pub async fn purge_resolved(&self, retention: Duration) -> Result<usize, QuotaError> {
        let cutoff = self.clock.now() - retention;
        let purged = self
            .timeout
            .run(
                "purge_resolved",
                self.reservations.purge_resolved_before(cutoff),
            )
            .await?;
        if purged > 0 {
            debug!(purged, %cutoff, "Purged resolved reservations");
        }
        Ok(purged)
    }

    /// Try once more to apply every parked item
    ///
    /// Local outbox items are moved to the store first. Items failing with a
    /// retryable error are parked again; any other failure drops the item
    /// with an error log.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.reconciliation.flush_outbox().await;

        let items = match self.reconciliation.pending(self.config.reconcile_batch).await {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "Reconciliation store unreachable");
                report.remaining = self.reconciliation.outbox_len();
                metrics::RECONCILIATION_PENDING.set(report.remaining as i64);
                return report;
            }
        };

        for item in items {
            match self.resolve_parked(item).await {
                ParkedOutcome::Applied => report.applied += 1,
                ParkedOutcome::Requeued => report.remaining += 1,
                ParkedOutcome::Dropped => report.dropped += 1,
                ParkedOutcome::ClaimedElsewhere => {}
            }
        }
        metrics::RECONCILIATION_PENDING.set(report.remaining as i64);
        report
    }

    /// Claim one parked item and apply it
    async fn resolve_parked(&self, mut item: ReconciliationItem) -> ParkedOutcome {
        match self.reconciliation.claim(&item).await {
            Ok(true) => {}
            Ok(false) => return ParkedOutcome::ClaimedElsewhere,
            Err(err) => {
                debug!(item_id = %item.id, error = %err, "Parked item could not be claimed");
                return ParkedOutcome::Requeued;
            }
        }

        match self.apply_parked(&item).await {
            Ok(()) => {
                info!(
                    reservation_id = %item.reservation_id,
                    account_id = ?item.account_id,
                    adjustment = ?item.adjustment,
                    "Reconciled parked adjustment"
                );
                ParkedOutcome::Applied
            }
            Err(err) if err.is_retryable() => {
                item.attempt_count += 1;
                item.last_error = err.to_string();
                self.reconciliation.push(item).await;
                ParkedOutcome::Requeued
            }
            Err(err) => {
                error!(
                    reservation_id = %item.reservation_id,
                    account_id = ?item.account_id,
                    adjustment = ?item.adjustment,
                    error = %err,
                    "Dropping unreconcilable adjustment"
                );
                ParkedOutcome::Dropped
            }
        }
    }

    async fn apply_parked(&self, item: &ReconciliationItem) -> Result<(), QuotaError> {
        match (item.adjustment, item.account_id.as_deref()) {
            (PendingAdjustment::Commit { actual }, _) => self.finish_parked_commit(item, actual).await,
            (adjustment, Some(account_id)) => self
                .apply_adjustment(account_id, adjustment)
                .await
                .map(|_| ()),
            (adjustment, None) => Err(QuotaError::InvalidRequest(format!(
                "parked {adjustment:?} names no account"
            ))),
        }
    }

    /// Apply a commit that was accepted but never written
    async fn finish_parked_commit(
        &self,
        item: &ReconciliationItem,
        actual: u64,
    ) -> Result<(), QuotaError> {
        let resolution_id = item.resolution_id.as_deref().unwrap_or(&item.id);
        match self
            .mark_committed(&item.reservation_id, actual, resolution_id, false)
            .await?
        {
            CommitMark::Marked(committed) => {
                self.settle_commit(&committed, actual).await;
                self.record_usage(&committed, actual);
            }
            CommitMark::Resolved(resolved) if resolved.status != ReservationStatus::Committed => {
                // Hold already returned by the release or expiry
                for holder in resolved.holders() {
                    self.adjust_with_retry(&resolved, holder, PendingAdjustment::Charge { actual })
                        .await;
                }
                metrics::TOKENS_COMMITTED_TOTAL.inc_by(actual);
                self.record_usage(&resolved, actual);
                warn!(
                    reservation_id = %resolved.id,
                    status = %resolved.status,
                    actual,
                    "Parked commit charged after the reservation was resolved"
                );
            }
            CommitMark::Resolved(_) | CommitMark::Expired => {
                info!(
                    reservation_id = %item.reservation_id,
                    "Parked commit superseded by a later commit"
                );
            }
        }
        Ok(())
    }

    fn record_usage(&self, reservation: &Reservation, actual: u64) {
        if let Some(recorder) = &self.usage {
            recorder.record(UsageEvent::for_reservation(
                reservation,
                actual,
                self.clock.now(),
            ));
        }
    }

    /// Move a pending reservation to `committed` under `resolution_id`
    ///
    /// With `enforce_ttl` a reservation past its TTL is expired instead.
    async fn mark_committed(
        &self,
        reservation_id: &str,
        actual_amount: u64,
        resolution_id: &str,
        enforce_ttl: bool,
    ) -> Result<CommitMark, QuotaError> {
        for _ in 0..self.config.max_cas_retries.max(1) {
            let current = self
                .reservation(reservation_id)
                .await?
                .ok_or_else(|| QuotaError::ReservationNotFound(reservation_id.to_string()))?;

            if !current.status.is_pending() {
                // An earlier attempt's write landed though its reply was lost
                if current.resolution_id.as_deref() == Some(resolution_id) {
                    return Ok(CommitMark::Marked(current));
                }
                return Ok(CommitMark::Resolved(current));
            }

            let now = self.clock.now();
            if enforce_ttl && current.is_expired_at(now) {
                if self.expire(&current, now).await? {
                    return Ok(CommitMark::Expired);
                }
                continue;
            }

            let committed = current
                .resolved(ReservationStatus::Committed, Some(actual_amount), now)
                .with_resolution_id(resolution_id);
            if self.swap_reservation(&committed, current.version).await? {
                return Ok(CommitMark::Marked(Reservation {
                    version: current.version + 1,
                    ..committed
                }));
            }
        }

        Err(QuotaError::StoreUnavailable(format!(
            "reservation '{reservation_id}' too contended after {} attempts",
            self.config.max_cas_retries
        )))
    }

    /// Replace each holder's hold with the actual consumption
    async fn settle_commit(&self, committed: &Reservation, actual_amount: u64) -> CommitResult {
        let adjustment = PendingAdjustment::Settle {
            held: committed.requested_amount,
            actual: actual_amount,
        };
        let mut over_limit_by = 0;
        let mut own_balance = None;
        let mut reconciliation_pending = false;
        for holder in committed.holders() {
            match self.adjust_with_retry(committed, holder, adjustment).await {
                Some((account, over)) => {
                    over_limit_by = over_limit_by.max(over);
                    if holder == committed.account_id {
                        own_balance = Some(account);
                    }
                }
                None => reconciliation_pending = true,
            }
        }

        metrics::TOKENS_COMMITTED_TOTAL.inc_by(actual_amount);
        if over_limit_by > 0 {
            metrics::OVER_LIMIT_COMMITS_TOTAL.inc();
            warn!(
                reservation_id = %committed.id,
                account_id = %committed.account_id,
                requested = committed.requested_amount,
                actual = actual_amount,
                over_limit_by,
                "Commit exceeded monthly limit"
            );
        }
        debug!(
            reservation_id = %committed.id,
            account_id = %committed.account_id,
            actual = actual_amount,
            "Reservation committed"
        );

        CommitResult {
            requested_amount: committed.requested_amount,
            actual_amount,
            over_limit: over_limit_by > 0,
            over_limit_by,
            tokens_used: own_balance.as_ref().map(|a| a.tokens_used),
            tokens_remaining: own_balance.as_ref().map(Account::tokens_remaining),
            reconciliation_pending,
            reservation: committed.clone(),
        }
    }

    async fn load_account(&self, account_id: &str) -> Result<Account, QuotaError> {
        self.timeout
            .run("load_account", self.accounts.load_account(account_id))
            .await?
            .ok_or_else(|| QuotaError::AccountNotFound(account_id.to_string()))
    }

    async fn swap_reservation(
        &self,
        reservation: &Reservation,
        expected_version: u64,
    ) -> Result<bool, QuotaError> {
        let swapped = self
            .timeout
            .run(
                "swap_reservation",
                self.reservations.swap_reservation(reservation, expected_version),
            )
            .await?;
        if !swapped {
            metrics::CAS_CONFLICTS_TOTAL
                .with_label_values(&["reservation"])
                .inc();
        }
        Ok(swapped)
    }

    /// Optimistic read-modify-write of one account record
    async fn modify_account<F, T>(&self, account_id: &str, mut apply: F) -> Result<(Account, T), QuotaError>
    where
        F: FnMut(&mut Account) -> Result<T, QuotaError>,
    {
        for _ in 0..self.config.max_cas_retries.max(1) {
            let current = self.load_account(account_id).await?;
            let mut next = current.clone();
            let out = apply(&mut next)?;

            let swapped = self
                .timeout
                .run(
                    "swap_account",
                    self.accounts.swap_account(&next, current.version),
                )
                .await?;
            if swapped {
                next.version = current.version + 1;
                return Ok((next, out));
            }
            metrics::CAS_CONFLICTS_TOTAL
                .with_label_values(&["account"])
                .inc();
            tokio::task::yield_now().await;
        }

        Err(QuotaError::StoreUnavailable(format!(
            "account '{account_id}' too contended after {} attempts",
            self.config.max_cas_retries
        )))
    }

    async fn apply_adjustment(
        &self,
        account_id: &str,
        adjustment: PendingAdjustment,
    ) -> Result<(Account, u64), QuotaError> {
        self.modify_account(account_id, |account| match adjustment {
            PendingAdjustment::ReleaseHold { amount } => {
                account.release_hold(amount);
                Ok(0)
            }
            PendingAdjustment::Settle { held, actual } => Ok(account.settle(held, actual)),
            PendingAdjustment::Charge { actual } => Ok(account.charge(actual)),
            PendingAdjustment::Commit { .. } => Err(QuotaError::InvalidRequest(
                "a parked commit is not an account adjustment".to_string(),
            )),
        })
        .await
    }

    /// Apply an adjustment under the retry policy, parking it on failure
    async fn adjust_with_retry(
        &self,
        reservation: &Reservation,
        account_id: &str,
        adjustment: PendingAdjustment,
    ) -> Option<(Account, u64)> {
        let result = retry_with_backoff(
            &self.config.adjustment_retry,
            QuotaError::is_retryable,
            || self.apply_adjustment(account_id, adjustment),
        )
        .await;

        match result {
            Ok(applied) => Some(applied),
            Err(err) => {
                error!(
                    reservation_id = %reservation.id,
                    account_id = %account_id,
                    adjustment = ?adjustment,
                    error = %err,
                    "Balance adjustment failed, parked for reconciliation"
                );
                self.reconciliation
                    .push(ReconciliationItem::new(
                        &reservation.id,
                        account_id,
                        adjustment,
                        self.config.adjustment_retry.max_attempts,
                        err.to_string(),
                        self.clock.now(),
                    ))
                    .await;
                None
            }
        }
    }

    async fn return_holds(&self, reservation: &Reservation) {
        let adjustment = PendingAdjustment::ReleaseHold {
            amount: reservation.requested_amount,
        };
        for holder in reservation.holders() {
            self.adjust_with_retry(reservation, holder, adjustment)
                .await;
        }
    }

    /// Compensate holds taken by a reservation that was never stored
    async fn undo_holds(&self, reservation: &Reservation, held: &[&str]) {
        let adjustment = PendingAdjustment::ReleaseHold {
            amount: reservation.requested_amount,
        };
        for holder in held {
            self.adjust_with_retry(reservation, holder, adjustment)
                .await;
        }
    }

    /// Move a pending reservation to `expired` and return its holds
    ///
    /// Returns `false` when someone else resolved it first.
    async fn expire(&self, reservation: &Reservation, now: DateTime<Utc>) -> Result<bool, QuotaError> {
        let expired = reservation.resolved(ReservationStatus::Expired, None, now);
        if !self.swap_reservation(&expired, reservation.version).await? {
            return Ok(false);
        }
        self.return_holds(&expired).await;
        metrics::RESERVATIONS_EXPIRED_TOTAL.inc();
        debug!(
            reservation_id = %reservation.id,
            account_id = %reservation.account_id,
            amount = reservation.requested_amount,
            "Reservation expired"
        );
        Ok(true)
    }
}
