//! Billing Period Reset Scheduler
//!
//! Rolls accounts over into a new billing period once their reset date has
//! passed. The update is conditional on the reset date read, so concurrent
//! schedulers (several server instances) reset a due account exactly once.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::account::Account;
use crate::clock::Clock;
use crate::error::QuotaError;
use crate::metrics;
use crate::store::{AccountStore, StoreTimeout};

/// Length of a billing period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BillingPeriod {
    /// One calendar month; day-of-month is clamped for shorter months
    #[default]
    Monthly,

    /// A fixed number of seconds
    Fixed { seconds: u64 },
}

impl BillingPeriod {
    /// Reset date one period after `from`
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BillingPeriod::Monthly => from
                .checked_add_months(Months::new(1))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            BillingPeriod::Fixed { seconds } => {
                let seconds = (*seconds).min(i64::MAX as u64) as i64;
                from.checked_add_signed(Duration::seconds(seconds))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub billing_period: BillingPeriod,

    /// Due accounts handled per run
    pub batch_size: usize,

    /// Attempts per account when balances move under the reset
    pub max_cas_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            billing_period: BillingPeriod::Monthly,
            batch_size: 1_000,
            max_cas_retries: 16,
        }
    }
}

/// Outcome of one scheduler run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    /// Due accounts examined
    pub scanned: usize,

    /// Accounts this run rolled over
    pub reset: usize,

    /// Accounts another run rolled over first
    pub skipped: usize,
}

/// Periodic billing-period rollover
pub struct ResetScheduler {
    accounts: Arc<dyn AccountStore>,
    timeout: StoreTimeout,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for ResetScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResetScheduler {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        config: SchedulerConfig,
        timeout: StoreTimeout,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            timeout,
            clock,
            config,
        }
    }

    /// Reset every account due at the current instant
    ///
    /// Each account advances by exactly one period; an account several
    /// periods behind catches up over successive runs.
    pub async fn run_once(&self) -> Result<ResetReport, QuotaError> {
        let now = self.clock.now();
        let due = self
            .timeout
            .run(
                "accounts_due_for_reset",
                self.accounts
                    .accounts_due_for_reset(now, self.config.batch_size),
            )
            .await?;

        let mut report = ResetReport {
            scanned: due.len(),
            ..ResetReport::default()
        };
        for account in due {
            if self.reset_account(account, now).await? {
                report.reset += 1;
            } else {
                report.skipped += 1;
            }
        }

        if report.reset > 0 {
            info!(reset = report.reset, skipped = report.skipped, "Billing periods rolled over");
        }
        Ok(report)
    }

    /// Roll one account over if its reset date is still the one read
    async fn reset_account(&self, mut account: Account, now: DateTime<Utc>) -> Result<bool, QuotaError> {
        let observed_reset = account.reset_date;
        for _ in 0..self.config.max_cas_retries.max(1) {
            if account.reset_date != observed_reset || account.reset_date > now {
                debug!(account_id = %account.id, "Account already rolled over");
                return Ok(false);
            }

            let mut next = account.clone();
            next.roll_over(self.config.billing_period.advance(observed_reset));

            let swapped = self
                .timeout
                .run(
                    "swap_account",
                    self.accounts.swap_account(&next, account.version),
                )
                .await?;
            if swapped {
                metrics::ACCOUNTS_RESET_TOTAL.inc();
                info!(
                    account_id = %account.id,
                    tokens_used = account.tokens_used,
                    next_reset = %next.reset_date,
                    "Account billing period reset"
                );
                return Ok(true);
            }

            metrics::CAS_CONFLICTS_TOTAL
                .with_label_values(&["account"])
                .inc();
            let id = account.id.clone();
            account = self
                .timeout
                .run("load_account", self.accounts.load_account(&id))
                .await?
                .ok_or_else(|| QuotaError::AccountNotFound(id.clone()))?;
        }

        Err(QuotaError::StoreUnavailable(format!(
            "account '{}' too contended to reset",
            account.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Tier;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn scheduler(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> ResetScheduler {
        ResetScheduler::new(store, SchedulerConfig::default(), StoreTimeout::default(), clock)
    }

    #[test]
    fn test_monthly_advance() {
        let period = BillingPeriod::Monthly;
        assert_eq!(period.advance(at(2026, 1, 15)), at(2026, 2, 15));
        assert_eq!(period.advance(at(2026, 12, 1)), at(2027, 1, 1));
        // Clamped to the last day of a shorter month
        assert_eq!(period.advance(at(2026, 1, 31)), at(2026, 2, 28));
    }

    #[test]
    fn test_fixed_advance() {
        let period = BillingPeriod::Fixed { seconds: 86_400 };
        assert_eq!(period.advance(at(2026, 1, 1)), at(2026, 1, 2));
    }

    #[test]
    fn test_billing_period_serde() {
        let json = serde_json::to_value(BillingPeriod::Fixed { seconds: 60 }).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "fixed", "seconds": 60}));
        let monthly: BillingPeriod = serde_json::from_str(r#"{"kind":"monthly"}"#).unwrap();
        assert_eq!(monthly, BillingPeriod::Monthly);
    }

    #[tokio::test]
    async fn test_resets_only_due_accounts() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(at(2026, 2, 1)));
        store
            .insert_account(&Account::new("due", Tier::Pro, at(2026, 2, 1)).with_tokens_used(500))
            .await
            .unwrap();
        store
            .insert_account(&Account::new("later", Tier::Pro, at(2026, 2, 2)).with_tokens_used(500))
            .await
            .unwrap();

        let report = scheduler(store.clone(), clock).run_once().await.unwrap();
        assert_eq!(report.reset, 1);

        let due = store.load_account("due").await.unwrap().unwrap();
        assert_eq!(due.tokens_used, 0);
        assert_eq!(due.reset_date, at(2026, 3, 1));
        let later = store.load_account("later").await.unwrap().unwrap();
        assert_eq!(later.tokens_used, 500);
    }

    #[tokio::test]
    async fn test_catches_up_one_period_per_run() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(at(2026, 4, 10)));
        store
            .insert_account(&Account::new("stale", Tier::Pro, at(2026, 2, 1)))
            .await
            .unwrap();
        let scheduler = scheduler(store.clone(), clock);

        scheduler.run_once().await.unwrap();
        assert_eq!(
            store.load_account("stale").await.unwrap().unwrap().reset_date,
            at(2026, 3, 1)
        );
        scheduler.run_once().await.unwrap();
        scheduler.run_once().await.unwrap();
        assert_eq!(
            store.load_account("stale").await.unwrap().unwrap().reset_date,
            at(2026, 5, 1)
        );
        assert_eq!(scheduler.run_once().await.unwrap().scanned, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_reset_once() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(at(2026, 2, 1)));
        store
            .insert_account(&Account::new("acct", Tier::Pro, at(2026, 2, 1)).with_tokens_used(900))
            .await
            .unwrap();

        let runs = (0..8).map(|_| {
            let scheduler = scheduler(store.clone(), clock.clone());
            tokio::spawn(async move { scheduler.run_once().await.unwrap() })
        });
        let reports = futures::future::join_all(runs).await;
        let total_resets: usize = reports.into_iter().map(|r| r.unwrap().reset).sum();

        assert_eq!(total_resets, 1);
        let account = store.load_account("acct").await.unwrap().unwrap();
        assert_eq!(account.reset_date, at(2026, 3, 1));
        assert_eq!(account.version, 1);
    }

    #[tokio::test]
    async fn test_reset_keeps_pending_holds() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(at(2026, 2, 1)));
        let mut account = Account::new("acct", Tier::Pro, at(2026, 2, 1)).with_tokens_used(10);
        account.tokens_reserved = 40;
        account.pending_reservations = 1;
        store.insert_account(&account).await.unwrap();

        scheduler(store.clone(), clock).run_once().await.unwrap();
        let account = store.load_account("acct").await.unwrap().unwrap();
        assert_eq!(account.tokens_used, 0);
        assert_eq!(account.tokens_reserved, 40);
    }
}
