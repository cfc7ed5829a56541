//! Background Maintenance
//!
//! One task driving the periodic jobs of the quota core, each on its own
//! interval:
//!
//! - billing-period resets
//! - expiry of abandoned reservations
//! - reconciliation of parked ledger work and usage dead letters, read from
//!   the shared store so a dedicated maintenance process sees what serving
//!   instances parked
//! - purging of resolved reservations past retention, plus stale local
//!   rate-limit counters

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::ledger::QuotaLedger;
use crate::rate_limit::RateLimiter;
use crate::scheduler::{ResetReport, ResetScheduler};
use crate::usage::UsageRecorder;

/// Maintenance intervals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub reset_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub purge_interval_secs: u64,

    /// How long resolved reservations are kept for audit
    pub reservation_retention_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            reset_interval_secs: 60,
            sweep_interval_secs: 15,
            reconcile_interval_secs: 30,
            purge_interval_secs: 3_600,
            reservation_retention_secs: 7 * 24 * 3_600,
        }
    }
}

impl MaintenanceConfig {
    pub fn reservation_retention(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.reservation_retention_secs.min(i64::MAX as u64) as i64)
    }
}

/// What one full maintenance pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub resets: ResetReport,
    pub expired: usize,
    pub reconciled: usize,
    pub reconciliation_remaining: usize,
    pub usage_replayed: usize,
    pub purged: usize,
}

/// Drives the periodic jobs until shut down
pub struct MaintenanceRunner {
    ledger: Arc<QuotaLedger>,
    scheduler: Arc<ResetScheduler>,
    limiter: Arc<RateLimiter>,
    recorder: UsageRecorder,
    config: MaintenanceConfig,
}

impl std::fmt::Debug for MaintenanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceRunner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MaintenanceRunner {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        scheduler: Arc<ResetScheduler>,
        limiter: Arc<RateLimiter>,
        recorder: UsageRecorder,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            ledger,
            scheduler,
            limiter,
            recorder,
            config,
        }
    }

    /// Run every job once, in order
    pub async fn run_once(&self) -> MaintenanceReport {
        let resets = self.reset().await;
        let expired = self.sweep().await;
        let (reconciled, reconciliation_remaining, usage_replayed) = self.reconcile().await;
        let purged = self.purge().await;
        MaintenanceReport {
            resets,
            expired,
            reconciled,
            reconciliation_remaining,
            usage_replayed,
            purged,
        }
    }

    /// Start the background task; it stops once `shutdown` becomes true
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut reset = ticker(self.config.reset_interval_secs);
        let mut sweep = ticker(self.config.sweep_interval_secs);
        let mut reconcile = ticker(self.config.reconcile_interval_secs);
        let mut purge = ticker(self.config.purge_interval_secs);

        info!(config = ?self.config, "Maintenance loops started");
        loop {
            tokio::select! {
                _ = reset.tick() => {
                    self.reset().await;
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
                _ = reconcile.tick() => {
                    self.reconcile().await;
                }
                _ = purge.tick() => {
                    self.purge().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Maintenance loops stopped");
    }

    async fn reset(&self) -> ResetReport {
        match self.scheduler.run_once().await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Billing reset run failed");
                ResetReport::default()
            }
        }
    }

    async fn sweep(&self) -> usize {
        match self.ledger.sweep_expired().await {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "Reservation expiry sweep failed");
                0
            }
        }
    }

    async fn reconcile(&self) -> (usize, usize, usize) {
        let report = self.ledger.reconcile().await;
        if report.remaining > 0 {
            warn!(
                remaining = report.remaining,
                "Ledger work still awaiting reconciliation"
            );
        }
        let replayed = self.recorder.replay_dead_letters().await;
        (report.applied, report.remaining, replayed)
    }

    async fn purge(&self) -> usize {
        let live_local = self.limiter.prune_local();
        debug!(live_local, "Pruned local rate-limit counters");
        match self
            .ledger
            .purge_resolved(self.config.reservation_retention())
            .await
        {
            Ok(purged) => purged,
            Err(e) => {
                warn!(error = %e, "Reservation purge failed");
                0
            }
        }
    }
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, ResourceLimits, Tier};
    use crate::clock::ManualClock;
    use crate::ledger::{LedgerConfig, ReservationContext};
    use crate::rate_limit::RateLimitConfig;
    use crate::retry::RetryPolicy;
    use crate::scheduler::SchedulerConfig;
    use crate::store::{AccountStore, MemoryStore, StoreTimeout, Stores};
    use crate::usage::recorder::UsageConfig;
    use chrono::{TimeZone, Utc};

    fn runner(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> MaintenanceRunner {
        let stores = Stores::from_backend(store);
        let timeout = StoreTimeout::default();
        let recorder = UsageRecorder::spawn(
            stores.usage.clone(),
            stores.dead_letters.clone(),
            UsageConfig::default(),
            timeout,
            clock.clone(),
        );
        let ledger = Arc::new(
            QuotaLedger::new(&stores, LedgerConfig::default(), timeout, clock.clone())
                .with_usage_recorder(recorder.clone()),
        );
        let scheduler = Arc::new(ResetScheduler::new(
            stores.accounts.clone(),
            SchedulerConfig::default(),
            timeout,
            clock.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            stores.counters.clone(),
            RateLimitConfig::default(),
            timeout,
            clock.clone(),
        ));
        MaintenanceRunner::new(ledger, scheduler, limiter, recorder, MaintenanceConfig::default())
    }

    #[tokio::test]
    async fn test_run_once_resets_and_expires() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 23, 58, 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start));
        let reset = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        store
            .insert_account(
                &Account::new("a", Tier::Pro, reset)
                    .with_tokens_used(300)
                    .with_limits(ResourceLimits::unlimited()),
            )
            .await
            .unwrap();

        let runner = runner(store.clone(), clock.clone());
        runner
            .ledger
            .reserve("a", 100, ReservationContext::new("/e", "m"))
            .await
            .unwrap();

        clock.advance(ChronoDuration::minutes(10));
        let report = runner.run_once().await;
        assert_eq!(report.resets.reset, 1);
        assert_eq!(report.expired, 1);

        let account = store.load_account("a").await.unwrap().unwrap();
        assert_eq!(account.tokens_used, 0);
        assert_eq!(account.tokens_reserved, 0);
    }

    #[tokio::test]
    async fn test_run_once_applies_commit_parked_by_serving_ledger() {
        let start = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start));
        store
            .insert_account(
                &Account::new("a", Tier::Pro, start + ChronoDuration::days(20))
                    .with_limits(ResourceLimits::unlimited()),
            )
            .await
            .unwrap();

        let serving = QuotaLedger::new(
            &Stores::from_backend(store.clone()),
            LedgerConfig {
                adjustment_retry: RetryPolicy::immediate(1),
                ..LedgerConfig::default()
            },
            StoreTimeout::default(),
            clock.clone(),
        );
        let reservation = serving
            .reserve("a", 100, ReservationContext::new("/e", "m"))
            .await
            .unwrap();
        store.set_outage(true);
        assert!(serving.commit(&reservation.id, 80).await.is_err());
        store.set_outage(false);
        // Park the outbox item where the maintenance process can see it
        serving.reconciliation_queue().flush_outbox().await;

        let runner = runner(store.clone(), clock.clone());
        clock.advance(ChronoDuration::minutes(10));
        let report = runner.run_once().await;
        assert_eq!(report.expired, 0);

        let account = store.load_account("a").await.unwrap().unwrap();
        assert_eq!(account.tokens_used, 80);
        assert_eq!(account.tokens_reserved, 0);

        runner.recorder.flush().await;
        let usage = store.all_usage().await;
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].tokens_consumed, 80);
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let runner = Arc::new(runner(store, clock));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = runner.spawn(shutdown_rx);
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("maintenance loop did not stop")
            .unwrap();
    }
}
