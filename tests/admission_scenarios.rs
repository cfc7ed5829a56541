//! End-to-end admission scenarios against the in-memory store
//!
//! Each test drives the public API the way a gateway would: reserve before
//! the upstream call, then commit or release.

use chrono::{DateTime, Duration, TimeZone, Utc};
use meterguard::account::{Account, ResourceLimits, Tier};
use meterguard::clock::ManualClock;
use meterguard::ledger::LedgerConfig;
use meterguard::rate_limit::Window;
use meterguard::retry::RetryPolicy;
use meterguard::scheduler::{ResetScheduler, SchedulerConfig};
use meterguard::store::{MemoryStore, StoreTimeout, Stores};
use meterguard::{
    AdmissionController, AdmissionDecision, DenialReason, QuotaError, ReleaseOutcome,
    ReservationStatus,
};
use std::sync::Arc;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
}

struct Harness {
    controller: AdmissionController,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self::with_ledger(LedgerConfig::default())
    }

    fn with_ledger(ledger: LedgerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let controller = AdmissionController::builder(Stores::from_backend(store.clone()))
            .clock(clock.clone())
            .ledger_config(ledger)
            .build();
        Self {
            controller,
            store,
            clock,
        }
    }

    async fn create(&self, account: Account) {
        self.controller.accounts().create_account(account).await.unwrap();
    }

    async fn reserve(&self, account_id: &str, amount: u64) -> AdmissionDecision {
        self.controller
            .reserve_tokens(account_id, "/v1/messages", "claude-3-haiku", amount)
            .await
            .unwrap()
    }

    async fn admit(&self, account_id: &str, amount: u64) -> String {
        self.reserve(account_id, amount)
            .await
            .into_result()
            .unwrap()
            .id
    }
}

fn account(id: &str, monthly_limit: u64) -> Account {
    Account::new(id, Tier::Enterprise, start() + Duration::days(21))
        .with_monthly_limit(monthly_limit)
        .with_limits(ResourceLimits::unlimited())
}

#[tokio::test]
async fn test_near_limit_reserve_and_commit() {
    let h = Harness::new();
    h.create(account("acct", 1000).with_tokens_used(950)).await;

    let denied = h.reserve("acct", 60).await;
    assert_eq!(
        denied,
        AdmissionDecision::Denied(DenialReason::InsufficientBalance {
            available: 50,
            requested: 60,
        })
    );

    let id = h.admit("acct", 50).await;
    let result = h.controller.commit_tokens(&id, 45).await.unwrap();
    assert_eq!(result.tokens_used, Some(995));
    assert_eq!(result.tokens_remaining, Some(5));
    assert!(!result.over_limit);

    let balance = h.controller.get_balance("acct").await.unwrap();
    assert_eq!(balance.tokens_remaining, 5);
    assert_eq!(balance.tokens_reserved, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_split_the_limit_exactly() {
    const N: u64 = 10;
    let h = Arc::new(Harness::new());
    h.create(account("acct", 1000)).await;

    let tasks = (0..N).map(|_| {
        let h = h.clone();
        tokio::spawn(async move { h.reserve("acct", 1000 / N).await })
    });
    let decisions = futures::future::join_all(tasks).await;
    let admitted = decisions
        .into_iter()
        .map(|d| d.unwrap())
        .filter(AdmissionDecision::is_admitted)
        .count();
    assert_eq!(admitted as u64, N);

    assert_eq!(
        h.reserve("acct", 1).await,
        AdmissionDecision::Denied(DenialReason::InsufficientBalance {
            available: 0,
            requested: 1,
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversubscribed_concurrent_reservations_never_overdraw() {
    let h = Arc::new(Harness::new());
    h.create(account("acct", 1000)).await;

    let tasks = (0..25).map(|_| {
        let h = h.clone();
        tokio::spawn(async move { h.reserve("acct", 100).await })
    });
    let admitted = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|d| d.unwrap())
        .filter(AdmissionDecision::is_admitted)
        .count();
    assert_eq!(admitted, 10);

    let balance = h.controller.get_balance("acct").await.unwrap();
    assert_eq!(balance.tokens_reserved, 1000);
    assert_eq!(balance.available, 0);
}

#[tokio::test]
async fn test_abandoned_reservation_expires_and_restores_balance() {
    let h = Harness::with_ledger(LedgerConfig {
        reservation_ttl_secs: 30,
        ..LedgerConfig::default()
    });
    h.create(account("acct", 1000).with_tokens_used(100)).await;
    let before = h.controller.get_balance("acct").await.unwrap();

    let id = h.admit("acct", 400).await;
    assert_eq!(h.controller.get_balance("acct").await.unwrap().available, 500);

    h.clock.advance(Duration::seconds(31));
    assert_eq!(h.controller.ledger().sweep_expired().await.unwrap(), 1);

    let after = h.controller.get_balance("acct").await.unwrap();
    assert_eq!(after, before);
    assert_eq!(
        h.controller.release_tokens(&id).await.unwrap(),
        ReleaseOutcome::AlreadyResolved(ReservationStatus::Expired)
    );
}

#[tokio::test]
async fn test_commit_after_ttl_is_expired() {
    let h = Harness::with_ledger(LedgerConfig {
        reservation_ttl_secs: 30,
        ..LedgerConfig::default()
    });
    h.create(account("acct", 1000)).await;

    let id = h.admit("acct", 200).await;
    h.clock.advance(Duration::seconds(30));

    let err = h.controller.commit_tokens(&id, 150).await.unwrap_err();
    assert_eq!(err, QuotaError::ReservationExpired(id.clone()));

    let balance = h.controller.get_balance("acct").await.unwrap();
    assert_eq!(balance.tokens_used, 0);
    assert_eq!(balance.available, 1000);
}

#[tokio::test]
async fn test_second_commit_and_late_release_never_double_debit() {
    let h = Harness::new();
    h.create(account("acct", 1000)).await;
    let id = h.admit("acct", 100).await;

    h.controller.commit_tokens(&id, 80).await.unwrap();
    let err = h.controller.commit_tokens(&id, 80).await.unwrap_err();
    assert_eq!(err.code(), "reservation_not_found");
    assert_eq!(
        h.controller.release_tokens(&id).await.unwrap(),
        ReleaseOutcome::AlreadyResolved(ReservationStatus::Committed)
    );

    let balance = h.controller.get_balance("acct").await.unwrap();
    assert_eq!(balance.tokens_used, 80);
    assert_eq!(balance.tokens_reserved, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_commits_settle_once() {
    let h = Arc::new(Harness::new());
    h.create(account("acct", 1000)).await;
    let id = h.admit("acct", 100).await;

    let tasks = (0..6).map(|_| {
        let h = h.clone();
        let id = id.clone();
        tokio::spawn(async move { h.controller.commit_tokens(&id, 90).await })
    });
    let succeeded = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(h.controller.get_balance("acct").await.unwrap().tokens_used, 90);
}

#[tokio::test]
async fn test_over_limit_commit_is_flagged_and_clamped() {
    let h = Harness::new();
    h.create(account("acct", 1000).with_tokens_used(950)).await;
    let id = h.admit("acct", 50).await;

    let result = h.controller.commit_tokens(&id, 80).await.unwrap();
    assert!(result.over_limit);
    assert_eq!(result.over_limit_by, 30);
    assert_eq!(result.tokens_used, Some(1000));
    assert_eq!(result.tokens_remaining, Some(0));

    h.controller.recorder().flush().await;
    let usage = h.store.all_usage().await;
    assert_eq!(usage[0].tokens_consumed, 80);
}

#[tokio::test]
async fn test_parent_usage_matches_parent_consumption() {
    let h = Harness::new();
    h.create(account("org", 10_000)).await;
    h.create(account("team-a", 5_000).with_parent("org")).await;
    h.create(account("team-b", 5_000).with_parent("org")).await;

    for (account_id, actual) in [("org", 120), ("team-a", 300), ("team-b", 45), ("team-a", 7)] {
        let id = h.admit(account_id, 500).await;
        h.controller.commit_tokens(&id, actual).await.unwrap();
    }
    h.controller.recorder().flush().await;

    let org = h.controller.get_balance("org").await.unwrap();
    assert_eq!(org.tokens_used, 472);
    assert_eq!(org.tokens_reserved, 0);
    assert_eq!(h.controller.get_balance("team-a").await.unwrap().tokens_used, 307);

    let page = h
        .controller
        .get_usage("org", start(), None, 100)
        .await
        .unwrap();
    let attributed: u64 = page.entries.iter().map(|e| e.tokens_consumed).sum();
    assert_eq!(attributed, org.tokens_used);
    assert_eq!(page.entries.len(), 4);

    let team_b = h
        .controller
        .get_usage("team-b", start(), None, 100)
        .await
        .unwrap();
    assert_eq!(team_b.entries.len(), 1);
    assert_eq!(team_b.entries[0].tokens_consumed, 45);
}

#[tokio::test]
async fn test_sub_account_bounded_by_parent_balance() {
    let h = Harness::new();
    h.create(account("org", 1_000).with_tokens_used(900)).await;
    h.create(account("team", 5_000).with_parent("org")).await;

    assert_eq!(
        h.reserve("team", 150).await,
        AdmissionDecision::Denied(DenialReason::InsufficientBalance {
            available: 100,
            requested: 150,
        })
    );
    assert!(h.reserve("team", 100).await.is_admitted());
}

#[tokio::test]
async fn test_rate_limit_five_per_minute() {
    let h = Harness::new();
    h.create(account("acct", 1_000_000).with_limits(ResourceLimits {
        requests_per_minute: Some(5),
        ..ResourceLimits::unlimited()
    }))
    .await;

    for _ in 0..5 {
        assert!(h.reserve("acct", 1).await.is_admitted());
    }
    match h.reserve("acct", 1).await {
        AdmissionDecision::Denied(DenialReason::RateLimitExceeded { window, .. }) => {
            assert_eq!(window, Window::Minute)
        }
        other => panic!("expected rate limit denial, got {other:?}"),
    }

    h.clock.advance(Duration::minutes(1));
    assert!(h.reserve("acct", 1).await.is_admitted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resets_apply_once() {
    let store = Arc::new(MemoryStore::new());
    let reset_at = start();
    let clock = Arc::new(ManualClock::new(reset_at));
    let stores = Stores::from_backend(store.clone());

    let controller = AdmissionController::builder(stores.clone())
        .clock(clock.clone())
        .build();
    controller
        .accounts()
        .create_account(
            Account::new("acct", Tier::Pro, reset_at)
                .with_monthly_limit(1000)
                .with_tokens_used(700),
        )
        .await
        .unwrap();

    let runs = (0..2).map(|_| {
        let scheduler = ResetScheduler::new(
            stores.accounts.clone(),
            SchedulerConfig::default(),
            StoreTimeout::default(),
            clock.clone(),
        );
        tokio::spawn(async move { scheduler.run_once().await.unwrap().reset })
    });
    let resets: usize = futures::future::join_all(runs)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .sum();
    assert_eq!(resets, 1);

    let balance = controller.get_balance("acct").await.unwrap();
    assert_eq!(balance.tokens_used, 0);
    assert_eq!(
        balance.reset_date,
        Utc.with_ymd_and_hms(2026, 4, 10, 9, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn test_store_outage_reports_unavailable_not_insufficient() {
    let h = Harness::new();
    h.create(account("acct", 1000)).await;
    // Warm the resolver cache so the failure comes from the ledger write
    h.controller.resolver().resolve("acct").await.unwrap();

    h.store.set_outage(true);
    let err = h
        .controller
        .reserve_tokens("acct", "/v1/messages", "m", 10)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "store_unavailable");

    h.store.set_outage(false);
    assert!(h.reserve("acct", 10).await.is_admitted());
}

#[tokio::test]
async fn test_commit_lost_to_outage_is_still_charged() {
    let h = Harness::with_ledger(LedgerConfig {
        adjustment_retry: RetryPolicy::immediate(2),
        ..LedgerConfig::default()
    });
    h.create(account("acct", 1000)).await;
    let id = h.admit("acct", 100).await;

    h.store.set_outage(true);
    let err = h.controller.commit_tokens(&id, 80).await.unwrap_err();
    assert_eq!(err.code(), "store_unavailable");
    h.store.set_outage(false);

    h.clock.advance(Duration::minutes(6));
    assert_eq!(h.controller.ledger().sweep_expired().await.unwrap(), 0);

    let balance = h.controller.get_balance("acct").await.unwrap();
    assert_eq!(balance.tokens_used, 80);
    assert_eq!(balance.tokens_reserved, 0);

    h.controller.recorder().flush().await;
    let usage = h.controller.get_usage("acct", start(), None, 10).await.unwrap();
    assert_eq!(usage.entries.len(), 1);
    assert_eq!(usage.entries[0].tokens_consumed, 80);
}

#[tokio::test]
async fn test_failed_settlement_is_reported_then_reconciled() {
    let h = Harness::with_ledger(LedgerConfig {
        adjustment_retry: RetryPolicy::immediate(2),
        ..LedgerConfig::default()
    });
    h.create(account("acct", 1000)).await;
    let id = h.admit("acct", 100).await;

    h.store.fail_next_account_swaps(2);
    let result = h.controller.commit_tokens(&id, 80).await.unwrap();
    assert!(result.reconciliation_pending);
    assert_eq!(result.tokens_used, None);

    let report = h.controller.ledger().reconcile().await;
    assert_eq!(report.applied, 1);
    let balance = h.controller.get_balance("acct").await.unwrap();
    assert_eq!(balance.tokens_used, 80);
    assert_eq!(balance.tokens_reserved, 0);
}
