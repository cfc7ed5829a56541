//! In-Memory Store
//!
//! A consistent, process-local implementation of every store trait. Each
//! call takes the relevant lock for its whole read-check-write, which gives
//! the same atomicity the shared backends get from server-side scripts.
//!
//! Faults can be injected (full outage, failing usage appends, failing
//! account swaps, latency) to exercise degraded and retry paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{
    AccountStore, CounterStore, DeadLetterStore, ReconciliationStore, ReservationStore, UsageLog,
};
use crate::account::Account;
use crate::error::StoreError;
use crate::ledger::{ReconciliationItem, Reservation};
use crate::usage::{UsageDeadLetter, UsageLogEntry, UsagePage, UsageQuery};

#[derive(Debug)]
struct CounterSlot {
    value: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Faults {
    outage: AtomicBool,
    failing_usage_appends: AtomicU32,
    failing_account_swaps: AtomicU32,
    latency_ms: AtomicU64,
}

/// In-memory quota store
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<String, Account>>,
    reservations: RwLock<HashMap<String, Reservation>>,
    counters: RwLock<HashMap<String, CounterSlot>>,
    usage: RwLock<Vec<UsageLogEntry>>,
    parked: RwLock<HashMap<String, ReconciliationItem>>,
    dead_letters: RwLock<HashMap<String, UsageDeadLetter>>,
    faults: Faults,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until cleared
    pub fn set_outage(&self, down: bool) {
        self.faults.outage.store(down, Ordering::SeqCst);
    }

    /// Fail the next `count` usage appends
    pub fn fail_next_usage_appends(&self, count: u32) {
        self.faults
            .failing_usage_appends
            .store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` account swaps; every other call still works
    pub fn fail_next_account_swaps(&self, count: u32) {
        self.faults
            .failing_account_swaps
            .store(count, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of live rate-limit counters
    pub async fn counter_count(&self) -> usize {
        self.counters.read().await.len()
    }

    /// Every usage entry in append order
    pub async fn all_usage(&self) -> Vec<UsageLogEntry> {
        self.usage.read().await.clone()
    }

    /// Number of stored reservations, any status
    pub async fn reservation_count(&self) -> usize {
        self.reservations.read().await.len()
    }

    fn injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn load_account(&self, id: &str) -> Result<Option<Account>, StoreError> {
        self.gate().await?;
        Ok(self.accounts.read().await.get(id).cloned())
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.gate().await?;
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&account.id) {
            return Err(StoreError::Conflict(account.id.clone()));
        }
        accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn swap_account(
        &self,
        account: &Account,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        self.gate().await?;
        if Self::injected(&self.faults.failing_account_swaps) {
            return Err(StoreError::Unavailable(
                "injected account swap failure".to_string(),
            ));
        }
        let mut accounts = self.accounts.write().await;
        match accounts.get_mut(&account.id) {
            Some(stored) if stored.version == expected_version => {
                let mut next = account.clone();
                next.version = expected_version + 1;
                *stored = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn accounts_due_for_reset(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Account>, StoreError> {
        self.gate().await?;
        let accounts = self.accounts.read().await;
        let mut due: Vec<Account> = accounts
            .values()
            .filter(|a| a.reset_date <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.reset_date.cmp(&b.reset_date).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn load_reservation(&self, id: &str) -> Result<Option<Reservation>, StoreError> {
        self.gate().await?;
        Ok(self.reservations.read().await.get(id).cloned())
    }

    async fn insert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.gate().await?;
        let mut reservations = self.reservations.write().await;
        if reservations.contains_key(&reservation.id) {
            return Err(StoreError::Conflict(reservation.id.clone()));
        }
        reservations.insert(reservation.id.clone(), reservation.clone());
        Ok(())
    }

    async fn swap_reservation(
        &self,
        reservation: &Reservation,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        self.gate().await?;
        let mut reservations = self.reservations.write().await;
        match reservations.get_mut(&reservation.id) {
            Some(stored) if stored.version == expected_version => {
                let mut next = reservation.clone();
                next.version = expected_version + 1;
                *stored = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, StoreError> {
        self.gate().await?;
        let reservations = self.reservations.read().await;
        let mut expired: Vec<Reservation> = reservations
            .values()
            .filter(|r| r.status.is_pending() && r.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.gate().await?;
        let mut reservations = self.reservations.write().await;
        let before = reservations.len();
        reservations.retain(|_, r| match r.resolved_at {
            Some(resolved_at) => r.status.is_pending() || resolved_at >= cutoff,
            None => true,
        });
        Ok(before - reservations.len())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.gate().await?;
        let now = Instant::now();
        let mut counters = self.counters.write().await;
        counters.retain(|_, slot| slot.expires_at > now);
        let slot = counters.entry(key.to_string()).or_insert(CounterSlot {
            value: 0,
            expires_at: now + ttl,
        });
        slot.value += 1;
        Ok(slot.value)
    }
}

#[async_trait]
impl UsageLog for MemoryStore {
    async fn append(&self, entries: &[UsageLogEntry]) -> Result<(), StoreError> {
        self.gate().await?;
        if Self::injected(&self.faults.failing_usage_appends) {
            return Err(StoreError::Unavailable(
                "injected usage append failure".to_string(),
            ));
        }
        self.usage.write().await.extend_from_slice(entries);
        Ok(())
    }

    async fn query(&self, query: &UsageQuery) -> Result<UsagePage, StoreError> {
        self.gate().await?;
        let usage = self.usage.read().await;
        let mut matching: Vec<UsageLogEntry> = usage
            .iter()
            .filter(|e| e.visible_to(&query.account_id) && e.timestamp >= query.since)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.timestamp);
        Ok(UsagePage::paginate(matching, query))
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn park_adjustment(&self, item: &ReconciliationItem) -> Result<(), StoreError> {
        self.gate().await?;
        self.parked
            .write()
            .await
            .insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn parked_adjustments(
        &self,
        limit: usize,
    ) -> Result<Vec<ReconciliationItem>, StoreError> {
        self.gate().await?;
        let parked = self.parked.read().await;
        let mut items: Vec<ReconciliationItem> = parked.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn claim_adjustment(&self, id: &str) -> Result<bool, StoreError> {
        self.gate().await?;
        Ok(self.parked.write().await.remove(id).is_some())
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStore {
    async fn park_dead_letter(&self, letter: &UsageDeadLetter) -> Result<(), StoreError> {
        self.gate().await?;
        self.dead_letters
            .write()
            .await
            .insert(letter.id.clone(), letter.clone());
        Ok(())
    }

    async fn parked_dead_letters(&self, limit: usize) -> Result<Vec<UsageDeadLetter>, StoreError> {
        self.gate().await?;
        let dead = self.dead_letters.read().await;
        let mut letters: Vec<UsageDeadLetter> = dead.values().cloned().collect();
        letters.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then(a.id.cmp(&b.id)));
        letters.truncate(limit);
        Ok(letters)
    }

    async fn claim_dead_letter(&self, id: &str) -> Result<bool, StoreError> {
        self.gate().await?;
        Ok(self.dead_letters.write().await.remove(id).is_some())
    }
}
