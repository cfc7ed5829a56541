//! Shared Store Abstraction
//!
//! All shared mutable state lives behind these traits: balances,
//! reservations, rate-limit counters, the usage log, and parked repair work.
//! Implementations must make each call atomic on its own; the core never
//! holds a lock across calls.
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process consistent store, with fault injection
//! - `RedisStore` (feature `store-redis`): shared across server instances

pub mod memory;
#[cfg(feature = "store-redis")]
pub mod redis;
pub mod timeout;

pub use memory::MemoryStore;
#[cfg(feature = "store-redis")]
pub use self::redis::RedisStore;
pub use timeout::StoreTimeout;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::account::Account;
use crate::error::StoreError;
use crate::ledger::{ReconciliationItem, Reservation};
use crate::usage::{UsageDeadLetter, UsageLogEntry, UsagePage, UsageQuery};

/// Versioned account records
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn load_account(&self, id: &str) -> Result<Option<Account>, StoreError>;

    /// Insert a new account; fails with `Conflict` if the id exists
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError>;

    /// Replace the record if its stored version equals `expected_version`
    ///
    /// Returns `false` when the version moved. On success the stored version
    /// becomes `expected_version + 1`.
    async fn swap_account(
        &self,
        account: &Account,
        expected_version: u64,
    ) -> Result<bool, StoreError>;

    /// Accounts whose reset date is at or before `now`
    async fn accounts_due_for_reset(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Account>, StoreError>;
}

/// Versioned reservation records
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn load_reservation(&self, id: &str) -> Result<Option<Reservation>, StoreError>;

    async fn insert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError>;

    /// Same contract as [`AccountStore::swap_account`]
    async fn swap_reservation(
        &self,
        reservation: &Reservation,
        expected_version: u64,
    ) -> Result<bool, StoreError>;

    /// Pending reservations whose TTL elapsed at or before `now`
    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Drop resolved reservations resolved before `cutoff`
    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Atomically incrementable counters
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the post-increment value
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;
}

/// Append-only usage log
#[async_trait]
pub trait UsageLog: Send + Sync {
    /// Append all entries or none
    async fn append(&self, entries: &[UsageLogEntry]) -> Result<(), StoreError>;

    async fn query(&self, query: &UsageQuery) -> Result<UsagePage, StoreError>;
}

/// Ledger adjustments parked for reconciliation
///
/// Shared so that any process running maintenance can apply items parked by
/// the process that served the request.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Insert or replace the item with the same id
    async fn park_adjustment(&self, item: &ReconciliationItem) -> Result<(), StoreError>;

    /// Parked items, oldest first
    async fn parked_adjustments(&self, limit: usize)
        -> Result<Vec<ReconciliationItem>, StoreError>;

    /// Remove an item; `true` only for the one caller that removed it
    async fn claim_adjustment(&self, id: &str) -> Result<bool, StoreError>;
}

/// Usage writes that exhausted their retries
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert or replace the letter with the same id
    async fn park_dead_letter(&self, letter: &UsageDeadLetter) -> Result<(), StoreError>;

    /// Parked letters, oldest first
    async fn parked_dead_letters(&self, limit: usize) -> Result<Vec<UsageDeadLetter>, StoreError>;

    /// Remove a letter; `true` only for the one caller that removed it
    async fn claim_dead_letter(&self, id: &str) -> Result<bool, StoreError>;
}

/// Handles to every store concern
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountStore>,
    pub reservations: Arc<dyn ReservationStore>,
    pub counters: Arc<dyn CounterStore>,
    pub usage: Arc<dyn UsageLog>,
    pub reconciliation: Arc<dyn ReconciliationStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

impl Stores {
    /// Use a single backend for every concern
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: AccountStore
            + ReservationStore
            + CounterStore
            + UsageLog
            + ReconciliationStore
            + DeadLetterStore
            + 'static,
    {
        Self {
            accounts: backend.clone(),
            reservations: backend.clone(),
            counters: backend.clone(),
            usage: backend.clone(),
            reconciliation: backend.clone(),
            dead_letters: backend,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
