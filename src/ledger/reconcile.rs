//! Reconciliation Queue
//!
//! Ledger work that could not be finished while the store was unreachable is
//! parked here until [`QuotaLedger::reconcile`](super::QuotaLedger::reconcile)
//! applies it. That covers balance adjustments after a reservation was
//! resolved, and commits whose reservation record could not be written.
//!
//! Items live in the shared [`ReconciliationStore`], so whichever process
//! runs maintenance can apply them. An item that cannot be parked there
//! (usually the same outage) stays in a local outbox and is moved to the
//! store by the next reconciliation pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::error;
use uuid::Uuid;

use crate::error::StoreError;
use crate::metrics;
use crate::store::{ReconciliationStore, StoreTimeout};

/// Ledger change still owed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingAdjustment {
    /// Return a hold without consuming anything
    ReleaseHold { amount: u64 },

    /// Replace a hold of `held` with consumption of `actual`
    Settle { held: u64, actual: u64 },

    /// Consume `actual` with no hold left to replace
    Charge { actual: u64 },

    /// Commit the reservation itself with `actual` consumption
    Commit { actual: u64 },
}

/// One unapplied adjustment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationItem {
    pub id: String,
    pub reservation_id: String,

    /// Account to adjust; `None` for a parked commit, which adjusts every
    /// holder of the reservation
    pub account_id: Option<String>,

    pub adjustment: PendingAdjustment,

    /// Resolution id the parked commit writes into the reservation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_id: Option<String>,

    /// Failed application attempts so far
    pub attempt_count: u32,

    pub created_at: DateTime<Utc>,
    pub last_error: String,
}

impl ReconciliationItem {
    /// Adjustment owed to one account
    pub fn new(
        reservation_id: &str,
        account_id: &str,
        adjustment: PendingAdjustment,
        attempt_count: u32,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("rec-{}", Uuid::new_v4()),
            reservation_id: reservation_id.to_string(),
            account_id: Some(account_id.to_string()),
            adjustment,
            resolution_id: None,
            attempt_count,
            created_at: now,
            last_error,
        }
    }

    /// Commit that never reached the reservation record
    pub fn commit(
        reservation_id: &str,
        actual: u64,
        resolution_id: &str,
        attempt_count: u32,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("rec-{}", Uuid::new_v4()),
            reservation_id: reservation_id.to_string(),
            account_id: None,
            adjustment: PendingAdjustment::Commit { actual },
            resolution_id: Some(resolution_id.to_string()),
            attempt_count,
            created_at: now,
            last_error,
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self.adjustment, PendingAdjustment::Commit { .. })
    }
}

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub applied: usize,
    pub remaining: usize,
    pub dropped: usize,
}

/// Parked adjustments, shared through the store
pub struct ReconciliationQueue {
    store: Arc<dyn ReconciliationStore>,
    timeout: StoreTimeout,
    outbox: Mutex<Vec<ReconciliationItem>>,
}

impl std::fmt::Debug for ReconciliationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationQueue")
            .field("outbox", &self.outbox_len())
            .finish_non_exhaustive()
    }
}

impl ReconciliationQueue {
    pub fn new(store: Arc<dyn ReconciliationStore>, timeout: StoreTimeout) -> Self {
        Self {
            store,
            timeout,
            outbox: Mutex::new(Vec::new()),
        }
    }

    /// Park an item in the store, or in the local outbox if the store is down
    pub async fn push(&self, item: ReconciliationItem) {
        metrics::RECONCILIATION_PENDING.inc();
        if let Err(err) = self.park(&item).await {
            error!(
                item_id = %item.id,
                reservation_id = %item.reservation_id,
                adjustment = ?item.adjustment,
                error = %err,
                "Reconciliation item kept in local outbox"
            );
            self.keep_local(item);
        }
    }

    /// Move outbox items into the store; returns how many are still local
    pub async fn flush_outbox(&self) -> usize {
        let local = {
            let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *outbox)
        };
        for item in local {
            if self.park(&item).await.is_err() {
                self.keep_local(item);
            }
        }
        self.outbox_len()
    }

    /// Outbox items followed by up to `limit` shared items, oldest first
    pub async fn pending(&self, limit: usize) -> Result<Vec<ReconciliationItem>, StoreError> {
        let mut items = self.outbox_snapshot();
        let shared = self
            .timeout
            .run("parked_adjustments", self.store.parked_adjustments(limit))
            .await?;
        for item in shared {
            if !items.iter().any(|local| local.id == item.id) {
                items.push(item);
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    /// Take ownership of an item before applying it
    ///
    /// Returns `false` when another process claimed it first.
    pub async fn claim(&self, item: &ReconciliationItem) -> Result<bool, StoreError> {
        {
            let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(pos) = outbox.iter().position(|local| local.id == item.id) {
                outbox.remove(pos);
                return Ok(true);
            }
        }
        self.timeout
            .run("claim_adjustment", self.store.claim_adjustment(&item.id))
            .await
    }

    /// Items that could not be parked in the store
    pub fn outbox_snapshot(&self) -> Vec<ReconciliationItem> {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn park(&self, item: &ReconciliationItem) -> Result<(), StoreError> {
        self.timeout
            .run("park_adjustment", self.store.park_adjustment(item))
            .await
    }

    fn keep_local(&self, item: ReconciliationItem) {
        let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        outbox.retain(|local| local.id != item.id);
        outbox.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn item(reservation_id: &str) -> ReconciliationItem {
        ReconciliationItem::new(
            reservation_id,
            "acct-1",
            PendingAdjustment::Settle {
                held: 50,
                actual: 45,
            },
            3,
            "store unreachable".to_string(),
            Utc::now(),
        )
    }

    fn queue(store: Arc<MemoryStore>) -> ReconciliationQueue {
        ReconciliationQueue::new(store, StoreTimeout::default())
    }

    #[tokio::test]
    async fn test_items_are_visible_to_other_queues() {
        let store = Arc::new(MemoryStore::new());
        let serving = queue(store.clone());
        let maintenance = queue(store);

        serving.push(item("rsv-1")).await;
        serving.push(item("rsv-2")).await;
        assert_eq!(serving.outbox_len(), 0);

        let pending = maintenance.pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(maintenance.claim(&pending[0]).await.unwrap());
        assert!(!serving.claim(&pending[0]).await.unwrap());
        assert_eq!(maintenance.pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_outage_keeps_items_local_until_flushed() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store.clone());

        store.set_outage(true);
        queue.push(item("rsv-1")).await;
        assert_eq!(queue.outbox_len(), 1);
        assert_eq!(queue.flush_outbox().await, 1);

        store.set_outage(false);
        assert_eq!(queue.flush_outbox().await, 0);
        assert_eq!(queue.pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_items_are_claimed_without_store() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store.clone());
        store.set_outage(true);
        queue.push(item("rsv-1")).await;

        let local = queue.outbox_snapshot();
        assert!(queue.claim(&local[0]).await.unwrap());
        assert_eq!(queue.outbox_len(), 0);
    }

    #[test]
    fn test_item_ids_are_unique() {
        let a = item("rsv-1");
        let b = item("rsv-1");
        assert!(a.id.starts_with("rec-"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_commit_item_has_no_account() {
        let parked = ReconciliationItem::commit("rsv-1", 80, "res-1", 2, "down".into(), Utc::now());
        assert!(parked.is_commit());
        assert!(parked.account_id.is_none());
        assert_eq!(parked.resolution_id.as_deref(), Some("res-1"));
    }

    #[test]
    fn test_adjustment_serialization() {
        let json = serde_json::to_value(PendingAdjustment::ReleaseHold { amount: 5 }).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "release_hold", "amount": 5}));
    }
}
