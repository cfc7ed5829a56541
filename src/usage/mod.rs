//! Usage Log
//!
//! Append-only record of committed consumption. A sub-account commit writes
//! two entries: the sub-account's own entry and a copy attributed to the
//! parent, so parent analytics reconcile with the sum of its sub-accounts.
//! The ledger, not this log, is authoritative for balances.

pub mod recorder;

pub use recorder::{UsageDeadLetter, UsageRecorder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::Reservation;

/// One committed consumption event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub id: String,
    pub account_id: String,

    /// Set on the parent-attributed copy of a sub-account entry
    pub attributed_parent_id: Option<String>,

    pub model: String,
    pub tokens_consumed: u64,
    pub endpoint: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl UsageLogEntry {
    /// Whether this entry shows up in `account_id`'s usage view
    ///
    /// An account sees its own unattributed entries plus every entry
    /// attributed to it by its sub-accounts.
    pub fn visible_to(&self, account_id: &str) -> bool {
        match self.attributed_parent_id.as_deref() {
            Some(parent) => parent == account_id,
            None => self.account_id == account_id,
        }
    }
}

/// Input for a usage write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    pub account_id: String,
    pub parent_id: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub tokens_consumed: u64,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    /// Event for `tokens_consumed` charged against `reservation`
    pub fn for_reservation(
        reservation: &Reservation,
        tokens_consumed: u64,
        fallback_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: reservation.account_id.clone(),
            parent_id: reservation.parent_id.clone(),
            model: reservation.context.model.clone(),
            endpoint: reservation.context.endpoint.clone(),
            tokens_consumed,
            request_id: reservation.request_id().to_string(),
            timestamp: reservation.resolved_at.unwrap_or(fallback_timestamp),
        }
    }

    /// Entries written for this event, in one append
    pub fn entries(&self) -> Vec<UsageLogEntry> {
        let own = UsageLogEntry {
            id: format!("use-{}", Uuid::new_v4()),
            account_id: self.account_id.clone(),
            attributed_parent_id: None,
            model: self.model.clone(),
            tokens_consumed: self.tokens_consumed,
            endpoint: self.endpoint.clone(),
            request_id: self.request_id.clone(),
            timestamp: self.timestamp,
        };
        match &self.parent_id {
            Some(parent) => {
                let attributed = UsageLogEntry {
                    id: format!("use-{}", Uuid::new_v4()),
                    attributed_parent_id: Some(parent.clone()),
                    ..own.clone()
                };
                vec![own, attributed]
            }
            None => vec![own],
        }
    }
}

/// Paginated usage query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageQuery {
    pub account_id: String,
    pub since: DateTime<Utc>,

    /// Offset returned as `next_cursor` by the previous page
    pub cursor: Option<u64>,

    pub limit: usize,
}

impl UsageQuery {
    pub fn new(account_id: impl Into<String>, since: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.into(),
            since,
            cursor: None,
            limit: 100,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_cursor(mut self, cursor: Option<u64>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// One page of usage entries, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePage {
    pub entries: Vec<UsageLogEntry>,
    pub next_cursor: Option<u64>,
}

impl UsagePage {
    /// Slice an already filtered, time-ordered list into a page
    pub fn paginate(mut matching: Vec<UsageLogEntry>, query: &UsageQuery) -> Self {
        let offset = query.cursor.unwrap_or(0) as usize;
        if offset >= matching.len() {
            return Self::default();
        }
        let end = offset.saturating_add(query.limit).min(matching.len());
        let next_cursor = (end < matching.len()).then_some(end as u64);
        let entries = matching.drain(offset..end).collect();
        Self {
            entries,
            next_cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(parent: Option<&str>) -> UsageEvent {
        UsageEvent {
            account_id: "sub-1".into(),
            parent_id: parent.map(str::to_string),
            model: "claude-3-haiku".into(),
            endpoint: "/v1/messages".into(),
            tokens_consumed: 42,
            request_id: "req-1".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_top_level_event_writes_one_entry() {
        let entries = event(None).entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].visible_to("sub-1"));
    }

    #[test]
    fn test_sub_account_event_is_dual_attributed() {
        let entries = event(Some("parent-1")).entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].visible_to("sub-1"));
        assert!(!entries[0].visible_to("parent-1"));
        assert!(entries[1].visible_to("parent-1"));
        assert!(!entries[1].visible_to("sub-1"));
        assert_eq!(entries[1].account_id, "sub-1");
        assert_ne!(entries[0].id, entries[1].id);
    }

    #[test]
    fn test_paginate() {
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let all: Vec<_> = (0..5).flat_map(|_| event(None).entries()).collect();
        let query = UsageQuery::new("sub-1", since).with_limit(2);

        let first = UsagePage::paginate(all.clone(), &query);
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_cursor, Some(2));

        let last = UsagePage::paginate(all.clone(), &query.clone().with_cursor(Some(4)));
        assert_eq!(last.entries.len(), 1);
        assert_eq!(last.next_cursor, None);

        let past_end = UsagePage::paginate(all, &query.with_cursor(Some(9)));
        assert!(past_end.entries.is_empty());
    }
}
