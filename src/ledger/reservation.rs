//! Reservation Records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reservation lifecycle state; leaves `Pending` exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ReservationStatus::Pending)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// What the reservation is for; carried through to the usage log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationContext {
    pub endpoint: String,
    pub model: String,

    /// Caller's request id; the reservation id is used when absent
    pub request_id: Option<String>,
}

impl ReservationContext {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Provisional, time-bounded hold against an account balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub account_id: String,

    /// Parent also holding `requested_amount` for a sub-account reservation
    pub parent_id: Option<String>,

    pub requested_amount: u64,
    pub committed_amount: Option<u64>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub context: ReservationContext,

    /// Set by the call that resolved the reservation, so a retried commit
    /// recognises its own earlier write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_id: Option<String>,

    pub version: u64,
}

impl Reservation {
    pub(crate) fn new(
        account_id: &str,
        parent_id: Option<&str>,
        requested_amount: u64,
        context: ReservationContext,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: format!("rsv-{}", Uuid::new_v4()),
            account_id: account_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            requested_amount,
            committed_amount: None,
            status: ReservationStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
            resolved_at: None,
            context,
            resolution_id: None,
            version: 0,
        }
    }

    /// Whether the TTL elapsed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Accounts holding this reservation's amount, parent first
    pub fn holders(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(2);
        if let Some(parent) = self.parent_id.as_deref() {
            out.push(parent);
        }
        out.push(self.account_id.as_str());
        out
    }

    /// Request id for usage attribution
    pub fn request_id(&self) -> &str {
        self.context.request_id.as_deref().unwrap_or(&self.id)
    }

    /// Copy of this record moved to a terminal state
    pub(crate) fn resolved(
        &self,
        status: ReservationStatus,
        committed_amount: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            committed_amount,
            resolved_at: Some(now),
            ..self.clone()
        }
    }

    pub(crate) fn with_resolution_id(mut self, resolution_id: &str) -> Self {
        self.resolution_id = Some(resolution_id.to_string());
        self
    }
}
