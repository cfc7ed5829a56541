//! meterguard Library
//!
//! Hierarchical token quotas and admission control for a metered model API.
//! Callers reserve an estimated token amount before an upstream call, then
//! commit the actual consumption or release the hold.
//!
//! ```no_run
//! use meterguard::store::{MemoryStore, Stores};
//! use meterguard::AdmissionController;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), meterguard::QuotaError> {
//! let stores = Stores::from_backend(Arc::new(MemoryStore::new()));
//! let controller = AdmissionController::builder(stores).build();
//!
//! let decision = controller
//!     .reserve_tokens("acct-1", "/v1/messages", "claude-sonnet", 1_000)
//!     .await?;
//! if let Some(reservation) = decision.reservation() {
//!     controller.commit_tokens(&reservation.id, 640).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod ledger;
pub mod logging;
pub mod maintenance;
pub mod metrics;
pub mod metrics_server;
pub mod permission;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod usage;

pub use account::{Account, ResourceLimits, Tier};
pub use admission::{AdmissionController, AdmissionDecision, DenialReason};
pub use error::{QuotaError, StoreError};
pub use ledger::{Balance, CommitResult, ReleaseOutcome, Reservation, ReservationStatus};
