//! Rate Limiting Module
//!
//! Per-account request-count ceilings over fixed minute and hour windows,
//! independent of token accounting.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RateLimiter                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐      ┌──────────────────────┐     │
//! │  │ Shared CounterStore  │ ───▶ │ LocalCounters        │     │
//! │  │ (normal mode)        │ down │ (degraded mode)      │     │
//! │  └──────────────────────┘      └──────────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod limiter;
pub mod local;
pub mod window;

pub use config::RateLimitConfig;
pub use limiter::{RateLimitResult, RateLimiter};
pub use local::LocalCounters;
pub use window::Window;
