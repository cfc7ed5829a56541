//! Fixed Rate-Limit Windows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed counting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
}

impl Window {
    /// Both windows, shortest first
    pub const ALL: [Window; 2] = [Window::Minute, Window::Hour];

    /// Window length in seconds
    pub fn length_secs(&self) -> i64 {
        match self {
            Window::Minute => 60,
            Window::Hour => 3600,
        }
    }

    /// Start of the window containing `now`, in epoch seconds
    pub fn start(&self, now: DateTime<Utc>) -> i64 {
        let len = self.length_secs();
        now.timestamp().div_euclid(len) * len
    }

    /// Seconds until the window containing `now` closes
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let end = self.start(now) + self.length_secs();
        (end - now.timestamp()).max(1) as u64
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_boundary_belongs_to_new_window() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 10, 1, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 59).unwrap();
        assert_eq!(Window::Minute.start(at), at.timestamp());
        assert_ne!(Window::Minute.start(before), Window::Minute.start(at));
    }

    #[test]
    fn test_retry_after() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 45).unwrap();
        assert_eq!(Window::Minute.retry_after_secs(at), 15);
        assert_eq!(Window::Hour.retry_after_secs(at), 3600 - 45);
    }

    proptest! {
        #[test]
        fn prop_start_is_aligned_and_contains_now(secs in 0i64..4_000_000_000) {
            let now = Utc.timestamp_opt(secs, 0).unwrap();
            for window in Window::ALL {
                let start = window.start(now);
                prop_assert_eq!(start % window.length_secs(), 0);
                prop_assert!(start <= secs);
                prop_assert!(secs < start + window.length_secs());
            }
        }
    }
}
