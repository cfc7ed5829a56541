//! Process-Local Window Counters
//!
//! Used only in degraded mode, when the shared counter store cannot be
//! reached. Same fixed-window logic as the shared path, but counts are only
//! visible to this process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct WindowSlot {
    window_start: i64,
    count: AtomicU64,
}

impl WindowSlot {
    fn new(window_start: i64) -> Self {
        Self {
            window_start,
            count: AtomicU64::new(0),
        }
    }
}

/// Per-process fixed-window counters
#[derive(Debug, Default)]
pub struct LocalCounters {
    slots: Mutex<HashMap<String, Arc<WindowSlot>>>,
}

impl LocalCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for `scope` in the window starting at
    /// `window_start` and return the post-increment count
    ///
    /// A scope seen in a newer window starts again from zero.
    pub fn increment(&self, scope: &str, window_start: i64) -> u64 {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots
                .entry(scope.to_string())
                .or_insert_with(|| Arc::new(WindowSlot::new(window_start)));
            if slot.window_start < window_start {
                *slot = Arc::new(WindowSlot::new(window_start));
            }
            Arc::clone(slot)
        };

        // A caller still holding the old slot counts into a window nobody reads.
        slot.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current count for `scope` in the window starting at `window_start`
    pub fn current(&self, scope: &str, window_start: i64) -> u64 {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(scope) {
            Some(slot) if slot.window_start == window_start => slot.count.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    /// Drop slots whose window started before `oldest_live_start`
    pub fn retain_since(&self, oldest_live_start: i64) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|_, slot| slot.window_start >= oldest_live_start);
        slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
