//! Shared application state

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Activity tracker for idle timeout detection
#[derive(Debug)]
pub struct ActivityTracker {
    last_touched: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last_touched: AtomicU64::new(now_secs()),
        }
    }

    pub fn touch(&self) {
        self.last_touched.store(now_secs(), Ordering::SeqCst);
    }

    /// Unix seconds of the last recorded activity
    pub fn last_touched(&self) -> u64 {
        self.last_touched.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn touched_at(secs: u64) -> Self {
        Self {
            last_touched: AtomicU64::new(secs),
        }
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}
