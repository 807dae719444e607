//! In-process fixed-window counter used while the shared store is unusable.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::clock::Clock;
use super::decision::{Decision, DecisionSource};
use super::quota::Quota;

/// Count and start time of one local window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub count: u64,
    pub window_started_at: u64,
    window_ms: u64,
}

impl WindowState {
    fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.window_started_at) > self.window_ms
    }
}

/// A fixed-window counter private to this process.
///
/// Keys are the same strings the shared store uses. Each read-modify-write
/// of a window runs under that key's map entry lock.
pub struct FallbackCounter {
    windows: DashMap<String, WindowState>,
    clock: Arc<dyn Clock>,
}

impl FallbackCounter {
    /// Create an empty counter.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Count one call against the key and compare it to the quota.
    pub fn increment(&self, key: &str, quota: Quota) -> Decision {
        let now = self.clock.now_millis();
        let state = {
            let mut entry = self.windows.entry(key.to_string()).or_insert(WindowState {
                count: 0,
                window_started_at: now,
                window_ms: quota.window_ms,
            });
            if entry.is_expired(now) {
                trace!(key = %key, "Local window rolled over");
                entry.count = 0;
                entry.window_started_at = now;
            }
            entry.window_ms = quota.window_ms;
            entry.count += 1;
            *entry
        };

        Decision::counted(
            state.count,
            quota.limit,
            now,
            state.window_started_at + quota.window_ms,
            DecisionSource::Fallback,
        )
    }

    /// Current window for a key, if one exists and has not expired.
    pub fn get(&self, key: &str) -> Option<WindowState> {
        let now = self.clock.now_millis();
        self.windows
            .get(key)
            .map(|entry| *entry)
            .filter(|state| !state.is_expired(now))
    }

    /// Number of windows held, including expired ones not yet purged.
    pub fn live_entries(&self) -> usize {
        self.windows.len()
    }

    /// Drop every window that has outlived its own length.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.windows.len();
        self.windows.retain(|_, state| !state.is_expired(now));
        before.saturating_sub(self.windows.len())
    }

    /// Forget a key's window.
    pub fn clear(&self, key: &str) {
        self.windows.remove(key);
    }
}
