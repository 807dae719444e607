//! Process-local decision statistics.

use parking_lot::Mutex;
use serde::Serialize;

use super::decision::DecisionSource;

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_decisions: u64,
    pub backend_decisions: u64,
    pub fallback_decisions: u64,
    pub fail_open_decisions: u64,
    pub denied: u64,
    pub backend_errors: u64,
}

impl StatsSnapshot {
    /// Share of decisions that denied the caller.
    pub fn deny_rate(&self) -> f64 {
        ratio(self.denied, self.total_decisions)
    }

    /// Share of decisions counted in the shared store.
    pub fn backend_availability(&self) -> f64 {
        ratio(self.backend_decisions, self.total_decisions)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Accumulating counters, only reset by an operator.
///
/// All counters sit behind one lock so a reset is never observed half done.
#[derive(Debug, Default)]
pub struct Statistics {
    inner: Mutex<StatsSnapshot>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished decision.
    pub fn record_decision(&self, source: DecisionSource, allowed: bool) {
        let mut stats = self.inner.lock();
        stats.total_decisions += 1;
        match source {
            DecisionSource::Backend => stats.backend_decisions += 1,
            DecisionSource::Fallback => stats.fallback_decisions += 1,
            DecisionSource::FailOpen => stats.fail_open_decisions += 1,
        }
        if !allowed {
            stats.denied += 1;
        }
    }

    /// Record a failed store call.
    pub fn record_backend_error(&self) {
        self.inner.lock().backend_errors += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock()
    }

    /// Zero every counter.
    pub fn reset(&self) {
        *self.inner.lock() = StatsSnapshot::default();
    }
}
