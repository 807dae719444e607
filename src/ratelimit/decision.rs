//! The outcome of an admission check.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which path produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Counted in the shared store
    Backend,
    /// Counted in process memory while the shared store was unusable
    Fallback,
    /// Nothing counted; allowed unconditionally
    FailOpen,
}

/// An allow/deny verdict plus the metadata the HTTP layer reports.
///
/// `current` may exceed `limit`: the increment happens before the
/// comparison, so the call that tips the count over is itself denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub reset_in_seconds: u64,
    pub source: DecisionSource,
}

impl Decision {
    /// Build a decision from a post-increment count.
    pub fn counted(
        current: u64,
        limit: u64,
        now_millis: u64,
        reset_at_millis: u64,
        source: DecisionSource,
    ) -> Self {
        Self {
            allowed: current <= limit,
            current,
            limit,
            remaining: limit.saturating_sub(current),
            reset_at: millis_to_datetime(reset_at_millis),
            reset_in_seconds: reset_at_millis.saturating_sub(now_millis).div_ceil(1000),
            source,
        }
    }

    /// An unenforced allow, used when no accounting path is available.
    pub fn fail_open(limit: u64, now_millis: u64, window_ms: u64) -> Self {
        let reset_at_millis = now_millis.saturating_add(window_ms);
        Self {
            allowed: true,
            current: 0,
            limit,
            remaining: limit,
            reset_at: millis_to_datetime(reset_at_millis),
            reset_in_seconds: window_ms.div_ceil(1000),
            source: DecisionSource::FailOpen,
        }
    }

    /// Seconds a denied caller should wait before retrying; zero when allowed.
    pub fn retry_after_secs(&self) -> u64 {
        if self.allowed {
            0
        } else {
            self.reset_in_seconds.max(1)
        }
    }
}

fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_inclusive() {
        let at_limit = Decision::counted(5, 5, 0, 60_000, DecisionSource::Backend);
        assert!(at_limit.allowed);
        assert_eq!(at_limit.remaining, 0);

        let over = Decision::counted(6, 5, 0, 60_000, DecisionSource::Backend);
        assert!(!over.allowed);
        assert_eq!(over.remaining, 0);
        assert_eq!(over.current, 6);
    }

    #[test]
    fn test_zero_limit_denies() {
        let decision = Decision::counted(1, 0, 0, 1000, DecisionSource::Fallback);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_reset_seconds_round_up() {
        let decision = Decision::counted(1, 5, 1_000, 2_500, DecisionSource::Backend);
        assert_eq!(decision.reset_in_seconds, 2);
        assert_eq!(decision.reset_at.timestamp_millis(), 2_500);
    }

    #[test]
    fn test_retry_after() {
        let allowed = Decision::counted(1, 5, 0, 10_000, DecisionSource::Backend);
        assert_eq!(allowed.retry_after_secs(), 0);

        let denied = Decision::counted(6, 5, 9_999, 10_000, DecisionSource::Backend);
        assert_eq!(denied.retry_after_secs(), 1);
    }

    #[test]
    fn test_fail_open_echoes_limit() {
        let decision = Decision::fail_open(10, 0, 60_000);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 10);
        assert_eq!(decision.source, DecisionSource::FailOpen);
    }
}
