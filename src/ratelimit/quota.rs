//! Quotas and per-caller quota resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::{with_timeout, AdapterError, CounterBackend};
use crate::error::{Result, TurnstileError};

/// A limit and the fixed window it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    /// Maximum requests allowed in one window
    pub limit: u64,
    /// Window length in milliseconds
    #[serde(alias = "window_ms")]
    pub window_ms: u64,
}

impl Quota {
    /// Create a validated quota.
    pub fn new(limit: u64, window_ms: u64) -> Result<Self> {
        let quota = Self { limit, window_ms };
        quota.validate()?;
        Ok(quota)
    }

    /// Both fields must be positive.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(TurnstileError::Config("quota limit must be positive".into()));
        }
        if self.window_ms == 0 {
            return Err(TurnstileError::Config("quota window must be positive".into()));
        }
        Ok(())
    }

    /// Window length in whole seconds, rounded up so a window is never shortened.
    ///
    /// The store only expires keys at second granularity, so a backend window
    /// for a `window_ms` that is not a multiple of 1000 outlives the local
    /// fallback window for the same quota: 1500ms counts locally until
    /// start+1500ms but in the store until start+2000ms.
    pub fn window_secs(&self) -> u64 {
        self.window_ms.div_ceil(1000).max(1)
    }
}

/// Resolves the effective quota for a caller.
///
/// A persisted per-caller override wins over the configured quota for the
/// category, which in turn wins over the process default.
pub struct QuotaResolver {
    backend: Option<Arc<dyn CounterBackend>>,
    default_quota: Quota,
    categories: HashMap<String, Quota>,
    timeout: Duration,
}

impl QuotaResolver {
    /// Create a resolver.
    pub fn new(
        backend: Option<Arc<dyn CounterBackend>>,
        default_quota: Quota,
        categories: HashMap<String, Quota>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            default_quota,
            categories,
            timeout,
        }
    }

    /// The configured quota for a category, ignoring overrides.
    pub fn category_default(&self, category: &str) -> Quota {
        self.categories
            .get(category)
            .copied()
            .unwrap_or(self.default_quota)
    }

    /// Resolve the quota that applies to the caller's next decision.
    ///
    /// A store failure degrades to the category default.
    pub async fn resolve(&self, caller_id: &str, category: &str) -> Quota {
        match self.try_resolve(caller_id, category).await {
            Ok(quota) => quota,
            Err(e) => {
                warn!(
                    caller_id = %caller_id,
                    error = %e,
                    "Failed to read quota override, using category default"
                );
                self.category_default(category)
            }
        }
    }

    /// Resolve the caller's quota, reporting a failed override read instead of
    /// degrading. Callers choose what to fall back to.
    pub async fn try_resolve(
        &self,
        caller_id: &str,
        category: &str,
    ) -> std::result::Result<Quota, AdapterError> {
        match self.get(caller_id).await? {
            Some(quota) => {
                debug!(caller_id = %caller_id, ?quota, "Using quota override");
                Ok(quota)
            }
            None => Ok(self.category_default(category)),
        }
    }

    /// Read the persisted override for a caller, if any.
    pub async fn get(&self, caller_id: &str) -> std::result::Result<Option<Quota>, AdapterError> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        let quota = with_timeout(self.timeout, backend.get_override(caller_id)).await?;
        // An invalid stored record must not turn into a zero-width window.
        match quota {
            Some(q) if q.validate().is_err() => Err(AdapterError::Malformed(format!(
                "override for {} has non-positive fields",
                caller_id
            ))),
            other => Ok(other),
        }
    }

    /// Persist an override for a caller.
    pub async fn set(&self, caller_id: &str, quota: Quota) -> Result<()> {
        quota.validate()?;
        let backend = self.require_backend()?;
        with_timeout(self.timeout, backend.set_override(caller_id, quota)).await?;
        info!(caller_id = %caller_id, ?quota, "Quota override set");
        Ok(())
    }

    /// Delete a caller's override so the category default applies again.
    pub async fn reset(&self, caller_id: &str) -> Result<()> {
        let backend = self.require_backend()?;
        with_timeout(self.timeout, backend.delete_override(caller_id)).await?;
        info!(caller_id = %caller_id, "Quota override removed");
        Ok(())
    }

    fn require_backend(&self) -> std::result::Result<&Arc<dyn CounterBackend>, AdapterError> {
        self.backend
            .as_ref()
            .ok_or_else(|| AdapterError::Unavailable("no counter store configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::testing::FlakyBackend;
    use crate::ratelimit::InMemoryBackend;
    use crate::ratelimit::ManualClock;
    use tokio_test::{assert_err, assert_ok};

    fn resolver(backend: Option<Arc<dyn CounterBackend>>) -> QuotaResolver {
        let mut categories = HashMap::new();
        categories.insert("login".to_string(), Quota::new(5, 900_000).unwrap());
        QuotaResolver::new(
            backend,
            Quota::new(1000, 60_000).unwrap(),
            categories,
            Duration::from_millis(100),
        )
    }

    fn memory_backend() -> Arc<dyn CounterBackend> {
        Arc::new(InMemoryBackend::new("rl", Arc::new(ManualClock::new(0))))
    }

    #[test]
    fn test_quota_validation() {
        assert_ok!(Quota::new(1, 1));
        assert_err!(Quota::new(0, 1000));
        assert_err!(Quota::new(10, 0));
    }

    #[test]
    fn test_quota_json_shape() {
        let quota = Quota::new(2, 1000).unwrap();
        let json = serde_json::to_string(&quota).unwrap();
        assert_eq!(json, r#"{"limit":2,"windowMs":1000}"#);

        let parsed: Quota = serde_json::from_str(r#"{"limit":7,"windowMs":500}"#).unwrap();
        assert_eq!(parsed, Quota::new(7, 500).unwrap());
    }

    #[test]
    fn test_window_secs_rounds_up() {
        assert_eq!(Quota::new(1, 1500).unwrap().window_secs(), 2);
        assert_eq!(Quota::new(1, 1).unwrap().window_secs(), 1);
        assert_eq!(Quota::new(1, 60_000).unwrap().window_secs(), 60);
    }

    #[tokio::test]
    async fn test_resolve_defaults() {
        let resolver = resolver(None);
        assert_eq!(resolver.resolve("user-1", "login").await, Quota::new(5, 900_000).unwrap());
        assert_eq!(resolver.resolve("user-1", "search").await, Quota::new(1000, 60_000).unwrap());
    }

    #[tokio::test]
    async fn test_override_takes_precedence_until_reset() {
        let resolver = resolver(Some(memory_backend()));
        let custom = Quota::new(2, 1000).unwrap();

        resolver.set("user-1", custom).await.unwrap();
        assert_eq!(resolver.resolve("user-1", "login").await, custom);
        assert_eq!(resolver.resolve("user-2", "login").await, Quota::new(5, 900_000).unwrap());

        resolver.reset("user-1").await.unwrap();
        assert_eq!(resolver.resolve("user-1", "login").await, Quota::new(5, 900_000).unwrap());
    }

    #[tokio::test]
    async fn test_set_rejects_invalid_quota() {
        let resolver = resolver(Some(memory_backend()));
        let result = resolver.set("user-1", Quota { limit: 0, window_ms: 10 }).await;
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[tokio::test]
    async fn test_set_without_backend_fails() {
        let resolver = resolver(None);
        let result = resolver.set("user-1", Quota::new(1, 1).unwrap()).await;
        assert!(matches!(
            result,
            Err(TurnstileError::Adapter(AdapterError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_default() {
        let backend = Arc::new(FlakyBackend::new(Arc::new(ManualClock::new(0))));
        backend.set_failing(true);
        let resolver = resolver(Some(backend as Arc<dyn CounterBackend>));

        assert_eq!(resolver.resolve("user-1", "login").await, Quota::new(5, 900_000).unwrap());
    }

    #[tokio::test]
    async fn test_try_resolve_reports_malformed_override() {
        let backend = Arc::new(FlakyBackend::new(Arc::new(ManualClock::new(0))));
        backend.set_malformed_overrides(true);
        let resolver = resolver(Some(backend as Arc<dyn CounterBackend>));

        let result = resolver.try_resolve("user-1", "login").await;
        assert!(matches!(result, Err(AdapterError::Malformed(_))));
        assert_eq!(resolver.resolve("user-1", "login").await, Quota::new(5, 900_000).unwrap());
    }
}
