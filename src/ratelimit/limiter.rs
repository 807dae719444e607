//! The admission engine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::backend::{with_timeout, AdapterError, CounterBackend};
use super::clock::{Clock, SystemClock};
use super::decision::{Decision, DecisionSource};
use super::fallback::FallbackCounter;
use super::key::RateLimitKey;
use super::quota::{Quota, QuotaResolver};
use super::stats::{Statistics, StatsSnapshot};
use crate::config::AdmissionConfig;
use crate::error::{Result, TurnstileError};

/// One admission check, optionally pinning the limit or window.
#[derive(Debug, Clone, Copy)]
pub struct CheckRequest<'a> {
    pub caller_id: &'a str,
    pub category: &'a str,
    /// Overrides any resolved limit. Zero denies every call.
    pub limit: Option<u64>,
    /// Overrides any resolved window. Must be positive.
    pub window_ms: Option<u64>,
}

impl<'a> CheckRequest<'a> {
    pub fn new(caller_id: &'a str, category: &'a str) -> Self {
        Self {
            caller_id,
            category,
            limit: None,
            window_ms: None,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = Some(window_ms);
        self
    }
}

/// Decides whether a caller may proceed.
///
/// Each call counts in the shared store when one is configured and
/// reachable, otherwise in the local fallback counter, otherwise allows
/// unconditionally. The path taken is recorded in [`Statistics`].
pub struct AdmissionEngine {
    backend: Option<Arc<dyn CounterBackend>>,
    fallback: FallbackCounter,
    quotas: QuotaResolver,
    stats: Statistics,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    fallback_enabled: bool,
    fallback_max_entries: usize,
    /// Local window count that triggers the next purge
    purge_threshold: AtomicUsize,
    timeout: Duration,
    /// Set while the store is failing, so outages are logged once
    degraded: AtomicBool,
}

impl AdmissionEngine {
    /// Create an engine using the system clock.
    pub fn new(config: &AdmissionConfig, backend: Option<Arc<dyn CounterBackend>>) -> Result<Self> {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(
        config: &AdmissionConfig,
        backend: Option<Arc<dyn CounterBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let quotas = QuotaResolver::new(
            backend.clone(),
            config.default_quota(),
            config.categories.clone(),
            config.backend_timeout(),
        );

        info!(
            backend = backend.is_some(),
            fallback_enabled = config.fallback_enabled,
            default_limit = config.default_limit,
            default_window_ms = config.default_window_ms,
            "Admission engine initialized"
        );

        Ok(Self {
            backend,
            fallback: FallbackCounter::new(clock.clone()),
            quotas,
            stats: Statistics::new(),
            clock,
            key_prefix: config.key_prefix.clone(),
            fallback_enabled: config.fallback_enabled,
            fallback_max_entries: config.fallback_max_entries,
            purge_threshold: AtomicUsize::new(config.fallback_max_entries),
            timeout: config.backend_timeout(),
            degraded: AtomicBool::new(false),
        })
    }

    /// Count one call by `caller_id` against `category`.
    pub async fn check(&self, caller_id: &str, category: &str) -> Result<Decision> {
        self.check_with(CheckRequest::new(caller_id, category)).await
    }

    /// Count one call, honoring any explicit limit or window in the request.
    ///
    /// The only error is a configuration error; store failures degrade the
    /// decision path instead.
    pub async fn check_with(&self, request: CheckRequest<'_>) -> Result<Decision> {
        let quota = self.effective_quota(&request).await?;
        let key = RateLimitKey::new(&self.key_prefix, request.category, request.caller_id)
            .to_string_key();

        trace!(
            key = %key,
            limit = quota.limit,
            window_ms = quota.window_ms,
            "Checking admission"
        );

        let decision = match self.count_in_backend(&key, quota).await {
            Some(decision) => decision,
            None if self.fallback_enabled => {
                self.purge_if_full();
                self.fallback.increment(&key, quota)
            }
            None => {
                // Visible through `fail_open_decisions`; the outage itself was
                // already logged when the store first failed.
                debug!(key = %key, "No accounting path available, allowing");
                Decision::fail_open(quota.limit, self.clock.now_millis(), quota.window_ms)
            }
        };

        self.stats.record_decision(decision.source, decision.allowed);

        if !decision.allowed {
            debug!(
                key = %key,
                count = decision.current,
                limit = decision.limit,
                source = ?decision.source,
                "Admission denied"
            );
        }

        Ok(decision)
    }

    /// Resolution order: explicit request values, then the caller's
    /// persisted override, then the category default.
    async fn effective_quota(&self, request: &CheckRequest<'_>) -> Result<Quota> {
        if request.window_ms == Some(0) {
            return Err(TurnstileError::Config("window must be positive".into()));
        }

        Ok(match (request.limit, request.window_ms) {
            (Some(limit), Some(window_ms)) => Quota { limit, window_ms },
            (limit, window_ms) => {
                let resolved = match self
                    .quotas
                    .try_resolve(request.caller_id, request.category)
                    .await
                {
                    Ok(quota) => quota,
                    Err(e) => {
                        self.record_store_failure(request.caller_id, &e);
                        self.quotas.category_default(request.category)
                    }
                };
                Quota {
                    limit: limit.unwrap_or(resolved.limit),
                    window_ms: window_ms.unwrap_or(resolved.window_ms),
                }
            }
        })
    }

    /// Count in the shared store. `None` means the call was not counted
    /// there and the caller must degrade.
    async fn count_in_backend(&self, key: &str, quota: Quota) -> Option<Decision> {
        let backend = self.backend.as_ref()?;

        let current = match with_timeout(self.timeout, backend.increment(key)).await {
            Ok(current) => current,
            Err(e) => {
                self.record_store_failure(key, &e);
                return None;
            }
        };

        // The call is counted in the store from here on. Later failures only
        // cost reset accuracy; sending it to the fallback would count it twice.
        let ttl_millis = match self.window_ttl(backend.as_ref(), key, quota, current).await {
            Ok(ttl) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("Counter store recovered");
                }
                ttl
            }
            Err(e) => {
                self.record_store_failure(key, &e);
                quota.window_ms
            }
        };

        let now = self.clock.now_millis();
        Some(Decision::counted(
            current,
            quota.limit,
            now,
            now.saturating_add(ttl_millis),
            DecisionSource::Backend,
        ))
    }

    /// Set the window's lifetime if this call created it, then read what is left.
    async fn window_ttl(
        &self,
        backend: &dyn CounterBackend,
        key: &str,
        quota: Quota,
        current: u64,
    ) -> std::result::Result<u64, AdapterError> {
        // Only the creator of a window sets its lifetime, so sustained
        // traffic cannot keep pushing the expiry out.
        if current == 1 {
            with_timeout(self.timeout, backend.expire(key, quota.window_secs())).await?;
        }

        match with_timeout(self.timeout, backend.ttl_millis(key)).await? {
            Some(ttl) => Ok(ttl),
            None => {
                // The creator's expire was lost; without this the key never resets.
                debug!(key = %key, "Window has no lifetime, re-arming expiry");
                with_timeout(self.timeout, backend.expire(key, quota.window_secs())).await?;
                Ok(quota.window_ms)
            }
        }
    }

    fn record_store_failure(&self, key: &str, e: &AdapterError) {
        self.stats.record_backend_error();
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                error = %e,
                fallback_enabled = self.fallback_enabled,
                "Counter store unavailable, degrading admission decisions"
            );
        } else {
            debug!(key = %key, error = %e, "Counter store call failed");
        }
    }

    /// Sweep expired local windows once the map outgrows its bound. Windows
    /// still live after a sweep raise the threshold, so the next sweep waits
    /// for real growth instead of running on every call.
    fn purge_if_full(&self) {
        let live = self.fallback.live_entries();
        if live <= self.purge_threshold.load(Ordering::Relaxed) {
            return;
        }

        let purged = self.fallback.purge_expired();
        let remaining = self.fallback.live_entries();
        let step = (self.fallback_max_entries / 10).max(1);
        let next = if remaining <= self.fallback_max_entries {
            self.fallback_max_entries
        } else {
            remaining + step
        };
        self.purge_threshold.store(next, Ordering::Relaxed);
        debug!(purged = purged, remaining = remaining, "Purged expired local windows");
    }

    /// Forget a caller's current window on every path.
    pub async fn reset_caller(&self, caller_id: &str, category: &str) -> Result<()> {
        let key = RateLimitKey::new(&self.key_prefix, category, caller_id).to_string_key();
        self.fallback.clear(&key);

        if let Some(backend) = &self.backend {
            with_timeout(self.timeout, backend.clear(&key))
                .await
                .map_err(|e| {
                    self.stats.record_backend_error();
                    e
                })?;
        }
        info!(key = %key, "Caller window reset");
        Ok(())
    }

    /// The quota resolver, for administering overrides.
    pub fn quotas(&self) -> &QuotaResolver {
        &self.quotas
    }

    /// The local fallback counter.
    pub fn fallback(&self) -> &FallbackCounter {
        &self.fallback
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
        info!("Admission statistics reset");
    }
}
