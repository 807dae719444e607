//! Counter store abstraction shared by every process in the fleet.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use super::clock::Clock;
use super::key::override_key;
use super::quota::Quota;

/// Failures reported by a counter store.
///
/// These never reach the request path: the engine recovers from them by
/// falling back to local accounting.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("counter store returned malformed data: {0}")]
    Malformed(String),
}

/// The minimal command surface required from the shared counter store.
///
/// `increment` must be atomic across every process using the store; it is
/// the only serialization point for backend-path decisions.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Atomically increment the key and return the new count.
    async fn increment(&self, key: &str) -> Result<u64, AdapterError>;

    /// Set the key's lifetime. Only the caller that created the window calls this.
    async fn expire(&self, key: &str, window_secs: u64) -> Result<(), AdapterError>;

    /// Remaining lifetime of the key, or `None` if it is absent or never expires.
    async fn ttl_millis(&self, key: &str) -> Result<Option<u64>, AdapterError>;

    /// Read a caller's persisted quota override.
    async fn get_override(&self, caller_id: &str) -> Result<Option<Quota>, AdapterError>;

    /// Persist a caller's quota override with long retention.
    async fn set_override(&self, caller_id: &str, quota: Quota) -> Result<(), AdapterError>;

    /// Remove a caller's quota override.
    async fn delete_override(&self, caller_id: &str) -> Result<(), AdapterError>;

    /// Remove a counting window.
    async fn clear(&self, key: &str) -> Result<(), AdapterError>;
}

/// Bound a store call. An elapsed timeout is reported like any other store failure.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| AdapterError::Timeout(timeout))?
}

#[derive(Debug, Clone, Copy)]
struct StoredCounter {
    count: u64,
    expires_at: Option<u64>,
}

impl StoredCounter {
    /// A key is gone only once the clock has passed its expiry, as in Redis.
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| now <= at)
    }
}

/// A single-process implementation of the counter store contract.
///
/// Keys expire according to the injected clock, the same way the shared
/// store expires them. Useful for local development and tests.
pub struct InMemoryBackend {
    prefix: String,
    counters: DashMap<String, StoredCounter>,
    overrides: DashMap<String, Quota>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackend {
    /// Create an empty store.
    pub fn new(prefix: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            prefix: prefix.to_string(),
            counters: DashMap::new(),
            overrides: DashMap::new(),
            clock,
        }
    }

    /// Number of stored counters, live or not yet reaped.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no counters are stored.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterBackend for InMemoryBackend {
    async fn increment(&self, key: &str) -> Result<u64, AdapterError> {
        let now = self.clock.now_millis();
        let mut entry = self.counters.entry(key.to_string()).or_insert(StoredCounter {
            count: 0,
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = StoredCounter {
                count: 0,
                expires_at: None,
            };
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn expire(&self, key: &str, window_secs: u64) -> Result<(), AdapterError> {
        let now = self.clock.now_millis();
        if let Some(mut entry) = self.counters.get_mut(key) {
            if entry.is_live(now) {
                entry.expires_at = Some(now + window_secs * 1000);
            }
        }
        Ok(())
    }

    async fn ttl_millis(&self, key: &str) -> Result<Option<u64>, AdapterError> {
        let now = self.clock.now_millis();
        Ok(self.counters.get(key).and_then(|entry| {
            if entry.is_live(now) {
                entry.expires_at.map(|at| at - now)
            } else {
                None
            }
        }))
    }

    async fn get_override(&self, caller_id: &str) -> Result<Option<Quota>, AdapterError> {
        let key = override_key(&self.prefix, caller_id);
        Ok(self.overrides.get(&key).map(|q| *q))
    }

    async fn set_override(&self, caller_id: &str, quota: Quota) -> Result<(), AdapterError> {
        self.overrides.insert(override_key(&self.prefix, caller_id), quota);
        Ok(())
    }

    async fn delete_override(&self, caller_id: &str) -> Result<(), AdapterError> {
        self.overrides.remove(&override_key(&self.prefix, caller_id));
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), AdapterError> {
        self.counters.remove(key);
        Ok(())
    }
}

/// Test doubles for exercising failure paths.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// An in-memory store that can be told to fail or hang, and counts calls.
    pub struct FlakyBackend {
        inner: InMemoryBackend,
        failing: AtomicBool,
        hanging: AtomicBool,
        failing_expire: AtomicBool,
        malformed_overrides: AtomicBool,
        expires: AtomicUsize,
    }

    impl FlakyBackend {
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                inner: InMemoryBackend::new("rl", clock),
                failing: AtomicBool::new(false),
                hanging: AtomicBool::new(false),
                failing_expire: AtomicBool::new(false),
                malformed_overrides: AtomicBool::new(false),
                expires: AtomicUsize::new(0),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn set_hanging(&self, hanging: bool) {
            self.hanging.store(hanging, Ordering::SeqCst);
        }

        /// Fail only `expire`, leaving increments working.
        pub fn set_failing_expire(&self, failing: bool) {
            self.failing_expire.store(failing, Ordering::SeqCst);
        }

        /// Report every stored override as unparseable.
        pub fn set_malformed_overrides(&self, malformed: bool) {
            self.malformed_overrides.store(malformed, Ordering::SeqCst);
        }

        /// The wrapped store, for inspecting counts directly.
        pub fn inner(&self) -> &InMemoryBackend {
            &self.inner
        }

        pub fn expire_calls(&self) -> usize {
            self.expires.load(Ordering::SeqCst)
        }

        async fn gate(&self) -> Result<(), AdapterError> {
            if self.hanging.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(AdapterError::Unavailable("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CounterBackend for FlakyBackend {
        async fn increment(&self, key: &str) -> Result<u64, AdapterError> {
            self.gate().await?;
            self.inner.increment(key).await
        }

        async fn expire(&self, key: &str, window_secs: u64) -> Result<(), AdapterError> {
            self.gate().await?;
            self.expires.fetch_add(1, Ordering::SeqCst);
            if self.failing_expire.load(Ordering::SeqCst) {
                return Err(AdapterError::Unavailable("expire rejected".into()));
            }
            self.inner.expire(key, window_secs).await
        }

        async fn ttl_millis(&self, key: &str) -> Result<Option<u64>, AdapterError> {
            self.gate().await?;
            self.inner.ttl_millis(key).await
        }

        async fn get_override(&self, caller_id: &str) -> Result<Option<Quota>, AdapterError> {
            self.gate().await?;
            if self.malformed_overrides.load(Ordering::SeqCst) {
                return Err(AdapterError::Malformed("bad json".into()));
            }
            self.inner.get_override(caller_id).await
        }

        async fn set_override(&self, caller_id: &str, quota: Quota) -> Result<(), AdapterError> {
            self.gate().await?;
            self.inner.set_override(caller_id, quota).await
        }

        async fn delete_override(&self, caller_id: &str) -> Result<(), AdapterError> {
            self.gate().await?;
            self.inner.delete_override(caller_id).await
        }

        async fn clear(&self, key: &str) -> Result<(), AdapterError> {
            self.gate().await?;
            self.inner.clear(key).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    #[tokio::test]
    async fn test_increment_counts_up() {
        let backend = InMemoryBackend::new("rl", Arc::new(ManualClock::new(0)));
        assert_eq!(backend.increment("k").await.unwrap(), 1);
        assert_eq!(backend.increment("k").await.unwrap(), 2);
        assert_eq!(backend.increment("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_key_expires_with_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = InMemoryBackend::new("rl", clock.clone());

        backend.increment("k").await.unwrap();
        backend.expire("k", 2).await.unwrap();
        assert_eq!(backend.ttl_millis("k").await.unwrap(), Some(2000));

        clock.advance(1500);
        assert_eq!(backend.ttl_millis("k").await.unwrap(), Some(500));

        clock.advance(500);
        assert_eq!(backend.ttl_millis("k").await.unwrap(), Some(0));
        assert_eq!(backend.increment("k").await.unwrap(), 2);

        clock.advance(1);
        assert_eq!(backend.ttl_millis("k").await.unwrap(), None);
        assert_eq!(backend.increment("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_absent_without_expiry() {
        let backend = InMemoryBackend::new("rl", Arc::new(ManualClock::new(0)));
        assert_eq!(backend.ttl_millis("missing").await.unwrap(), None);

        backend.increment("k").await.unwrap();
        assert_eq!(backend.ttl_millis("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overrides_do_not_touch_counters() {
        let backend = InMemoryBackend::new("rl", Arc::new(ManualClock::new(0)));
        let quota = Quota::new(3, 1000).unwrap();

        backend.set_override("user-1", quota).await.unwrap();
        assert_eq!(backend.get_override("user-1").await.unwrap(), Some(quota));
        assert!(backend.is_empty());

        backend.delete_override("user-1").await.unwrap();
        assert_eq!(backend.get_override("user-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let result: Result<(), AdapterError> = with_timeout(Duration::from_millis(10), async {
            futures::future::pending::<()>().await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AdapterError::Timeout(_))));
    }
}
