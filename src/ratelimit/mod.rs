//! Admission control: fixed-window counting against a shared store with a
//! local fallback.

mod backend;
mod clock;
mod decision;
mod fallback;
mod key;
mod limiter;
mod quota;
mod redis_backend;
mod stats;

pub use backend::{with_timeout, AdapterError, CounterBackend, InMemoryBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, DecisionSource};
pub use fallback::{FallbackCounter, WindowState};
pub use key::{override_key, RateLimitKey, OVERRIDE_NAMESPACE};
pub use limiter::{AdmissionEngine, CheckRequest};
pub use quota::{Quota, QuotaResolver};
pub use redis_backend::RedisBackend;
pub use stats::{Statistics, StatsSnapshot};
