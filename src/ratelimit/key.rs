//! Canonical key generation for counting windows.

/// Category name reserved for per-caller quota override records.
pub const OVERRIDE_NAMESPACE: &str = "override";

/// A key that uniquely identifies one countable window.
///
/// The backend and the local fallback both count under the string produced
/// by [`RateLimitKey::to_string_key`], so a caller keeps the same identity
/// whichever path evaluates it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Namespace shared by every key this process writes
    pub prefix: String,
    /// The protected operation
    pub category: String,
    /// The caller being counted
    pub caller_id: String,
}

impl RateLimitKey {
    /// Create a new key from its parts.
    pub fn new(prefix: &str, category: &str, caller_id: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            category: category.to_string(),
            caller_id: caller_id.to_string(),
        }
    }

    /// Serialize the key as `prefix:category:caller_id`.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.prefix, self.category, self.caller_id)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Key under which a caller's quota override is persisted.
pub fn override_key(prefix: &str, caller_id: &str) -> String {
    format!("{}:{}:{}", prefix, OVERRIDE_NAMESPACE, caller_id)
}
