//! Configuration management for Turnstile.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Quota, OVERRIDE_NAMESPACE};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Requests allowed per window when nothing more specific applies
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Window length in milliseconds when nothing more specific applies
    #[serde(default = "default_window_ms")]
    pub default_window_ms: u64,

    /// Prefix for every key written to the counter store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Count locally when the counter store is unusable
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,

    /// Upper bound on a single counter store call
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Local windows held before expired ones are purged
    #[serde(default = "default_fallback_max_entries")]
    pub fallback_max_entries: usize,

    /// Per-category quotas
    #[serde(default)]
    pub categories: HashMap<String, Quota>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_window_ms: default_window_ms(),
            key_prefix: default_key_prefix(),
            fallback_enabled: default_fallback_enabled(),
            backend_timeout_ms: default_backend_timeout_ms(),
            fallback_max_entries: default_fallback_max_entries(),
            categories: HashMap::new(),
        }
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_fallback_enabled() -> bool {
    true
}

fn default_backend_timeout_ms() -> u64 {
    250
}

fn default_fallback_max_entries() -> usize {
    10000
}

impl AdmissionConfig {
    /// The process-wide default quota.
    pub fn default_quota(&self) -> Quota {
        Quota {
            limit: self.default_limit,
            window_ms: self.default_window_ms,
        }
    }

    /// Upper bound on a single counter store call.
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// Reject configurations that cannot produce meaningful decisions.
    pub fn validate(&self) -> Result<()> {
        self.default_quota()
            .validate()
            .map_err(|e| TurnstileError::Config(format!("default quota: {}", e)))?;

        if self.key_prefix.is_empty() {
            return Err(TurnstileError::Config("key_prefix must not be empty".into()));
        }
        if self.backend_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "backend_timeout_ms must be positive".into(),
            ));
        }

        for (category, quota) in &self.categories {
            if category == OVERRIDE_NAMESPACE {
                return Err(TurnstileError::Config(format!(
                    "category name '{}' is reserved",
                    OVERRIDE_NAMESPACE
                )));
            }
            quota
                .validate()
                .map_err(|e| TurnstileError::Config(format!("category {}: {}", category, e)))?;
        }
        Ok(())
    }
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; without one, decisions are counted locally only
    pub redis_url: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus `TURNSTILE__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("TURNSTILE")
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.admission.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig =
            serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.admission.validate()?;
        Ok(config)
    }
}
