//! Error types for the Turnstile service.

use thiserror::Error;

use crate::ratelimit::AdapterError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors. Fatal at setup time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors surfaced to administrative callers
    #[error("Counter store error: {0}")]
    Adapter(#[from] AdapterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
