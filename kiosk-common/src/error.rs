//! Common error types for the kiosk agent workspace

use thiserror::Error;

/// Common result type for kiosk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the kiosk crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error for persisted state
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error for the bootstrap configuration file
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input, typically an untrusted remote payload
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Content hash did not match the advertised hash
    #[error("Integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
