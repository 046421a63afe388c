//! Error types for kiosk-agent
//!
//! Errors fall into four families:
//! - transient network failures (retried, never fatal)
//! - integrity failures (artifact discarded, retried next cycle)
//! - invalid mode transitions (reported to the caller)
//! - invalid remote payloads or configuration (cycle rejected, prior state kept)

use kiosk_common::events::PlayerMode;
use thiserror::Error;

/// Main error type for kiosk-agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// Connection, timeout or body read failure
    #[error("Network error: {0}")]
    Network(String),

    /// Authority answered with a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Downloaded artifact did not match its advertised hash
    #[error("Integrity check failed for {artifact}: expected {expected}, got {actual}")]
    Integrity {
        artifact: String,
        expected: String,
        actual: String,
    },

    /// Remote payload failed validation
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Requested mode transition is not in the transition table
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: PlayerMode, to: PlayerMode },

    /// Compare-and-transition lost the race
    #[error("Mode is {actual}, expected {expected}")]
    SourceMismatch {
        expected: PlayerMode,
        actual: PlayerMode,
    },

    /// Matching index could not be parsed or searched
    #[error("Index error: {0}")]
    Index(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from the shared crate (persistence, hashing, config)
    #[error(transparent)]
    Common(#[from] kiosk_common::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Should the failed call be attempted again with backoff?
    ///
    /// Timeouts, refused connections and 5xx responses are transient.
    /// 4xx responses, integrity failures and invalid payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Network(_) => true,
            AgentError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            AgentError::Io(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            AgentError::HttpStatus {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            AgentError::Network(e.to_string())
        }
    }
}

/// Convenience Result type using kiosk-agent Error
pub type Result<T> = std::result::Result<T, AgentError>;
