//! Error types for dictkv
//!
//! Provides a unified error type for protocol, transport and setup failures.
//! Backend failures are not errors here: they travel as data inside
//! `LookupResult` / `CommitResult` and become FAIL replies.

use thiserror::Error;

/// Result type alias using DictError
pub type Result<T> = std::result::Result<T, DictError>;

/// Unified error type for dictkv operations
#[derive(Debug, Error)]
pub enum DictError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Protocol Errors (malformed input, never answered with a reply)
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown command {0:?}")]
    UnknownCommand(char),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection closed")]
    ConnectionClosed,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DictError {
    /// Shorthand for a malformed-input error
    pub fn protocol(msg: impl Into<String>) -> Self {
        DictError::Protocol(msg.into())
    }

    /// Whether this error is a client protocol fault (as opposed to I/O)
    pub fn is_protocol(&self) -> bool {
        matches!(self, DictError::Protocol(_) | DictError::UnknownCommand(_))
    }
}
