//! Error types for ReplKV
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for ReplKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ReplKV
#[derive(Debug, Error)]
pub enum Error {
    // Request errors
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("malformed log entry: {0}")]
    MalformedEntry(String),

    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("data corruption detected: {0}")]
    Corruption(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Network errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("node is isolated: none of {configured} configured peers answered")]
    Isolated { configured: usize },

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a malformed entry error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEntry(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error was caused by the caller's input
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::MalformedEntry(_))
    }

    /// Get HTTP status code for the error
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::Validation(_) | Self::MalformedEntry(_) => 400,

            // 500 Internal Server Error
            Self::Io(_)
            | Self::Storage(_)
            | Self::Corruption(_)
            | Self::Configuration(_)
            | Self::Internal(_) => 500,

            // 503 Service Unavailable
            Self::ConnectionFailed(_) | Self::Timeout | Self::Isolated { .. } => 503,
        }
    }
}
