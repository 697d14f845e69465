//! Error types for Wharf

use std::io;
use thiserror::Error;

/// Result type for Wharf operations
pub type Result<T> = std::result::Result<T, WharfError>;

/// Errors that can occur in Wharf
#[derive(Debug, Error)]
pub enum WharfError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    TlsError(String),

    /// A value exceeds its configured limit
    #[error("Limit exceeded: {actual} exceeds limit of {limit}")]
    LimitExceeded {
        /// Configured limit
        limit: usize,
        /// Offending value
        actual: usize,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}
