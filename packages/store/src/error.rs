//! Error types for secret store operations

use qkme_common::Retryable;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Secret store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Compare-and-swap rejected because the stored version moved
    #[error("Version conflict at {path}: expected version {expected}")]
    VersionConflict {
        /// Store path of the document
        path: String,
        /// Version the writer expected to replace
        expected: u64,
    },

    /// Read-modify-CAS loop gave up after repeated conflicts
    #[error("Contention exhausted at {path} after {attempts} attempts")]
    ContentionExhausted {
        /// Store path of the document
        path: String,
        /// Attempts made
        attempts: u32,
    },

    /// The store could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store did not answer in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The store is reachable but not serving (sealed, uninitialized, offline)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// The store answered with an unexpected status
    #[error("Backend error: {operation} failed with status {status} - {details}")]
    Backend {
        /// Operation being performed
        operation: String,
        /// Status code returned
        status: u16,
        /// Response details
        details: String,
    },

    /// Invalid store path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Client configuration is unusable
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure while loading local material (certificates)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error occurred
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Create a backend error
    pub fn backend(operation: impl Into<String>, status: u16, details: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            status,
            details: details.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for a compare-and-swap rejection
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Unavailable(_)
        )
    }
}
