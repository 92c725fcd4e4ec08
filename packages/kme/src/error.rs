//! Error taxonomy of the key management core
//!
//! Every error carries the HTTP status class the surrounding layer should
//! answer with, see [`KmeError::http_status`].

use qkme_common::Retryable;
use qkme_store::StoreError;
use thiserror::Error;

/// Result type for key management operations
pub type Result<T> = std::result::Result<T, KmeError>;

/// Key management errors
#[derive(Debug, Error)]
pub enum KmeError {
    /// The pool cannot satisfy the request even after pending claims settle
    #[error("Not enough keying material ({available} bytes) to satisfy request of {requested} bytes")]
    InsufficientMaterial {
        /// Bytes that could be claimed
        available: u64,
        /// Bytes requested
        requested: u64,
    },

    /// The needed epochs stayed reserved by other callers
    #[error("Keying material reserved by other requests after {attempts} attempts")]
    ReservedButUnavailable {
        /// Attempts made
        attempts: u32,
    },

    /// A read-modify-CAS cycle kept conflicting
    #[error("Contention exhausted at {path} after {attempts} attempts")]
    ContentionExhausted {
        /// Store path under contention
        path: String,
        /// Attempts made
        attempts: u32,
    },

    /// Stored epoch content failed the three-way digest check
    #[error("Integrity check failed for epoch {epoch_id} on channel {channel}")]
    IntegrityFailure {
        /// Channel direction
        channel: String,
        /// Epoch identifier
        epoch_id: String,
    },

    /// The requester is not the SAE pair the key was issued to
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// One or more key ids are unknown
    #[error("Key ID(s) not found: {}", key_ids.join(", "))]
    NotFound {
        /// Every unknown id in the request
        key_ids: Vec<String>,
    },

    /// One or more key ids were already consumed
    #[error("Key ID(s) not available: {}", key_ids.join(", "))]
    NotAvailable {
        /// Every unavailable id in the request
        key_ids: Vec<String>,
    },

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A ledger entry with this key id already exists
    #[error("Duplicate key ID: {0}")]
    DuplicateKeyId(String),

    /// The peer did not answer within the replication timeout
    #[error("Peer KME timed out: {0}")]
    PeerTimeout(String),

    /// The peer is overloaded
    #[error("Peer KME busy: {0}")]
    PeerBusy(String),

    /// The peer could not be reached
    #[error("Peer KME unreachable: {0}")]
    PeerUnreachable(String),

    /// The peer refused the replication request
    #[error("Peer KME rejected replication with status {status}: {details}")]
    PeerRejected {
        /// Status returned by the peer
        status: u16,
        /// Response body
        details: String,
    },

    /// Secret store failure
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal consistency failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KmeError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// HTTP status class for this error
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InsufficientMaterial { .. }
            | Self::NotFound { .. }
            | Self::NotAvailable { .. }
            | Self::InvalidRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::ReservedButUnavailable { .. }
            | Self::ContentionExhausted { .. }
            | Self::IntegrityFailure { .. }
            | Self::PeerBusy(_)
            | Self::PeerUnreachable(_) => 503,
            Self::PeerTimeout(_) => 504,
            Self::PeerRejected { .. } => 502,
            Self::Store(err) if err.is_retryable() => 503,
            Self::Store(_)
            | Self::DuplicateKeyId(_)
            | Self::Configuration(_)
            | Self::Internal(_) => 500,
        }
    }

    /// True when the caller's request itself was at fault
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

impl From<StoreError> for KmeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ContentionExhausted { path, attempts } => {
                Self::ContentionExhausted { path, attempts }
            }
            StoreError::Configuration(msg) => Self::Configuration(msg),
            other => Self::Store(other),
        }
    }
}

impl From<serde_json::Error> for KmeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(err))
    }
}

impl Retryable for KmeError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::PeerUnreachable(_) => true,
            Self::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}
