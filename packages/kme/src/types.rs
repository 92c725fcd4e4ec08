//! Identifier and key types shared across the core

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Identifier of a SAE
pub type SaeId = String;

/// Ordinal of an epoch. Producers emit fixed-width ids, so the string order
/// is the arrival order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochId(String);

impl EpochId {
    /// Wrap an epoch identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EpochId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of an issued key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Wrap a key identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A key handed to a caller. Never persisted; bytes are wiped on drop.
#[derive(Clone)]
pub struct KeyRecord {
    /// Identifier recorded in the ledger
    pub key_id: KeyId,
    /// Key material
    pub key: Zeroizing<Vec<u8>>,
}

impl KeyRecord {
    /// Key material in standard base64, as carried by the SAE-facing API
    pub fn key_base64(&self) -> String {
        STANDARD.encode(self.key.as_slice())
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("key_id", &self.key_id)
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .finish()
    }
}
