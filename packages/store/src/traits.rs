//! The secret store contract

use crate::request::StoreRequest;

/// Opaque field map stored at one path
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Version reported for a path that holds no document.
/// A put expecting this version creates the document.
pub const ABSENT_VERSION: u64 = 0;

/// A document together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    /// Stored fields
    pub fields: Fields,
    /// Store version of this document, starting at 1
    pub version: u64,
}

/// Networked, versioned key-value service
///
/// Each successful `put` advances a document's version by exactly one.
/// Binary content must be text encoded by the caller before storage.
pub trait SecretStore: Send + Sync + 'static {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Read a document with its version; `None` when absent
    fn get(&self, path: &str) -> StoreRequest<Option<Versioned>>;

    /// Write `fields` if the stored version still equals `expected_version`.
    /// Resolves to the new version, or [`crate::StoreError::VersionConflict`].
    fn put(&self, path: &str, fields: Fields, expected_version: u64) -> StoreRequest<u64>;

    /// Current version of a document, [`ABSENT_VERSION`] when absent
    fn read_version(&self, path: &str) -> StoreRequest<u64>;

    /// Remove a document and its entire version history
    fn delete_all_versions(&self, path: &str) -> StoreRequest<()>;

    /// Names directly below `prefix`; nested folders end with `/`
    fn list(&self, prefix: &str) -> StoreRequest<Vec<String>>;
}
