//! Key provenance ledger
//!
//! Every issued key id maps to the exact epoch byte ranges it was built from
//! and to the SAE pair allowed to retrieve it. Entries are written once, flip
//! from `available` to `consumed` exactly once, and are replicated to the
//! peer KME on a best-effort basis.

pub mod receiver;
pub mod store;
pub mod sync;

pub use receiver::LedgerReceiver;
pub use store::{LedgerStore, LEDGER_INITIAL_VERSION};
pub use sync::{HttpLedgerPeer, LedgerPeer, LedgerSync, PeerRequest};

use crate::error::{KmeError, Result};
use crate::types::{EpochId, KeyId, SaeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Half-open `[start, end)` range into an epoch's original content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte
    pub start: u64,
    /// One past the last byte
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; zero for an inverted range
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// True when the range covers nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the two ranges share a byte
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Retrieval state of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    /// Not yet retrieved by key id
    Available,
    /// Retrieved; the source bytes are gone
    Consumed,
}

impl LedgerStatus {
    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Consumed => "consumed",
        }
    }

    /// Parse the stored name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(Self::Available),
            "consumed" => Some(Self::Consumed),
            _ => None,
        }
    }
}

/// Provenance and authorization of one issued key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Issued key id
    #[serde(rename = "key_ID")]
    pub key_id: KeyId,
    /// Retrieval state
    #[serde(default = "default_status")]
    pub status: LedgerStatus,
    /// SAE that requested the key
    #[serde(rename = "master_SAE_ID")]
    pub master_sae_id: SaeId,
    /// SAE allowed to retrieve it by id
    #[serde(rename = "slave_SAE_ID")]
    pub slave_sae_id: SaeId,
    /// Key length in bytes
    #[serde(rename = "num_bytes")]
    pub total_bytes: u64,
    /// Channel direction of the source epochs
    pub channel: String,
    /// Source range per epoch
    #[serde(rename = "ledger_dict")]
    pub provenance: BTreeMap<EpochId, ByteRange>,
}

fn default_status() -> LedgerStatus {
    LedgerStatus::Available
}

impl LedgerEntry {
    /// Check the structural invariants of an entry
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: String| Err(KmeError::invalid(format!("ledger {}: {what}", self.key_id)));

        if self.key_id.as_str().is_empty() {
            return invalid("empty key id".to_string());
        }
        if self.master_sae_id.is_empty() || self.slave_sae_id.is_empty() {
            return invalid("missing SAE id".to_string());
        }
        if self.channel.is_empty() || self.channel.contains('/') {
            return invalid("bad channel".to_string());
        }
        if self.provenance.is_empty() {
            return invalid("no provenance".to_string());
        }
        for (epoch, range) in &self.provenance {
            if range.start > range.end {
                return invalid(format!("range for epoch {epoch} ends before it starts"));
            }
        }

        let covered = self
            .provenance
            .values()
            .try_fold(0u64, |total, range| total.checked_add(range.len()))
            .ok_or_else(|| KmeError::invalid(format!("ledger {}: ranges overflow", self.key_id)))?;
        if covered != self.total_bytes {
            return invalid(format!(
                "ranges cover {covered} bytes but the key has {}",
                self.total_bytes
            ));
        }
        Ok(())
    }

    /// True when `master`/`slave` is the pair the key was issued to
    pub fn is_authorized(&self, master: &str, slave: &str) -> bool {
        self.master_sae_id == master && self.slave_sae_id == slave
    }
}

/// Replication request body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBatch {
    /// Entries to replicate
    pub ledgers: Vec<LedgerEntry>,
}

/// One echoed key id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIdItem {
    /// Key id
    #[serde(rename = "key_ID")]
    pub key_id: KeyId,
}

/// Replication response body: the key ids the receiver accepted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIdList {
    /// Accepted key ids
    #[serde(rename = "key_IDs")]
    pub key_ids: Vec<KeyIdItem>,
}

impl KeyIdList {
    /// Wrap a list of ids
    pub fn new(ids: impl IntoIterator<Item = KeyId>) -> Self {
        Self {
            key_ids: ids.into_iter().map(|key_id| KeyIdItem { key_id }).collect(),
        }
    }

    /// The ids in order
    pub fn into_ids(self) -> Vec<KeyId> {
        self.key_ids.into_iter().map(|item| item.key_id).collect()
    }
}
