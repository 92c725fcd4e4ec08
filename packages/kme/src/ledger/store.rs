//! Durable ledger entries
//!
//! In memory an entry's provenance is a map from epoch to range. In the store
//! it is flattened into `<epoch>_start_index` / `<epoch>_end_index` fields
//! beside the scalar fields.

use super::{ByteRange, LedgerEntry, LedgerStatus};
use crate::error::{KmeError, Result};
use crate::paths::StorePaths;
use crate::types::{EpochId, KeyId};
use log::{debug, error, warn};
use qkme_common::LoggingTransformer;
use qkme_store::{Fields, SecretStore, StoreError, ABSENT_VERSION};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Version of a ledger entry right after its creation
pub const LEDGER_INITIAL_VERSION: u64 = 1;

const FIELD_KEY_ID: &str = "key_ID";
const FIELD_STATUS: &str = "status";
const FIELD_MASTER: &str = "master_SAE_ID";
const FIELD_SLAVE: &str = "slave_SAE_ID";
const FIELD_NUM_BYTES: &str = "num_bytes";
const FIELD_CHANNEL: &str = "channel";
const START_SUFFIX: &str = "_start_index";
const END_SUFFIX: &str = "_end_index";

fn to_fields(entry: &LedgerEntry) -> Fields {
    let mut fields = Fields::new();
    fields.insert(FIELD_KEY_ID.to_string(), Value::from(entry.key_id.as_str()));
    fields.insert(FIELD_STATUS.to_string(), Value::from(entry.status.as_str()));
    fields.insert(FIELD_MASTER.to_string(), Value::from(entry.master_sae_id.as_str()));
    fields.insert(FIELD_SLAVE.to_string(), Value::from(entry.slave_sae_id.as_str()));
    fields.insert(FIELD_NUM_BYTES.to_string(), Value::from(entry.total_bytes));
    fields.insert(FIELD_CHANNEL.to_string(), Value::from(entry.channel.as_str()));
    for (epoch, range) in &entry.provenance {
        fields.insert(format!("{epoch}{START_SUFFIX}"), Value::from(range.start));
        fields.insert(format!("{epoch}{END_SUFFIX}"), Value::from(range.end));
    }
    fields
}

fn from_fields(key_id: &KeyId, fields: &Fields) -> Result<LedgerEntry> {
    let malformed = |what: &str| KmeError::internal(format!("ledger {key_id} is malformed: {what}"));
    let text = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| malformed(name))
    };

    let status = LedgerStatus::parse(&text(FIELD_STATUS)?).ok_or_else(|| malformed(FIELD_STATUS))?;
    let total_bytes = fields
        .get(FIELD_NUM_BYTES)
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed(FIELD_NUM_BYTES))?;

    let mut provenance = BTreeMap::new();
    for (name, value) in fields {
        let Some(epoch) = name.strip_suffix(START_SUFFIX) else {
            continue;
        };
        let start = value.as_u64().ok_or_else(|| malformed(name))?;
        let end = fields
            .get(&format!("{epoch}{END_SUFFIX}"))
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed(&format!("{epoch}{END_SUFFIX}")))?;
        provenance.insert(EpochId::new(epoch), ByteRange { start, end });
    }

    Ok(LedgerEntry {
        key_id: KeyId::new(text(FIELD_KEY_ID)?),
        status,
        master_sae_id: text(FIELD_MASTER)?,
        slave_sae_id: text(FIELD_SLAVE)?,
        total_bytes,
        channel: text(FIELD_CHANNEL)?,
        provenance,
    })
}

/// Reads and writes ledger entries
#[derive(Clone)]
pub struct LedgerStore {
    store: Arc<dyn SecretStore>,
    paths: StorePaths,
}

impl LedgerStore {
    /// Ledger over `store`
    pub fn new(store: Arc<dyn SecretStore>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    /// Write a new entry at the initial version. An existing entry with the
    /// same key id is a [`KmeError::DuplicateKeyId`].
    pub async fn commit(&self, entry: &LedgerEntry) -> Result<()> {
        let path = self.paths.ledger(&entry.key_id);
        match self.store.put(&path, to_fields(entry), ABSENT_VERSION).await {
            Ok(_) => {
                debug!("Committed ledger entry {}", entry.key_id);
                Ok(())
            }
            Err(StoreError::VersionConflict { .. }) => {
                error!("Ledger entry {} already exists", entry.key_id);
                Err(KmeError::DuplicateKeyId(entry.key_id.to_string()))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Commit every entry or none: on failure the entries written so far are
    /// deleted again
    pub async fn commit_all(&self, entries: &[LedgerEntry]) -> Result<()> {
        for (written, entry) in entries.iter().enumerate() {
            if let Err(err) = self.commit(entry).await {
                self.rollback(&entries[..written]).await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Delete entries this node committed but never handed out. Failures are
    /// logged; the entries then stay behind as unreachable records.
    pub async fn rollback(&self, entries: &[LedgerEntry]) {
        for entry in entries {
            let path = self.paths.ledger(&entry.key_id);
            if let Err(e) = self.store.delete_all_versions(&path).await {
                warn!("Failed to roll back ledger entry {}: {e}", entry.key_id);
            }
        }
    }

    /// Entry and its version, `None` when unknown
    pub async fn lookup(&self, key_id: &KeyId) -> Result<Option<(LedgerEntry, u64)>> {
        match self.store.get(&self.paths.ledger(key_id)).await? {
            Some(doc) => Ok(Some((from_fields(key_id, &doc.fields)?, doc.version))),
            None => Ok(None),
        }
    }

    /// Entry of `key_id` if `master`/`slave` is the pair it was issued to
    pub async fn fetch(&self, key_id: &KeyId, master: &str, slave: &str) -> Result<(LedgerEntry, u64)> {
        let (entry, version) = self.lookup(key_id).await?.ok_or_else(|| KmeError::NotFound {
            key_ids: vec![key_id.to_string()],
        })?;
        if !entry.is_authorized(master, slave) {
            LoggingTransformer::log_auth_failure("ledger fetch", master);
            return Err(KmeError::Unauthorized(format!(
                "key {key_id} was not issued to this SAE pair"
            )));
        }
        Ok((entry, version))
    }

    /// Flip an entry to `consumed` at the version it was read at. A moved
    /// version means someone else consumed it first.
    pub async fn mark_consumed(&self, entry: &LedgerEntry, version: u64) -> Result<u64> {
        let mut consumed = entry.clone();
        consumed.status = LedgerStatus::Consumed;

        let path = self.paths.ledger(&entry.key_id);
        self.store
            .put(&path, to_fields(&consumed), version)
            .await
            .map_err(|err| match err {
                StoreError::VersionConflict { .. } => KmeError::NotAvailable {
                    key_ids: vec![entry.key_id.to_string()],
                },
                other => other.into(),
            })
    }

    /// Flip entries consumed by `mark_consumed` back to `available`, each at
    /// the version its flip created. Failures are logged; such an entry stays
    /// consumed.
    pub async fn revert_consumed(&self, flipped: &[(LedgerEntry, u64)]) {
        for (entry, version) in flipped {
            let mut available = entry.clone();
            available.status = LedgerStatus::Available;
            let path = self.paths.ledger(&entry.key_id);
            match self.store.put(&path, to_fields(&available), *version).await {
                Ok(_) => debug!("Reverted ledger entry {} to available", entry.key_id),
                Err(e) => error!("Failed to revert ledger entry {}: {e}", entry.key_id),
            }
        }
    }

    /// Reset a replicated entry that already exists locally back to
    /// `available`. Allowed only while the local copy is still at the initial
    /// version and describes the same key; returns whether the reset happened.
    pub async fn reset_replicated(&self, entry: &LedgerEntry) -> Result<bool> {
        let Some((existing, version)) = self.lookup(&entry.key_id).await? else {
            self.commit(entry).await?;
            return Ok(true);
        };

        if version != LEDGER_INITIAL_VERSION {
            warn!(
                "Rejecting replay of ledger entry {} at version {version}",
                entry.key_id
            );
            return Ok(false);
        }

        let mut reset = existing.clone();
        reset.status = entry.status;
        if reset != *entry {
            warn!(
                "Rejecting replicated ledger entry {}: differs from the local copy",
                entry.key_id
            );
            return Ok(false);
        }

        if existing.status == LedgerStatus::Available {
            return Ok(true);
        }
        reset.status = LedgerStatus::Available;
        let path = self.paths.ledger(&entry.key_id);
        match self.store.put(&path, to_fields(&reset), version).await {
            Ok(_) => Ok(true),
            Err(StoreError::VersionConflict { .. }) => {
                warn!("Ledger entry {} changed during replication reset", entry.key_id);
                Ok(false)
            }
            Err(other) => Err(other.into()),
        }
    }
}
