//! Epoch records and their persistence
//!
//! An epoch is the atomic unit of stored raw key material. It is created once
//! by the producer, shrinks from the end as keys are carved out of it on the
//! issuing side, has sub-ranges zeroed in place on the receiving side, and is
//! deleted once nothing in it remains to hand out.

use crate::digest::{Digester, IntegrityChecker};
use crate::error::{KmeError, Result};
use crate::paths::StorePaths;
use crate::types::EpochId;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::try_join_all;
use log::debug;
use qkme_store::{Fields, SecretStore, StoreError, ABSENT_VERSION};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use zeroize::Zeroizing;

const FIELD_KEY: &str = "key";
const FIELD_DIGEST: &str = "digest";
const FIELD_BYTES: &str = "bytes";
const FIELD_EPOCH: &str = "epoch";

/// One epoch of key material as read from the store
pub struct EpochRecord {
    /// Epoch ordinal
    pub id: EpochId,
    /// Channel direction the epoch belongs to
    pub channel: String,
    /// Raw key material
    pub content: Zeroizing<Vec<u8>>,
    /// Hex HMAC of `content`
    pub digest: String,
    /// Store version the record was read at
    pub version: u64,
}

impl std::fmt::Debug for EpochRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochRecord")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("len", &self.content.len())
            .field("version", &self.version)
            .finish()
    }
}

impl EpochRecord {
    /// A new, not yet stored epoch sealed with `digester`
    pub fn new(
        channel: impl Into<String>,
        id: EpochId,
        content: Vec<u8>,
        digester: &Digester,
    ) -> Result<Self> {
        let digest = digester.digest_hex(&content)?;
        Ok(Self {
            id,
            channel: channel.into(),
            content: Zeroizing::new(content),
            digest,
            version: ABSENT_VERSION,
        })
    }

    /// Number of bytes currently held
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// True once every byte has been carved out
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Replace the content and recompute the digest
    pub fn replace_content(&mut self, content: Vec<u8>, digester: &Digester) -> Result<()> {
        self.digest = digester.digest_hex(&content)?;
        self.content = Zeroizing::new(content);
        Ok(())
    }

    /// Recompute the digest after in-place edits of `content`
    pub fn reseal(&mut self, digester: &Digester) -> Result<()> {
        self.digest = digester.digest_hex(&self.content)?;
        Ok(())
    }

    fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(
            FIELD_KEY.to_string(),
            Value::String(STANDARD.encode(self.content.as_slice())),
        );
        fields.insert(FIELD_DIGEST.to_string(), Value::String(self.digest.clone()));
        fields.insert(FIELD_BYTES.to_string(), Value::from(self.content.len()));
        fields.insert(FIELD_EPOCH.to_string(), Value::String(self.id.to_string()));
        fields
    }

    fn from_fields(channel: &str, id: &EpochId, fields: &Fields, version: u64) -> Result<Self> {
        let malformed = |what: &str| {
            KmeError::internal(format!("epoch {id} on {channel} is malformed: {what}"))
        };

        let encoded = fields
            .get(FIELD_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing key"))?;
        let content = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|_| malformed("key is not base64"))?,
        );
        let digest = fields
            .get(FIELD_DIGEST)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing digest"))?
            .to_string();

        Ok(Self {
            id: id.clone(),
            channel: channel.to_string(),
            content,
            digest,
            version,
        })
    }
}

/// Reads, verifies, writes and removes epoch records
#[derive(Clone)]
pub struct EpochStore {
    store: Arc<dyn SecretStore>,
    paths: StorePaths,
    integrity: Arc<IntegrityChecker>,
}

impl EpochStore {
    /// Epoch access over `store`
    pub fn new(
        store: Arc<dyn SecretStore>,
        paths: StorePaths,
        integrity: Arc<IntegrityChecker>,
    ) -> Self {
        Self {
            store,
            paths,
            integrity,
        }
    }

    /// The integrity checker guarding reads
    pub fn integrity(&self) -> &IntegrityChecker {
        &self.integrity
    }

    /// Fetch and verify one epoch. A missing record means the status index
    /// and the store have diverged.
    pub async fn fetch(&self, channel: &str, id: &EpochId) -> Result<EpochRecord> {
        self.try_fetch(channel, id).await?.ok_or_else(|| {
            KmeError::internal(format!("epoch {id} on {channel} is indexed but not stored"))
        })
    }

    /// Fetch and verify one epoch, `None` when it is not stored
    pub async fn try_fetch(&self, channel: &str, id: &EpochId) -> Result<Option<EpochRecord>> {
        let path = self.paths.epoch(channel, id);
        let Some(doc) = self.store.get(&path).await? else {
            return Ok(None);
        };

        let record = EpochRecord::from_fields(channel, id, &doc.fields, doc.version)?;
        self.integrity
            .verify(channel, id, &record.content, &record.digest)
            .await?;
        Ok(Some(record))
    }

    /// Fetch the stored subset of `ids` with the byte count of every id,
    /// zero for one that is no longer stored
    pub async fn fetch_stored<'a, I>(
        &self,
        channel: &str,
        ids: I,
    ) -> Result<(Vec<EpochRecord>, BTreeMap<EpochId, u64>)>
    where
        I: IntoIterator<Item = &'a EpochId>,
    {
        let ids: Vec<&EpochId> = ids.into_iter().collect();
        let found = try_join_all(ids.iter().map(|id| self.try_fetch(channel, id))).await?;

        let mut stored = BTreeMap::new();
        let mut records = Vec::with_capacity(found.len());
        for (id, record) in ids.into_iter().zip(found) {
            match record {
                Some(record) => {
                    stored.insert(id.clone(), record.len() as u64);
                    records.push(record);
                }
                None => {
                    stored.insert(id.clone(), 0);
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok((records, stored))
    }

    /// Fetch and verify several epochs concurrently, ordered by epoch id
    pub async fn fetch_all<'a, I>(&self, channel: &str, ids: I) -> Result<Vec<EpochRecord>>
    where
        I: IntoIterator<Item = &'a EpochId>,
    {
        let mut records = try_join_all(ids.into_iter().map(|id| self.fetch(channel, id))).await?;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        debug!("Fetched {} epoch(s) on {channel}", records.len());
        Ok(records)
    }

    /// Create a new epoch; fails if one already exists under the same id
    pub async fn create(&self, record: &mut EpochRecord) -> Result<()> {
        let path = self.paths.epoch(&record.channel, &record.id);
        let version = self
            .store
            .put(&path, record.to_fields(), ABSENT_VERSION)
            .await
            .map_err(|err| match err {
                StoreError::VersionConflict { .. } => KmeError::invalid(format!(
                    "epoch {} already exists on {}",
                    record.id, record.channel
                )),
                other => other.into(),
            })?;
        record.version = version;
        self.integrity
            .remember(&record.channel, &record.id, &record.digest)
            .await
    }

    /// Write back a modified epoch at the version it was read at
    pub async fn persist(&self, record: &mut EpochRecord) -> Result<()> {
        let path = self.paths.epoch(&record.channel, &record.id);
        let version = self
            .store
            .put(&path, record.to_fields(), record.version)
            .await
            .map_err(|err| match err {
                StoreError::VersionConflict { .. } => KmeError::internal(format!(
                    "epoch {} on {} changed while reserved",
                    record.id, record.channel
                )),
                other => other.into(),
            })?;
        record.version = version;
        self.integrity
            .remember(&record.channel, &record.id, &record.digest)
            .await
    }

    /// Delete an epoch and its cached digest
    pub async fn remove(&self, channel: &str, id: &EpochId) -> Result<()> {
        self.store
            .delete_all_versions(&self.paths.epoch(channel, id))
            .await?;
        self.integrity.forget(channel, id).await
    }
}
