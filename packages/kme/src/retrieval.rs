//! Re-deriving issued keys from their ledger entries
//!
//! Retrieval reads exactly the recorded ranges from the epochs' current
//! content and zeroes those ranges in place. Nothing outside a range is ever
//! modified, so ranges carved from the same epoch for different keys can be
//! retrieved independently.

use crate::allocator::{Allocator, Claim};
use crate::epoch::{EpochRecord, EpochStore};
use crate::error::{KmeError, Result};
use crate::ledger::{LedgerEntry, LedgerStatus, LedgerStore};
use crate::types::{EpochId, KeyId, KeyRecord};
use futures::future::try_join_all;
use log::{debug, warn};
use qkme_common::LoggingTransformer;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use zeroize::{Zeroize, Zeroizing};

/// Consumes ledger-recorded ranges to rebuild keys by id
#[derive(Clone)]
pub struct RetrievalEngine {
    ledger: LedgerStore,
    allocator: Allocator,
    epochs: EpochStore,
}

impl RetrievalEngine {
    /// Engine over the given ledger, allocator and epoch access
    pub fn new(ledger: LedgerStore, allocator: Allocator, epochs: EpochStore) -> Self {
        Self {
            ledger,
            allocator,
            epochs,
        }
    }

    /// Rebuild the keys of `key_ids`, in request order, for the SAE pair
    /// `master`/`slave`.
    ///
    /// Unknown ids are reported together as one [`KmeError::NotFound`] and
    /// already consumed ids as one [`KmeError::NotAvailable`].
    pub async fn retrieve(&self, key_ids: &[KeyId], master: &str, slave: &str) -> Result<Vec<KeyRecord>> {
        if key_ids.is_empty() {
            return Err(KmeError::invalid("no key ids requested"));
        }
        let mut unique = HashSet::new();
        if let Some(duplicate) = key_ids.iter().find(|id| !unique.insert(*id)) {
            return Err(KmeError::invalid(format!("key id {duplicate} requested twice")));
        }

        let lookups = try_join_all(key_ids.iter().map(|id| self.ledger.lookup(id))).await?;

        let missing: Vec<String> = key_ids
            .iter()
            .zip(&lookups)
            .filter(|(_, found)| found.is_none())
            .map(|(id, _)| id.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(KmeError::NotFound { key_ids: missing });
        }
        let entries: Vec<(LedgerEntry, u64)> = lookups.into_iter().flatten().collect();

        if let Some((entry, _)) = entries.iter().find(|(e, _)| !e.is_authorized(master, slave)) {
            LoggingTransformer::log_auth_failure("fetch_by_ids", master);
            return Err(KmeError::Unauthorized(format!(
                "key {} was not issued to this SAE pair",
                entry.key_id
            )));
        }

        let unavailable: Vec<String> = entries
            .iter()
            .filter(|(e, _)| e.status != LedgerStatus::Available)
            .map(|(e, _)| e.key_id.to_string())
            .collect();
        if !unavailable.is_empty() {
            return Err(KmeError::NotAvailable { key_ids: unavailable });
        }

        let channel = entries[0].0.channel.clone();
        if entries.iter().any(|(e, _)| e.channel != channel) {
            return Err(KmeError::invalid("requested keys span more than one channel"));
        }
        for (entry, _) in &entries {
            entry.validate().map_err(|e| {
                KmeError::internal(format!("stored ledger entry is inconsistent: {e}"))
            })?;
        }

        let epoch_ids: BTreeSet<EpochId> = entries
            .iter()
            .flat_map(|(e, _)| e.provenance.keys().cloned())
            .collect();
        let mut claim = self.allocator.claim_epochs(&channel, &epoch_ids).await?;

        match self.consume(&mut claim, &entries).await {
            Ok(keys) => {
                claim.release().await?;
                LoggingTransformer::log_key_retrieval(keys.len(), master, slave);
                Ok(keys)
            }
            Err(err) => {
                if let Err(release_err) = claim.release().await {
                    warn!("Release after failed retrieval also failed: {release_err}");
                }
                Err(err)
            }
        }
    }

    /// Re-read every entry now that the claim excludes other retrievals of
    /// the same epochs. An entry consumed since the first read is reported
    /// as not available.
    async fn recheck(&self, entries: &[(LedgerEntry, u64)]) -> Result<Vec<(LedgerEntry, u64)>> {
        let current =
            try_join_all(entries.iter().map(|(entry, _)| self.ledger.lookup(&entry.key_id))).await?;

        let mut fresh = Vec::with_capacity(entries.len());
        let mut unavailable = Vec::new();
        for ((requested, _), found) in entries.iter().zip(current) {
            match found {
                Some((entry, version))
                    if entry.status == LedgerStatus::Available
                        && entry.provenance == requested.provenance =>
                {
                    fresh.push((entry, version))
                }
                _ => unavailable.push(requested.key_id.to_string()),
            }
        }
        if !unavailable.is_empty() {
            return Err(KmeError::NotAvailable { key_ids: unavailable });
        }
        Ok(fresh)
    }

    async fn consume(&self, claim: &mut Claim, requested: &[(LedgerEntry, u64)]) -> Result<Vec<KeyRecord>> {
        let entries = self.recheck(requested).await?;
        let channel = claim.channel().to_string();
        let records = self.epochs.fetch_all(&channel, claim.plan().keys()).await?;
        let mut epochs: BTreeMap<EpochId, EpochRecord> =
            records.into_iter().map(|r| (r.id.clone(), r)).collect();

        let remaining = remaining_counts(claim, &epochs, &entries)?;

        // Once an entry is consumed its bytes can never be handed out again,
        // so the flips go first. A batch that cannot flip completely is
        // reverted before any epoch is touched.
        let mut flipped = Vec::with_capacity(entries.len());
        for (entry, version) in &entries {
            match self.ledger.mark_consumed(entry, *version).await {
                Ok(consumed_at) => flipped.push((entry.clone(), consumed_at)),
                Err(err) => {
                    self.ledger.revert_consumed(&flipped).await;
                    return Err(err);
                }
            }
        }

        let mut keys = Vec::with_capacity(entries.len());
        for (entry, _) in &entries {
            let mut key = Zeroizing::new(Vec::with_capacity(entry.total_bytes as usize));
            for (epoch_id, range) in &entry.provenance {
                if let Some(epoch) = epochs.get_mut(epoch_id) {
                    let (start, end) = (range.start as usize, range.end as usize);
                    key.extend_from_slice(&epoch.content[start..end]);
                    epoch.content[start..end].zeroize();
                }
            }
            keys.push(KeyRecord {
                key_id: entry.key_id.clone(),
                key,
            });
        }

        let digester = self.epochs.integrity().digester();
        for (epoch_id, left) in &remaining {
            if *left == 0 {
                self.epochs.remove(&channel, epoch_id).await?;
                debug!("Epoch {epoch_id} on {channel} fully retrieved; removed");
            } else if let Some(epoch) = epochs.get_mut(epoch_id) {
                epoch.reseal(digester)?;
                self.epochs.persist(epoch).await?;
            }
            claim.set_count(epoch_id, *left)?;
        }

        Ok(keys)
    }
}

/// Check every range against the fetched content and work out the bytes
/// each touched epoch keeps outstanding once the batch is retrieved
fn remaining_counts(
    claim: &Claim,
    epochs: &BTreeMap<EpochId, EpochRecord>,
    entries: &[(LedgerEntry, u64)],
) -> Result<BTreeMap<EpochId, u64>> {
    let mut used: BTreeMap<EpochId, u64> = BTreeMap::new();
    for (entry, _) in entries {
        for (epoch_id, range) in &entry.provenance {
            let epoch = epochs.get(epoch_id).ok_or_else(|| {
                KmeError::internal(format!("epoch {epoch_id} was not fetched"))
            })?;
            if range.end > epoch.content.len() as u64 {
                return Err(KmeError::internal(format!(
                    "range {}..{} of key {} exceeds epoch {epoch_id} of {} bytes",
                    range.start,
                    range.end,
                    entry.key_id,
                    epoch.content.len()
                )));
            }
            let total = used.entry(epoch_id.clone()).or_insert(0);
            *total = total.checked_add(range.len()).ok_or_else(|| {
                KmeError::internal(format!("byte count of epoch {epoch_id} overflows"))
            })?;
        }
    }

    used.into_iter()
        .map(|(epoch_id, used)| {
            let held = claim.plan().get(&epoch_id).copied().unwrap_or(0);
            let left = held.checked_sub(used).ok_or_else(|| {
                KmeError::internal(format!(
                    "epoch {epoch_id} had {held} bytes outstanding but {used} were requested"
                ))
            })?;
            Ok((epoch_id, left))
        })
        .collect()
}
