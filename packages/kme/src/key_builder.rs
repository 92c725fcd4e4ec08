//! Carving keys out of claimed epochs
//!
//! Each key walks the epochs in ascending order. An epoch smaller than what
//! the key still needs is consumed whole; otherwise the key takes the epoch's
//! last bytes and the epoch keeps its first bytes. Taking from the end keeps
//! every recorded range valid against the epoch's original layout, which is
//! what the peer holds.

use crate::digest::Digester;
use crate::epoch::EpochRecord;
use crate::error::{KmeError, Result};
use crate::ledger::ByteRange;
use crate::paths::StorePaths;
use crate::types::{EpochId, KeyId, KeyRecord};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

/// A key together with the epoch ranges it was built from
#[derive(Debug)]
pub struct BuiltKey {
    /// The key handed to the caller
    pub record: KeyRecord,
    /// Source range per epoch
    pub provenance: BTreeMap<EpochId, ByteRange>,
}

/// Keys built from one claim and the epochs they changed
#[derive(Debug)]
pub struct BuildOutput {
    /// Keys in build order
    pub keys: Vec<BuiltKey>,
    /// Epochs whose content changed
    pub touched: BTreeSet<EpochId>,
}

/// Builds keys and their provenance from epoch content
#[derive(Debug)]
pub struct KeyBuilder<'a> {
    paths: &'a StorePaths,
    digester: &'a Digester,
}

impl<'a> KeyBuilder<'a> {
    /// Builder naming epochs by their store path and sealing with `digester`
    pub fn new(paths: &'a StorePaths, digester: &'a Digester) -> Self {
        Self { paths, digester }
    }

    /// Build `count` keys of `size_bytes` each from `epochs`, which must be in
    /// ascending epoch order. Shrinks the epochs in place and reseals every
    /// epoch left non-empty.
    pub fn build(
        &self,
        epochs: &mut [EpochRecord],
        count: usize,
        size_bytes: usize,
    ) -> Result<BuildOutput> {
        if size_bytes == 0 {
            return Err(KmeError::invalid("key size must be positive"));
        }
        if epochs.windows(2).any(|pair| pair[0].id >= pair[1].id) {
            return Err(KmeError::internal("epochs must be in ascending order"));
        }

        let mut keys = Vec::with_capacity(count);
        let mut touched = BTreeSet::new();
        for _ in 0..count {
            keys.push(self.build_one(epochs, size_bytes, &mut touched)?);
        }

        for epoch in epochs.iter_mut() {
            if touched.contains(&epoch.id) && !epoch.is_empty() {
                epoch.reseal(self.digester)?;
            }
        }

        Ok(BuildOutput { keys, touched })
    }

    fn build_one(
        &self,
        epochs: &mut [EpochRecord],
        size_bytes: usize,
        touched: &mut BTreeSet<EpochId>,
    ) -> Result<BuiltKey> {
        let mut remaining = size_bytes;
        let mut key = Zeroizing::new(Vec::with_capacity(size_bytes));
        let mut provenance = BTreeMap::new();
        let mut name = String::new();

        for epoch in epochs.iter_mut() {
            if remaining == 0 {
                break;
            }
            let held = epoch.content.len();
            if held == 0 {
                continue;
            }

            let taken = remaining.min(held);
            let start = held - taken;
            key.extend_from_slice(&epoch.content[start..held]);
            epoch.content[start..held].zeroize();
            epoch.content.truncate(start);

            provenance.insert(
                epoch.id.clone(),
                ByteRange {
                    start: start as u64,
                    end: held as u64,
                },
            );
            name.push_str(&format!(
                "{}/{held}/{taken}",
                self.paths.epoch(&epoch.channel, &epoch.id)
            ));
            touched.insert(epoch.id.clone());
            remaining -= taken;
        }

        if remaining > 0 {
            return Err(KmeError::internal(format!(
                "claimed epochs ran out with {remaining} of {size_bytes} key bytes still needed"
            )));
        }

        Ok(BuiltKey {
            record: KeyRecord {
                key_id: derive_key_id(&name),
                key,
            },
            provenance,
        })
    }
}

/// Key id derived from the build plan: a UUIDv5 in the URL namespace over the
/// concatenated `<epoch path>/<bytes held>/<bytes taken>` steps
pub fn derive_key_id(plan_name: &str) -> KeyId {
    KeyId::new(Uuid::new_v5(&Uuid::NAMESPACE_URL, plan_name.as_bytes()).to_string())
}
