//! Admission of new epochs into the pool
//!
//! The producer writes the epoch record first and only then publishes it in
//! the channel's status index, so an indexed epoch is always readable.

use crate::config::AllocatorSettings;
use crate::digest::IntegrityChecker;
use crate::epoch::{EpochRecord, EpochStore};
use crate::error::{KmeError, Result};
use crate::paths::StorePaths;
use crate::status_index::{SlotState, StatusIndex};
use crate::types::EpochId;
use log::info;
use qkme_store::{compare_and_swap_update, CasStep, SecretStore};
use std::sync::Arc;

/// Publishes freshly distilled key material as epochs
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn SecretStore>,
    paths: StorePaths,
    epochs: EpochStore,
    integrity: Arc<IntegrityChecker>,
    cas_max_attempts: u32,
}

impl Producer {
    /// Producer writing through `epochs` and indexing into `store`
    pub fn new(
        store: Arc<dyn SecretStore>,
        paths: StorePaths,
        epochs: EpochStore,
        integrity: Arc<IntegrityChecker>,
        settings: &AllocatorSettings,
    ) -> Self {
        Self {
            store,
            paths,
            epochs,
            integrity,
            cas_max_attempts: settings.cas_max_attempts,
        }
    }

    /// Store `content` as epoch `epoch_id` of `channel` and mark all of its
    /// bytes free. Returns the number of bytes published.
    pub async fn publish(&self, channel: &str, epoch_id: &EpochId, content: Vec<u8>) -> Result<u64> {
        if channel.is_empty() || channel.contains('/') {
            return Err(KmeError::invalid(format!("bad channel name '{channel}'")));
        }
        let name = epoch_id.as_str();
        if name.is_empty() || name.contains('/') || StorePaths::is_reserved_name(name) {
            return Err(KmeError::invalid(format!("'{epoch_id}' cannot be used as an epoch id")));
        }
        if content.is_empty() {
            return Err(KmeError::invalid("epoch content is empty"));
        }

        let bytes = content.len() as u64;
        let mut record = EpochRecord::new(channel, epoch_id.clone(), content, self.integrity.digester())?;
        self.epochs.create(&mut record).await?;

        let path = self.paths.status(channel);
        compare_and_swap_update::<_, _, KmeError, _>(self.store.as_ref(), &path, self.cas_max_attempts, |doc| {
            let mut index = StatusIndex::from_document(doc)?;
            if index.get(epoch_id).is_some() {
                return Err(KmeError::internal(format!(
                    "epoch {epoch_id} is already indexed on {channel}"
                )));
            }
            index.set(epoch_id.clone(), SlotState::Free(bytes));
            Ok(CasStep::Write(index.to_fields()?, ()))
        })
        .await?;

        info!("Published epoch {epoch_id} on {channel} with {bytes} bytes");
        Ok(bytes)
    }
}
