//! Receiving side of ledger replication

use super::{LedgerBatch, LedgerStatus, LedgerStore};
use crate::error::{KmeError, Result};
use crate::types::KeyId;
use log::{info, warn};
use qkme_common::LoggingTransformer;
use std::collections::BTreeSet;

/// Accepts ledger entries replicated by the peer KME
#[derive(Clone)]
pub struct LedgerReceiver {
    ledger: LedgerStore,
    remote_kme_id: String,
    max_key_bytes: u64,
}

impl LedgerReceiver {
    /// Receiver accepting entries from `remote_kme_id` only, for keys of at
    /// most `max_key_bytes`
    pub fn new(ledger: LedgerStore, remote_kme_id: impl Into<String>, max_key_bytes: u64) -> Self {
        Self {
            ledger,
            remote_kme_id: remote_kme_id.into(),
            max_key_bytes,
        }
    }

    /// Store replicated entries and return the key ids accepted.
    ///
    /// The whole batch is refused when the sender is not the configured peer
    /// or any entry is malformed. A duplicate of an entry still at its initial
    /// version is reset to `available`; a duplicate of an entry that has
    /// advanced is rejected and left out of the echo.
    pub async fn accept(&self, sender_kme_id: &str, batch: LedgerBatch) -> Result<Vec<KeyId>> {
        if sender_kme_id != self.remote_kme_id {
            LoggingTransformer::log_auth_failure("ledger replication", sender_kme_id);
            return Err(KmeError::Unauthorized(format!(
                "KME '{sender_kme_id}' is not the configured peer"
            )));
        }

        let mut seen = BTreeSet::new();
        for entry in &batch.ledgers {
            if entry.total_bytes > self.max_key_bytes {
                return Err(KmeError::invalid(format!(
                    "replicated ledger {} holds {} bytes, at most {} allowed",
                    entry.key_id, entry.total_bytes, self.max_key_bytes
                )));
            }
            entry.validate()?;
            if entry.status != LedgerStatus::Available {
                return Err(KmeError::invalid(format!(
                    "replicated ledger {} is not available",
                    entry.key_id
                )));
            }
            if !seen.insert(entry.key_id.clone()) {
                return Err(KmeError::invalid(format!(
                    "ledger {} appears twice in one batch",
                    entry.key_id
                )));
            }
        }

        let mut accepted = Vec::with_capacity(batch.ledgers.len());
        for entry in &batch.ledgers {
            match self.ledger.commit(entry).await {
                Ok(()) => accepted.push(entry.key_id.clone()),
                Err(KmeError::DuplicateKeyId(_)) => {
                    if self.ledger.reset_replicated(entry).await? {
                        info!("Reset replicated ledger entry {} to available", entry.key_id);
                        accepted.push(entry.key_id.clone());
                    }
                }
                Err(other) => return Err(other),
            }
        }

        if accepted.len() != batch.ledgers.len() {
            warn!(
                "Accepted {} of {} replicated ledger entries from {sender_kme_id}",
                accepted.len(),
                batch.ledgers.len()
            );
        }
        Ok(accepted)
    }
}
