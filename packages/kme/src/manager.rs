//! Key management facade
//!
//! [`KeyManager`] wires the allocator, key builder, ledger and retrieval
//! engine together and exposes the three operations the SAE-facing layer
//! calls: issuing new keys, retrieving keys by id and reporting pool status.

use crate::allocator::{Allocator, Claim};
use crate::config::{validate_entity_id, KmeConfig, StoreBackend};
use crate::digest::{DigestCache, FileDigestCache, IntegrityChecker, MemoryDigestCache};
use crate::epoch::{EpochRecord, EpochStore};
use crate::error::{KmeError, Result};
use crate::key_builder::KeyBuilder;
use crate::ledger::{HttpLedgerPeer, LedgerEntry, LedgerReceiver, LedgerStatus, LedgerStore, LedgerSync};
use crate::paths::StorePaths;
use crate::producer::Producer;
use crate::retrieval::RetrievalEngine;
use crate::types::{EpochId, KeyId, KeyRecord};
use log::{debug, info, warn};
use qkme_common::LoggingTransformer;
use qkme_store::{MemoryStore, SecretStore, VaultKvStore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Claims tried before giving up when stale counts keep shrinking them
const CLAIM_ATTEMPTS: u32 = 3;

/// Snapshot of the issuing channel's pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Channel keys are issued from
    pub channel: String,
    /// Unclaimed bytes
    pub free_bytes: u64,
    /// Bytes held by live or expired reservations
    pub reserved_bytes: u64,
    /// Epochs in the status index
    pub epoch_count: usize,
    /// Epochs currently reserved
    pub reserved_epochs: usize,
    /// Keys of the default size the free bytes could still produce
    pub stored_key_count: u64,
    /// Default key size in bits
    pub key_size: u32,
    /// Smallest key size in bits
    pub min_key_size: u32,
    /// Largest key size in bits
    pub max_key_size: u32,
    /// Most keys per request
    pub max_key_count: u32,
}

/// Issues, retrieves and accounts for keys on one node
#[derive(Clone)]
pub struct KeyManager {
    config: Arc<KmeConfig>,
    paths: StorePaths,
    allocator: Allocator,
    epochs: EpochStore,
    ledger: LedgerStore,
    retrieval: RetrievalEngine,
    receiver: LedgerReceiver,
    producer: Producer,
    sync: LedgerSync,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("local_kme_id", &self.config.local_kme_id)
            .field("issue_channel", &self.config.issue_channel)
            .field("replication", &self.sync.is_enabled())
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Manager over an already connected store and digest cache
    pub fn new(
        config: KmeConfig,
        store: Arc<dyn SecretStore>,
        cache: Arc<dyn DigestCache>,
        sync: LedgerSync,
    ) -> Self {
        let paths = StorePaths::from_settings(&config.store);
        let integrity = Arc::new(IntegrityChecker::new(&config.digest, cache));
        let epochs = EpochStore::new(store.clone(), paths.clone(), integrity.clone());
        let allocator = Allocator::new(store.clone(), paths.clone(), config.allocator.clone());
        let ledger = LedgerStore::new(store.clone(), paths.clone());
        let retrieval = RetrievalEngine::new(ledger.clone(), allocator.clone(), epochs.clone());
        let receiver = LedgerReceiver::new(
            ledger.clone(),
            config.remote_kme_id.clone(),
            config.keys.max_key_bytes(),
        );
        let producer = Producer::new(
            store,
            paths.clone(),
            epochs.clone(),
            integrity,
            &config.allocator,
        );

        Self {
            config: Arc::new(config),
            paths,
            allocator,
            epochs,
            ledger,
            retrieval,
            receiver,
            producer,
            sync,
        }
    }

    /// Connect the configured store backend, digest cache and peer
    pub async fn connect(config: KmeConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn SecretStore> = match config.store.backend {
            StoreBackend::Vault => {
                Arc::new(VaultKvStore::connect(config.store.vault_kv_config()).await?)
            }
            StoreBackend::Memory => {
                warn!("Using the in-memory store; key material is lost on exit");
                Arc::new(MemoryStore::new())
            }
        };

        let cache: Arc<dyn DigestCache> = match &config.digest.cache_dir {
            Some(dir) => Arc::new(FileDigestCache::new(dir.clone())),
            None => Arc::new(MemoryDigestCache::new()),
        };

        let sync = match &config.peer {
            Some(peer) => {
                let peer = HttpLedgerPeer::connect(peer, &config.local_kme_id).await?;
                LedgerSync::new(Arc::new(peer))
            }
            None => {
                info!("No peer KME configured; ledger replication disabled");
                LedgerSync::standalone()
            }
        };

        Ok(Self::new(config, store, cache, sync))
    }

    /// The node configuration
    pub fn config(&self) -> &KmeConfig {
        &self.config
    }

    /// Receiving side of ledger replication
    pub fn receiver(&self) -> &LedgerReceiver {
        &self.receiver
    }

    /// Epoch admission
    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Claim/release over the status index
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Ledger access
    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    /// Issue `count` keys of `size_bytes` each to `master`, retrievable by
    /// `slave` on the peer.
    ///
    /// Local ledger and epoch changes are durable before replication starts.
    /// A replication failure is returned after the claim has been released.
    pub async fn fetch_keys(
        &self,
        count: usize,
        size_bytes: u64,
        master: &str,
        slave: &str,
    ) -> Result<Vec<KeyRecord>> {
        let started = Instant::now();
        self.check_request(count, size_bytes, master, slave)?;

        let channel = self.config.issue_channel.clone();
        let requested = size_bytes
            .checked_mul(count as u64)
            .ok_or_else(|| KmeError::invalid("requested byte total overflows"))?;
        let (mut claim, records) = self.claim_material(&channel, requested).await?;

        let issued = match self
            .issue(&mut claim, records, count, size_bytes as usize, master, slave)
            .await
        {
            Ok(issued) => {
                claim.release().await?;
                issued
            }
            Err(err) => {
                if let Err(release_err) = claim.release().await {
                    warn!("Release after failed issue also failed: {release_err}");
                }
                LoggingTransformer::log_performance_metric(
                    "fetch_keys",
                    started.elapsed().as_millis() as u64,
                    false,
                );
                return Err(err);
            }
        };

        let (keys, entries) = issued;
        LoggingTransformer::log_key_issue(keys.len(), size_bytes as usize, master, slave);
        for key in &keys {
            debug!(
                "Issued key {} ({})",
                key.key_id,
                LoggingTransformer::redact(&key.key, self.config.show_secrets)
            );
        }

        let synced = self.sync.sync(&entries).await;
        LoggingTransformer::log_performance_metric(
            "fetch_keys",
            started.elapsed().as_millis() as u64,
            synced.is_ok(),
        );
        synced?;
        Ok(keys)
    }

    /// Retrieve previously issued keys by id, in request order
    pub async fn fetch_by_ids(&self, key_ids: &[KeyId], master: &str, slave: &str) -> Result<Vec<KeyRecord>> {
        validate_entity_id("master SAE id", master)?;
        validate_entity_id("slave SAE id", slave)?;
        let max = self.config.keys.max_keys_per_request as usize;
        if key_ids.len() > max {
            return Err(KmeError::invalid(format!(
                "{} key ids requested, at most {max} allowed",
                key_ids.len()
            )));
        }
        self.retrieval.retrieve(key_ids, master, slave).await
    }

    /// Pool status of the issuing channel
    pub async fn status(&self) -> Result<PoolStatus> {
        let channel = &self.config.issue_channel;
        let index = self.allocator.index(channel).await?;
        let limits = &self.config.keys;
        let free_bytes = index.free_bytes();
        let key_bytes = limits.default_key_bytes().max(1);

        Ok(PoolStatus {
            channel: channel.clone(),
            free_bytes,
            reserved_bytes: index.reserved_bytes(),
            epoch_count: index.len(),
            reserved_epochs: index.reserved_count(),
            stored_key_count: free_bytes / key_bytes,
            key_size: limits.default_key_size_bits,
            min_key_size: limits.min_key_size_bits,
            max_key_size: limits.max_key_size_bits,
            max_key_count: limits.max_keys_per_request,
        })
    }

    fn check_request(&self, count: usize, size_bytes: u64, master: &str, slave: &str) -> Result<()> {
        validate_entity_id("master SAE id", master)?;
        validate_entity_id("slave SAE id", slave)?;

        let limits = &self.config.keys;
        let max_count = limits.max_keys_per_request as usize;
        if count == 0 || count > max_count {
            return Err(KmeError::invalid(format!(
                "number of keys must be between 1 and {max_count}, got {count}"
            )));
        }
        if size_bytes < limits.min_key_bytes() || size_bytes > limits.max_key_bytes() {
            return Err(KmeError::invalid(format!(
                "key size must be between {} and {} bits, got {}",
                limits.min_key_size_bits,
                limits.max_key_size_bits,
                size_bytes.saturating_mul(8)
            )));
        }
        Ok(())
    }

    /// Claim `requested` bytes and read the claimed epochs. A claim whose
    /// index counts exceed the stored content (a lease taken over from a
    /// holder that stopped mid-issue) is corrected, released and retried.
    async fn claim_material(&self, channel: &str, requested: u64) -> Result<(Claim, Vec<EpochRecord>)> {
        for attempt in 1..=CLAIM_ATTEMPTS {
            let mut claim = self.allocator.claim(channel, requested).await?;
            let checked = match self.epochs.fetch_stored(channel, claim.plan().keys()).await {
                Ok((records, stored)) => claim.reconcile(&stored).map(|_| records),
                Err(err) => Err(err),
            };

            match checked {
                Ok(records) if claim.held_bytes() >= requested => return Ok((claim, records)),
                Ok(_) => {
                    debug!("Claim on {channel} shrank below {requested} bytes (attempt {attempt}/{CLAIM_ATTEMPTS})");
                    claim.release().await?;
                }
                Err(err) => {
                    if let Err(release_err) = claim.release().await {
                        warn!("Release after failed epoch read also failed: {release_err}");
                    }
                    return Err(err);
                }
            }
        }
        Err(KmeError::internal(format!(
            "claims on {channel} kept shrinking below {requested} bytes"
        )))
    }

    async fn issue(
        &self,
        claim: &mut Claim,
        mut records: Vec<EpochRecord>,
        count: usize,
        size_bytes: usize,
        master: &str,
        slave: &str,
    ) -> Result<(Vec<KeyRecord>, Vec<LedgerEntry>)> {
        let channel = claim.channel().to_string();

        let output = KeyBuilder::new(&self.paths, self.epochs.integrity().digester()).build(
            &mut records,
            count,
            size_bytes,
        )?;

        let mut keys = Vec::with_capacity(output.keys.len());
        let mut entries = Vec::with_capacity(output.keys.len());
        for built in output.keys {
            entries.push(LedgerEntry {
                key_id: built.record.key_id.clone(),
                status: LedgerStatus::Available,
                master_sae_id: master.to_string(),
                slave_sae_id: slave.to_string(),
                total_bytes: size_bytes as u64,
                channel: channel.clone(),
                provenance: built.provenance,
            });
            keys.push(built.record);
        }

        self.ledger.commit_all(&entries).await?;

        if let Err(err) = self.write_epochs(claim, &mut records, &output.touched).await {
            warn!("Epoch update failed after ledger commit; rolling back {} entries", entries.len());
            self.ledger.rollback(&entries).await;
            return Err(err);
        }

        Ok((keys, entries))
    }

    /// Persist shrunk epochs and delete exhausted ones, recording each final
    /// count on the claim once the write is durable
    async fn write_epochs(
        &self,
        claim: &mut Claim,
        records: &mut [EpochRecord],
        touched: &BTreeSet<EpochId>,
    ) -> Result<()> {
        for record in records.iter_mut().filter(|r| touched.contains(&r.id)) {
            if record.is_empty() {
                self.epochs.remove(&record.channel, &record.id).await?;
                debug!("Epoch {} on {} exhausted; removed", record.id, record.channel);
            } else {
                self.epochs.persist(record).await?;
            }
            claim.set_count(&record.id, record.len() as u64)?;
        }
        Ok(())
    }
}
