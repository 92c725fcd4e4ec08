//! Shared fixtures for the key management tests
#![allow(dead_code)]

use qkme::config::StoreBackend;
use qkme::ledger::{LedgerBatch, LedgerPeer, LedgerReceiver, PeerRequest};
use qkme::{EpochId, KeyId, KeyManager, KmeConfig, LedgerSync, MemoryDigestCache, StatusIndex};
use qkme_store::{MemoryStore, SecretStore};
use secrecy::SecretString;
use std::sync::Arc;

pub const CHANNEL: &str = "masterslave";
pub const MASTER_SAE: &str = "sae-alice";
pub const SLAVE_SAE: &str = "sae-bob";

/// A node backed by an in-memory store the test can inspect
pub struct Node {
    pub manager: KeyManager,
    pub store: MemoryStore,
    pub cache: MemoryDigestCache,
}

pub fn test_config(local: &str, remote: &str) -> KmeConfig {
    let mut config = KmeConfig::default();
    config.local_kme_id = local.to_string();
    config.remote_kme_id = remote.to_string();
    config.issue_channel = CHANNEL.to_string();
    config.store.backend = StoreBackend::Memory;
    config.digest.key = SecretString::from("test-digest-key".to_string());
    config.allocator.reserve_sleep_ms = 5;
    config.allocator.max_reserve_attempts = 400;
    config
}

pub fn node_with(config: KmeConfig, sync: LedgerSync) -> Node {
    let store = MemoryStore::new();
    let cache = MemoryDigestCache::new();
    let manager = KeyManager::new(config, Arc::new(store.clone()), Arc::new(cache.clone()), sync);
    Node {
        manager,
        store,
        cache,
    }
}

/// Standalone node, no replication
pub fn standalone(local: &str) -> Node {
    node_with(test_config(local, "kme-peer"), LedgerSync::standalone())
}

/// Forwards replicated batches straight into another node's receiver
pub struct LoopbackPeer {
    pub receiver: LedgerReceiver,
    pub sender_kme_id: String,
}

impl LedgerPeer for LoopbackPeer {
    fn describe(&self) -> String {
        format!("loopback from {}", self.sender_kme_id)
    }

    fn push(&self, batch: LedgerBatch) -> PeerRequest<Vec<KeyId>> {
        let receiver = self.receiver.clone();
        let sender = self.sender_kme_id.clone();
        PeerRequest::spawn(async move { receiver.accept(&sender, batch).await })
    }
}

/// Master `kme1` replicating to slave `kme2` in process
pub fn node_pair() -> (Node, Node) {
    let slave = node_with(test_config("kme2", "kme1"), LedgerSync::standalone());
    let peer = LoopbackPeer {
        receiver: slave.manager.receiver().clone(),
        sender_kme_id: "kme1".to_string(),
    };
    let master = node_with(test_config("kme1", "kme2"), LedgerSync::new(Arc::new(peer)));
    (master, slave)
}

/// Deterministic, non-zero filler bytes
pub fn material(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}

/// Publish the same epochs on every node
pub async fn seed(nodes: &[&Node], epochs: &[(&str, Vec<u8>)]) {
    for node in nodes {
        for (id, content) in epochs {
            node.manager
                .producer()
                .publish(CHANNEL, &EpochId::new(*id), content.clone())
                .await
                .unwrap();
        }
    }
}

pub fn status_path() -> String {
    format!("QKDE0001/{CHANNEL}/status")
}

pub fn epoch_path(id: &str) -> String {
    format!("QKDE0001/{CHANNEL}/{id}")
}

pub async fn index(node: &Node) -> StatusIndex {
    node.manager.allocator().index(CHANNEL).await.unwrap()
}

pub async fn status_fields(node: &Node) -> qkme_store::Fields {
    node.store
        .get(&status_path())
        .await
        .unwrap()
        .map(|doc| doc.fields)
        .unwrap_or_default()
}
