//! Key issuance through the manager

mod common;

use common::*;
use qkme::ledger::{LedgerPeer, PeerRequest};
use qkme::{
    ByteRange, EpochId, EpochStore, IntegrityChecker, KeyId, KmeError, LedgerBatch, LedgerStatus,
    LedgerSync, SlotState, StorePaths,
};
use qkme_store::SecretStore;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn test_key_spanning_two_epochs_takes_all_of_first_and_tail_of_second() {
    let node = standalone("kme1");
    let a = material(16, 1);
    let b = material(16, 2);
    seed(&[&node], &[("0001", a.clone()), ("0002", b.clone())]).await;

    let keys = node.manager.fetch_keys(1, 24, MASTER_SAE, SLAVE_SAE).await.unwrap();
    assert_eq!(keys.len(), 1);

    let mut expected = a.clone();
    expected.extend_from_slice(&b[8..16]);
    assert_eq!(keys[0].key.as_slice(), expected.as_slice());

    let index = index(&node).await;
    assert!(index.get(&EpochId::new("0001")).is_none());
    assert_eq!(index.get(&EpochId::new("0002")), Some(&SlotState::Free(8)));
    assert!(node.store.get(&epoch_path("0001")).await.unwrap().is_none());

    let (entry, _) = node.manager.ledger().lookup(&keys[0].key_id).await.unwrap().unwrap();
    let mut provenance = BTreeMap::new();
    provenance.insert(EpochId::new("0001"), ByteRange { start: 0, end: 16 });
    provenance.insert(EpochId::new("0002"), ByteRange { start: 8, end: 16 });
    assert_eq!(entry.provenance, provenance);
    assert_eq!(entry.total_bytes, 24);
    assert_eq!(entry.master_sae_id, MASTER_SAE);
    assert_eq!(entry.slave_sae_id, SLAVE_SAE);
}

#[tokio::test]
async fn test_insufficient_material_leaves_index_unchanged() {
    let node = standalone("kme1");
    seed(&[&node], &[("0001", material(16, 1))]).await;
    let before = status_fields(&node).await;

    let err = node.manager.fetch_keys(3, 8, MASTER_SAE, SLAVE_SAE).await.unwrap_err();
    assert!(matches!(
        err,
        KmeError::InsufficientMaterial {
            available: 16,
            requested: 24
        }
    ));
    assert_eq!(err.http_status(), 400);
    assert_eq!(status_fields(&node).await, before);
}

#[tokio::test]
async fn test_request_limits_are_enforced() {
    let node = standalone("kme1");
    seed(&[&node], &[("0001", material(64, 1))]).await;

    for (count, size) in [(0, 8), (101, 8), (1, 0), (1, 10_001)] {
        let err = node.manager.fetch_keys(count, size, MASTER_SAE, SLAVE_SAE).await.unwrap_err();
        assert!(matches!(err, KmeError::InvalidRequest(_)), "count {count} size {size}");
    }

    let err = node.manager.fetch_keys(1, 8, "x", SLAVE_SAE).await.unwrap_err();
    assert!(matches!(err, KmeError::InvalidRequest(_)));
    assert_eq!(index(&node).await.free_bytes(), 64);
}

#[tokio::test]
async fn test_successive_keys_from_one_epoch_get_distinct_ids() {
    let node = standalone("kme1");
    seed(&[&node], &[("0001", material(32, 3))]).await;

    let first = node.manager.fetch_keys(2, 8, MASTER_SAE, SLAVE_SAE).await.unwrap();
    let second = node.manager.fetch_keys(2, 8, MASTER_SAE, SLAVE_SAE).await.unwrap();

    let ids: HashSet<_> = first.iter().chain(&second).map(|k| k.key_id.clone()).collect();
    assert_eq!(ids.len(), 4);
    assert!(index(&node).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_within_pool_all_succeed() {
    let node = standalone("kme1");
    let epochs: Vec<(String, Vec<u8>)> = (1..=8)
        .map(|i| (format!("{i:04}"), material(64, i as u8)))
        .collect();
    let borrowed: Vec<(&str, Vec<u8>)> = epochs.iter().map(|(id, c)| (id.as_str(), c.clone())).collect();
    seed(&[&node], &borrowed).await;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = node.manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.fetch_keys(1, 32, MASTER_SAE, SLAVE_SAE).await
        }));
    }

    let mut issued = Vec::new();
    for task in tasks {
        issued.extend(task.await.unwrap().unwrap());
    }
    assert_eq!(issued.len(), 16);
    assert_eq!(issued.iter().map(|k| k.key.len()).sum::<usize>(), 512);

    let mut ranges: BTreeMap<EpochId, Vec<ByteRange>> = BTreeMap::new();
    for key in &issued {
        let (entry, _) = node.manager.ledger().lookup(&key.key_id).await.unwrap().unwrap();
        for (epoch, range) in entry.provenance {
            ranges.entry(epoch).or_default().push(range);
        }
    }
    for (epoch, list) in &ranges {
        for (i, a) in list.iter().enumerate() {
            for b in &list[i + 1..] {
                assert!(!a.overlaps(b), "overlapping ranges in epoch {epoch}: {a:?} {b:?}");
            }
        }
    }

    let index = index(&node).await;
    assert!(index.is_empty());
    assert_eq!(index.reserved_count(), 0);
}

#[tokio::test]
async fn test_status_reports_pool() {
    let node = standalone("kme1");
    seed(&[&node], &[("0001", material(16, 1)), ("0002", material(20, 2))]).await;

    let status = node.manager.status().await.unwrap();
    assert_eq!(status.channel, CHANNEL);
    assert_eq!(status.free_bytes, 36);
    assert_eq!(status.reserved_bytes, 0);
    assert_eq!(status.epoch_count, 2);
    assert_eq!(status.stored_key_count, 9);
    assert_eq!(status.key_size, 32);
    assert_eq!(status.max_key_count, 100);
}

#[tokio::test]
async fn test_corrupted_epoch_is_never_issued() {
    let node = standalone("kme1");
    seed(&[&node], &[("0001", material(16, 1))]).await;
    let before = status_fields(&node).await;

    let doc = node.store.get(&epoch_path("0001")).await.unwrap().unwrap();
    let mut fields = doc.fields.clone();
    let mut flipped = material(16, 1);
    flipped[5] ^= 0x01;
    fields.insert(
        "key".to_string(),
        serde_json::Value::String(base64_encode(&flipped)),
    );
    node.store.put(&epoch_path("0001"), fields, doc.version).await.unwrap();

    let err = node.manager.fetch_keys(1, 8, MASTER_SAE, SLAVE_SAE).await.unwrap_err();
    assert!(matches!(err, KmeError::IntegrityFailure { .. }));
    assert_eq!(err.http_status(), 503);
    assert_eq!(status_fields(&node).await, before);
}

/// Peer that records every batch and then fails it
struct FailingPeer {
    failure: fn() -> KmeError,
    pushed: Arc<Mutex<Vec<KeyId>>>,
}

impl LedgerPeer for FailingPeer {
    fn describe(&self) -> String {
        "failing peer".to_string()
    }

    fn push(&self, batch: LedgerBatch) -> PeerRequest<Vec<KeyId>> {
        self.pushed
            .lock()
            .unwrap()
            .extend(batch.ledgers.into_iter().map(|e| e.key_id));
        let failure = self.failure;
        PeerRequest::spawn(async move { Err(failure()) })
    }
}

#[tokio::test]
async fn test_peer_failure_is_surfaced_after_local_commit() {
    let cases: [(fn() -> KmeError, u16); 2] = [
        (|| KmeError::PeerBusy("peer answered 503".to_string()), 503),
        (|| KmeError::PeerTimeout("no answer within 2s".to_string()), 504),
    ];

    for (failure, status) in cases {
        let pushed = Arc::new(Mutex::new(Vec::new()));
        let peer = FailingPeer {
            failure,
            pushed: pushed.clone(),
        };
        let node = node_with(test_config("kme1", "kme2"), LedgerSync::new(Arc::new(peer)));
        seed(&[&node], &[("0001", material(16, 6))]).await;

        let err = node.manager.fetch_keys(2, 8, MASTER_SAE, SLAVE_SAE).await.unwrap_err();
        assert_eq!(err.http_status(), status, "{err}");
        assert!(matches!(
            (&err, status),
            (KmeError::PeerBusy(_), 503) | (KmeError::PeerTimeout(_), 504)
        ));

        let index = index(&node).await;
        assert_eq!(index.reserved_count(), 0);
        assert!(index.is_empty());

        let ids = pushed.lock().unwrap().clone();
        assert_eq!(ids.len(), 2);
        for id in &ids {
            let (entry, _) = node.manager.ledger().lookup(id).await.unwrap().unwrap();
            assert_eq!(entry.status, LedgerStatus::Available);
        }
    }
}

fn epoch_store(node: &Node) -> EpochStore {
    let config = node.manager.config();
    EpochStore::new(
        Arc::new(node.store.clone()),
        StorePaths::from_settings(&config.store),
        Arc::new(IntegrityChecker::new(&config.digest, Arc::new(node.cache.clone()))),
    )
}

#[tokio::test]
async fn test_taken_over_lease_follows_the_stored_epoch_length() {
    let mut config = test_config("kme1", "kme-peer");
    config.allocator.lease_ttl_secs = 0;
    let node = node_with(config, LedgerSync::standalone());
    let content = material(16, 5);
    seed(&[&node], &[("0001", content.clone())]).await;

    // A holder that carved 8 bytes, persisted the shrunk epoch and vanished
    // without releasing.
    let stale = node.manager.allocator().claim(CHANNEL, 16).await.unwrap();
    let epochs = epoch_store(&node);
    let mut record = epochs.fetch(CHANNEL, &EpochId::new("0001")).await.unwrap();
    record
        .replace_content(content[..8].to_vec(), epochs.integrity().digester())
        .unwrap();
    epochs.persist(&mut record).await.unwrap();
    std::mem::forget(stale);

    let err = node.manager.fetch_keys(1, 16, MASTER_SAE, SLAVE_SAE).await.unwrap_err();
    assert!(matches!(err, KmeError::InsufficientMaterial { requested: 16, .. }), "{err}");
    let after = index(&node).await;
    assert_eq!(after.get(&EpochId::new("0001")), Some(&SlotState::Free(8)));
    assert_eq!(after.reserved_count(), 0);

    let keys = node.manager.fetch_keys(1, 8, MASTER_SAE, SLAVE_SAE).await.unwrap();
    assert_eq!(keys[0].key.as_slice(), &content[..8]);
    assert!(index(&node).await.is_empty());
    assert!(node.store.get(&epoch_path("0001")).await.unwrap().is_none());
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
