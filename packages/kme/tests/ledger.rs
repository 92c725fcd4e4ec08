//! Ledger persistence, replication receiver and peer transport

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::routing::put;
use axum::Router;
use common::*;
use qkme::api::{build_router, ApiState};
use qkme::config::{PeerSettings, RetrySettings, ServerSettings};
use qkme::{
    ByteRange, EpochId, HttpLedgerPeer, KeyId, KeyIdList, KmeError, LedgerBatch, LedgerEntry,
    LedgerStatus, LedgerStore, LedgerSync, StorePaths,
};
use qkme_store::{MemoryStore, SecretStore};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceExt;

fn entry(key_id: &str) -> LedgerEntry {
    let mut provenance = BTreeMap::new();
    provenance.insert(EpochId::new("0001"), ByteRange { start: 0, end: 16 });
    provenance.insert(EpochId::new("0002"), ByteRange { start: 8, end: 16 });
    LedgerEntry {
        key_id: KeyId::new(key_id),
        status: LedgerStatus::Available,
        master_sae_id: MASTER_SAE.to_string(),
        slave_sae_id: SLAVE_SAE.to_string(),
        total_bytes: 24,
        channel: CHANNEL.to_string(),
        provenance,
    }
}

fn ledger_over(store: &MemoryStore) -> LedgerStore {
    LedgerStore::new(Arc::new(store.clone()), StorePaths::new("QKDE0001", "LEDGER"))
}

fn peer_settings(url: String) -> PeerSettings {
    PeerSettings {
        url,
        ca_cert_path: None,
        client_cert_path: None,
        client_key_path: None,
        timeout_ms: 2_000,
        retry: RetrySettings {
            max_attempts: 2,
            backoff_factor_ms: 10,
            backoff_max_ms: 20,
        },
    }
}

async fn spawn_router(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_commit_is_write_once() {
    let store = MemoryStore::new();
    let ledger = ledger_over(&store);
    let k = entry("key-k");

    ledger.commit(&k).await.unwrap();
    let err = ledger.commit(&k).await.unwrap_err();
    assert!(matches!(err, KmeError::DuplicateKeyId(_)));
    assert_eq!(err.http_status(), 500);
}

#[tokio::test]
async fn test_entries_are_flattened_at_the_store_boundary() {
    let store = MemoryStore::new();
    let ledger = ledger_over(&store);
    ledger.commit(&entry("key-f")).await.unwrap();

    let doc = store.get("QKDE0001/LEDGER/key-f").await.unwrap().unwrap();
    assert_eq!(doc.fields["0001_start_index"], json!(0));
    assert_eq!(doc.fields["0001_end_index"], json!(16));
    assert_eq!(doc.fields["0002_start_index"], json!(8));
    assert_eq!(doc.fields["status"], json!("available"));
    assert_eq!(doc.fields["num_bytes"], json!(24));

    let (read, version) = ledger.lookup(&KeyId::new("key-f")).await.unwrap().unwrap();
    assert_eq!(read, entry("key-f"));
    assert_eq!(version, 1);
}

#[tokio::test]
async fn test_commit_all_rolls_back_on_duplicate() {
    let store = MemoryStore::new();
    let ledger = ledger_over(&store);
    ledger.commit(&entry("key-2")).await.unwrap();

    let err = ledger
        .commit_all(&[entry("key-1"), entry("key-2")])
        .await
        .unwrap_err();
    assert!(matches!(err, KmeError::DuplicateKeyId(_)));
    assert!(ledger.lookup(&KeyId::new("key-1")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_fetch_checks_the_sae_pair() {
    let store = MemoryStore::new();
    let ledger = ledger_over(&store);
    ledger.commit(&entry("key-a")).await.unwrap();

    ledger.fetch(&KeyId::new("key-a"), MASTER_SAE, SLAVE_SAE).await.unwrap();
    assert!(matches!(
        ledger.fetch(&KeyId::new("key-a"), SLAVE_SAE, MASTER_SAE).await,
        Err(KmeError::Unauthorized(_))
    ));
    assert!(matches!(
        ledger.fetch(&KeyId::new("key-z"), MASTER_SAE, SLAVE_SAE).await,
        Err(KmeError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_receiver_resets_fresh_duplicates_and_rejects_replays() {
    let slave = standalone("kme2");
    let receiver = slave.manager.receiver().clone();
    let batch = LedgerBatch {
        ledgers: vec![entry("key-r")],
    };

    let accepted = receiver.accept("kme-peer", batch.clone()).await.unwrap();
    assert_eq!(accepted, vec![KeyId::new("key-r")]);

    let accepted = receiver.accept("kme-peer", batch.clone()).await.unwrap();
    assert_eq!(accepted, vec![KeyId::new("key-r")]);

    let ledger = slave.manager.ledger();
    let (read, version) = ledger.lookup(&KeyId::new("key-r")).await.unwrap().unwrap();
    assert_eq!(version, 1);
    ledger.mark_consumed(&read, version).await.unwrap();

    let accepted = receiver.accept("kme-peer", batch).await.unwrap();
    assert!(accepted.is_empty());
    let (after, _) = ledger.lookup(&KeyId::new("key-r")).await.unwrap().unwrap();
    assert_eq!(after.status, LedgerStatus::Consumed);
}

#[tokio::test]
async fn test_replay_of_consumed_entry_is_left_out_of_the_echo() {
    let (master, slave) = node_pair();
    seed(&[&master, &slave], &[("0001", material(32, 1))]).await;
    let issued = master.manager.fetch_keys(1, 8, MASTER_SAE, SLAVE_SAE).await.unwrap();
    let ids = vec![issued[0].key_id.clone()];
    slave.manager.fetch_by_ids(&ids, MASTER_SAE, SLAVE_SAE).await.unwrap();

    let (original, _) = master.manager.ledger().lookup(&ids[0]).await.unwrap().unwrap();
    let accepted = slave
        .manager
        .receiver()
        .accept("kme1", LedgerBatch { ledgers: vec![original] })
        .await
        .unwrap();
    assert!(accepted.is_empty());

    let err = slave.manager.fetch_by_ids(&ids, MASTER_SAE, SLAVE_SAE).await.unwrap_err();
    assert!(matches!(err, KmeError::NotAvailable { .. }));
}

#[tokio::test]
async fn test_receiver_rejects_unknown_sender_and_bad_entries() {
    let slave = standalone("kme2");
    let receiver = slave.manager.receiver().clone();

    let err = receiver
        .accept("kme-evil", LedgerBatch { ledgers: vec![entry("key-x")] })
        .await
        .unwrap_err();
    assert!(matches!(err, KmeError::Unauthorized(_)));

    let mut short = entry("key-y");
    short.total_bytes = 25;
    let err = receiver
        .accept("kme-peer", LedgerBatch { ledgers: vec![entry("key-ok"), short] })
        .await
        .unwrap_err();
    assert!(matches!(err, KmeError::InvalidRequest(_)));
    assert!(slave.manager.ledger().lookup(&KeyId::new("key-ok")).await.unwrap().is_none());

    let err = receiver
        .accept("kme-peer", LedgerBatch { ledgers: vec![entry("key-d"), entry("key-d")] })
        .await
        .unwrap_err();
    assert!(matches!(err, KmeError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_receiver_refuses_oversized_and_wrapping_entries() {
    let slave = standalone("kme2");
    let receiver = slave.manager.receiver().clone();
    let max = slave.manager.config().keys.max_key_bytes();

    for total in [max + 1, u64::MAX] {
        let mut huge = entry("key-huge");
        huge.total_bytes = total;
        huge.provenance.clear();
        huge.provenance.insert(EpochId::new("0001"), ByteRange { start: 0, end: total });
        let err = receiver
            .accept("kme-peer", LedgerBatch { ledgers: vec![huge] })
            .await
            .unwrap_err();
        assert!(matches!(err, KmeError::InvalidRequest(_)), "total {total}: {err}");
    }

    // (u64::MAX - 1) + 26 wraps around to 24
    let mut wrapping = entry("key-wrap");
    wrapping.provenance.clear();
    wrapping.provenance.insert(EpochId::new("0001"), ByteRange { start: 1, end: u64::MAX });
    wrapping.provenance.insert(EpochId::new("0002"), ByteRange { start: 0, end: 26 });
    assert_eq!(wrapping.total_bytes, 24);
    let err = receiver
        .accept("kme-peer", LedgerBatch { ledgers: vec![wrapping] })
        .await
        .unwrap_err();
    assert!(matches!(err, KmeError::InvalidRequest(_)));

    for id in ["key-huge", "key-wrap"] {
        assert!(slave.manager.ledger().lookup(&KeyId::new(id)).await.unwrap().is_none());
    }
}

async fn call(router: Router, sender: &str, body: Body) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/api/v1/ledger/{sender}/key_ids"))
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
}

#[tokio::test]
async fn test_route_stores_batch_and_echoes_ids() {
    let slave = standalone("kme2");
    let state = ApiState::new(slave.manager.receiver().clone(), &ServerSettings::default());
    let body = serde_json::to_vec(&LedgerBatch { ledgers: vec![entry("key-h")] }).unwrap();

    let (status, json) = call(build_router(state), "kme-peer", Body::from(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json, json!({"key_IDs": [{"key_ID": "key-h"}]}));
    assert!(slave.manager.ledger().lookup(&KeyId::new("key-h")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_route_maps_errors_to_status_codes() {
    let slave = standalone("kme2");
    let state = ApiState::new(slave.manager.receiver().clone(), &ServerSettings::default());
    let body = serde_json::to_vec(&LedgerBatch { ledgers: vec![entry("key-u")] }).unwrap();

    let (status, json) = call(build_router(state.clone()), "kme-evil", Body::from(body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json["message"].as_str().unwrap().contains("kme-evil"));

    let (status, _) = call(build_router(state), "kme-peer", Body::from("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_saturated_gate_answers_service_unavailable() {
    let slave = standalone("kme2");
    let settings = ServerSettings {
        max_concurrent_requests: 1,
        ..ServerSettings::default()
    };
    let state = ApiState::new(slave.manager.receiver().clone(), &settings);
    let _held = state.gate.clone().try_acquire_owned().unwrap();
    let body = serde_json::to_vec(&LedgerBatch { ledgers: vec![entry("key-b")] }).unwrap();

    let (status, _) = call(build_router(state), "kme-peer", Body::from(body)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_sync_over_http_replicates_entries() {
    let slave = standalone("kme2");
    let state = ApiState::new(slave.manager.receiver().clone(), &ServerSettings::default());
    let url = spawn_router(build_router(state)).await;

    let peer = HttpLedgerPeer::connect(&peer_settings(url), "kme-peer").await.unwrap();
    let sync = LedgerSync::new(Arc::new(peer));
    sync.sync(&[entry("key-s1"), entry("key-s2")]).await.unwrap();

    for id in ["key-s1", "key-s2"] {
        let (stored, _) = slave.manager.ledger().lookup(&KeyId::new(id)).await.unwrap().unwrap();
        assert_eq!(stored.status, LedgerStatus::Available);
    }
}

#[tokio::test]
async fn test_sync_classifies_peer_failures() {
    let busy = Router::new().route(
        "/api/v1/ledger/:kme_id/key_ids",
        put(|| async { StatusCode::SERVICE_UNAVAILABLE }),
    );
    let url = spawn_router(busy).await;
    let peer = HttpLedgerPeer::connect(&peer_settings(url), "kme1").await.unwrap();
    let err = LedgerSync::new(Arc::new(peer)).sync(&[entry("key-1")]).await.unwrap_err();
    assert!(matches!(err, KmeError::PeerBusy(_)));
    assert_eq!(err.http_status(), 503);

    let echo = Router::new().route(
        "/api/v1/ledger/:kme_id/key_ids",
        put(|| async { (StatusCode::CREATED, axum::Json(KeyIdList::default())) }),
    );
    let url = spawn_router(echo).await;
    let peer = HttpLedgerPeer::connect(&peer_settings(url), "kme1").await.unwrap();
    LedgerSync::new(Arc::new(peer)).sync(&[entry("key-1")]).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let peer = HttpLedgerPeer::connect(&peer_settings(closed), "kme1").await.unwrap();
    let err = LedgerSync::new(Arc::new(peer)).sync(&[entry("key-1")]).await.unwrap_err();
    assert!(matches!(err, KmeError::PeerUnreachable(_)));
}

#[tokio::test]
async fn test_standalone_sync_is_a_no_op() {
    let sync = LedgerSync::standalone();
    assert!(!sync.is_enabled());
    sync.sync(&[entry("key-1")]).await.unwrap();
}
