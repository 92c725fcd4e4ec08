//! In-memory store contract tests

use qkme_store::{Fields, MemoryStore, SecretStore, StoreError, ABSENT_VERSION};
use serde_json::json;

fn fields(value: serde_json::Value) -> Fields {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Fields::new(),
    }
}

#[tokio::test]
async fn test_absent_path_reads_as_none_at_version_zero() {
    let store = MemoryStore::new();

    assert!(store.get("QKDE0001/ch/status").await.unwrap().is_none());
    assert_eq!(store.read_version("QKDE0001/ch/status").await.unwrap(), ABSENT_VERSION);
}

#[tokio::test]
async fn test_create_then_update_advances_version() {
    let store = MemoryStore::new();

    let v1 = store.put("a/b", fields(json!({"x": 1})), 0).await.unwrap();
    assert_eq!(v1, 1);
    let v2 = store.put("a/b", fields(json!({"x": 2})), 1).await.unwrap();
    assert_eq!(v2, 2);

    let doc = store.get("a/b").await.unwrap().unwrap();
    assert_eq!(doc.version, 2);
    assert_eq!(doc.fields.get("x"), Some(&json!(2)));
}

#[tokio::test]
async fn test_stale_version_is_rejected() {
    let store = MemoryStore::new();
    store.put("a/b", fields(json!({"x": 1})), 0).await.unwrap();

    let create_again = store.put("a/b", fields(json!({"x": 9})), 0).await;
    assert!(matches!(create_again, Err(StoreError::VersionConflict { expected: 0, .. })));

    let stale = store.put("a/b", fields(json!({"x": 9})), 5).await;
    assert!(matches!(stale, Err(StoreError::VersionConflict { expected: 5, .. })));

    let doc = store.get("a/b").await.unwrap().unwrap();
    assert_eq!(doc.fields.get("x"), Some(&json!(1)));
}

#[tokio::test]
async fn test_delete_all_versions_resets_history() {
    let store = MemoryStore::new();
    store.put("a/b", Fields::new(), 0).await.unwrap();
    store.put("a/b", Fields::new(), 1).await.unwrap();

    store.delete_all_versions("a/b").await.unwrap();
    assert_eq!(store.read_version("a/b").await.unwrap(), ABSENT_VERSION);
    assert_eq!(store.put("a/b", Fields::new(), 0).await.unwrap(), 1);
}

#[tokio::test]
async fn test_list_returns_direct_children() {
    let store = MemoryStore::new();
    for path in ["q/ch/0001", "q/ch/0002", "q/ch/status", "q/LEDGER/k1", "other/x"] {
        store.put(path, Fields::new(), 0).await.unwrap();
    }

    assert_eq!(
        store.list("q/ch").await.unwrap(),
        vec!["0001".to_string(), "0002".to_string(), "status".to_string()]
    );
    assert_eq!(
        store.list("q").await.unwrap(),
        vec!["LEDGER/".to_string(), "ch/".to_string()]
    );
    assert!(store.list("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_offline_store_reports_connection_errors() {
    let store = MemoryStore::new();
    store.set_offline(true);

    assert!(matches!(store.get("a").await, Err(StoreError::Connection(_))));
    store.set_offline(false);
    assert!(store.get("a").await.unwrap().is_none());
}
