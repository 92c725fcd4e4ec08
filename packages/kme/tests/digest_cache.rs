//! Digest caches and the three-way integrity check

use qkme::config::DigestSettings;
use qkme::{DigestCache, EpochId, FileDigestCache, IntegrityChecker, KmeError, MemoryDigestCache};
use secrecy::SecretString;
use std::sync::Arc;

fn settings() -> DigestSettings {
    DigestSettings {
        key: SecretString::from("cache-test-key".to_string()),
        ..DigestSettings::default()
    }
}

#[tokio::test]
async fn test_file_cache_round_trip_and_removal() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileDigestCache::new(dir.path());
    let epoch = EpochId::new("0001");

    assert_eq!(cache.load("masterslave", &epoch).await.unwrap(), None);
    cache.save("masterslave", &epoch, "abc123").await.unwrap();
    assert_eq!(cache.load("masterslave", &epoch).await.unwrap().as_deref(), Some("abc123"));
    assert!(dir.path().join("masterslave").join("0001.digest").exists());

    cache.remove("masterslave", &epoch).await.unwrap();
    cache.remove("masterslave", &epoch).await.unwrap();
    assert_eq!(cache.load("masterslave", &epoch).await.unwrap(), None);
}

#[tokio::test]
async fn test_verify_needs_stored_and_cached_digest_to_agree() {
    let cache = MemoryDigestCache::new();
    let checker = IntegrityChecker::new(&settings(), Arc::new(cache.clone()));
    let epoch = EpochId::new("0001");
    let content = b"raw key material".to_vec();
    let digest = checker.digester().digest_hex(&content).unwrap();

    let err = checker.verify("ch", &epoch, &content, &digest).await.unwrap_err();
    assert!(matches!(err, KmeError::IntegrityFailure { .. }));

    checker.remember("ch", &epoch, &digest).await.unwrap();
    checker.verify("ch", &epoch, &content, &digest).await.unwrap();

    let mut tampered = content.clone();
    tampered[0] ^= 1;
    assert!(checker.verify("ch", &epoch, &tampered, &digest).await.is_err());

    let forged = checker.digester().digest_hex(&tampered).unwrap();
    assert!(checker.verify("ch", &epoch, &tampered, &forged).await.is_err());

    checker.forget("ch", &epoch).await.unwrap();
    assert!(checker.verify("ch", &epoch, &content, &digest).await.is_err());
}

#[tokio::test]
async fn test_disabled_comparison_accepts_anything() {
    let checker = IntegrityChecker::new(
        &DigestSettings {
            compare: false,
            ..settings()
        },
        Arc::new(MemoryDigestCache::new()),
    );
    checker
        .verify("ch", &EpochId::new("0001"), b"content", "not-a-digest")
        .await
        .unwrap();
}
