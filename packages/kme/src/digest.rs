//! Epoch integrity: HMAC-SHA3-512 digests and the three-way check
//!
//! Epoch content is handed out only when an independently recomputed MAC
//! equals both the digest stored with the epoch and the copy cached locally
//! when the epoch was last written by this node or its producer.

use crate::config::DigestSettings;
use crate::error::{KmeError, Result};
use crate::types::EpochId;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use log::{error, warn};
use qkme_store::{StoreError, StoreRequest};
use secrecy::ExposeSecret;
use sha3::Sha3_512;
use std::path::PathBuf;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type HmacSha3_512 = Hmac<Sha3_512>;

/// Keyed MAC over epoch content
pub struct Digester {
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for Digester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Digester").finish_non_exhaustive()
    }
}

impl Digester {
    /// Create a digester keyed with `key`
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: Zeroizing::new(key.to_vec()),
        }
    }

    /// Hex-encoded HMAC-SHA3-512 of `content`
    pub fn digest_hex(&self, content: &[u8]) -> Result<String> {
        let mut mac = HmacSha3_512::new_from_slice(&self.key)
            .map_err(|e| KmeError::Configuration(format!("invalid digest key: {e}")))?;
        mac.update(content);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Local copy of the last digest written for each epoch
pub trait DigestCache: Send + Sync + 'static {
    /// Cached digest, `None` when nothing is cached
    fn load(&self, channel: &str, epoch_id: &EpochId) -> StoreRequest<Option<String>>;

    /// Replace the cached digest
    fn save(&self, channel: &str, epoch_id: &EpochId, digest: &str) -> StoreRequest<()>;

    /// Forget the cached digest
    fn remove(&self, channel: &str, epoch_id: &EpochId) -> StoreRequest<()>;
}

/// One `<dir>/<channel>/<epoch>.digest` file per epoch
#[derive(Debug, Clone)]
pub struct FileDigestCache {
    dir: PathBuf,
}

impl FileDigestCache {
    /// Cache rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file(&self, channel: &str, epoch_id: &EpochId) -> PathBuf {
        self.dir.join(channel).join(format!("{epoch_id}.digest"))
    }
}

impl DigestCache for FileDigestCache {
    fn load(&self, channel: &str, epoch_id: &EpochId) -> StoreRequest<Option<String>> {
        let file = self.file(channel, epoch_id);
        StoreRequest::spawn(async move {
            match tokio::fs::read_to_string(&file).await {
                Ok(digest) => Ok(Some(digest.trim().to_string())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(StoreError::Io(e)),
            }
        })
    }

    fn save(&self, channel: &str, epoch_id: &EpochId, digest: &str) -> StoreRequest<()> {
        let file = self.file(channel, epoch_id);
        let digest = digest.to_string();
        StoreRequest::spawn(async move {
            if let Some(parent) = file.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&file, digest).await?;
            Ok(())
        })
    }

    fn remove(&self, channel: &str, epoch_id: &EpochId) -> StoreRequest<()> {
        let file = self.file(channel, epoch_id);
        StoreRequest::spawn(async move {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::Io(e)),
            }
        })
    }
}

/// Process-local digest cache
#[derive(Debug, Clone, Default)]
pub struct MemoryDigestCache {
    digests: Arc<DashMap<(String, EpochId), String>>,
}

impl MemoryDigestCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }
}

impl DigestCache for MemoryDigestCache {
    fn load(&self, channel: &str, epoch_id: &EpochId) -> StoreRequest<Option<String>> {
        let key = (channel.to_string(), epoch_id.clone());
        StoreRequest::ready(Ok(self.digests.get(&key).map(|d| d.value().clone())))
    }

    fn save(&self, channel: &str, epoch_id: &EpochId, digest: &str) -> StoreRequest<()> {
        self.digests
            .insert((channel.to_string(), epoch_id.clone()), digest.to_string());
        StoreRequest::ready(Ok(()))
    }

    fn remove(&self, channel: &str, epoch_id: &EpochId) -> StoreRequest<()> {
        self.digests.remove(&(channel.to_string(), epoch_id.clone()));
        StoreRequest::ready(Ok(()))
    }
}

fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Recomputes, verifies and records epoch digests
pub struct IntegrityChecker {
    digester: Digester,
    cache: Arc<dyn DigestCache>,
    compare: bool,
    compare_to_cache: bool,
}

impl IntegrityChecker {
    /// Checker from digest settings
    pub fn new(settings: &DigestSettings, cache: Arc<dyn DigestCache>) -> Self {
        Self {
            digester: Digester::new(settings.key.expose_secret().as_bytes()),
            cache,
            compare: settings.compare,
            compare_to_cache: settings.compare_to_cache,
        }
    }

    /// The digester used for recomputation
    pub fn digester(&self) -> &Digester {
        &self.digester
    }

    /// Fail closed unless the recomputed digest equals the stored one and the
    /// cached one
    pub async fn verify(
        &self,
        channel: &str,
        epoch_id: &EpochId,
        content: &[u8],
        stored_digest: &str,
    ) -> Result<()> {
        if !self.compare {
            return Ok(());
        }

        let failure = || KmeError::IntegrityFailure {
            channel: channel.to_string(),
            epoch_id: epoch_id.to_string(),
        };

        let computed = self.digester.digest_hex(content)?;
        if !digests_match(&computed, stored_digest) {
            error!("Digest of epoch {epoch_id} on {channel} does not match the stored digest");
            return Err(failure());
        }

        if self.compare_to_cache {
            match self.cache.load(channel, epoch_id).await? {
                Some(cached) if digests_match(&computed, &cached) => {}
                Some(_) => {
                    error!("Digest of epoch {epoch_id} on {channel} does not match the cached digest");
                    return Err(failure());
                }
                None => {
                    warn!("No cached digest for epoch {epoch_id} on {channel}");
                    return Err(failure());
                }
            }
        }
        Ok(())
    }

    /// Record `digest` as the latest written digest of an epoch
    pub async fn remember(&self, channel: &str, epoch_id: &EpochId, digest: &str) -> Result<()> {
        self.cache.save(channel, epoch_id, digest).await?;
        Ok(())
    }

    /// Drop the cached digest of a removed epoch
    pub async fn forget(&self, channel: &str, epoch_id: &EpochId) -> Result<()> {
        self.cache.remove(channel, epoch_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_keyed_and_hex_encoded() {
        let a = Digester::new(b"key-a").digest_hex(b"epoch content").unwrap();
        let b = Digester::new(b"key-b").digest_hex(b"epoch content").unwrap();

        assert_eq!(a.len(), 128);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert_eq!(a, Digester::new(b"key-a").digest_hex(b"epoch content").unwrap());
    }

    #[test]
    fn test_constant_time_match_requires_equal_length() {
        assert!(digests_match("abcd", "abcd"));
        assert!(!digests_match("abcd", "abce"));
        assert!(!digests_match("abcd", "abc"));
    }
}
