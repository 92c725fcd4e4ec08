//! In-process secret store

use crate::error::{StoreError, StoreResult};
use crate::request::StoreRequest;
use crate::traits::{Fields, SecretStore, Versioned, ABSENT_VERSION};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Versioned map held in memory.
///
/// Compare-and-swap is enforced per path under the map's shard lock, so
/// concurrent writers observe the same conflict semantics as a networked
/// store. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    documents: Arc<DashMap<String, Versioned>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a connectivity outage; every operation fails while offline
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of documents currently held
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// True when no documents are held
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Connection("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn get_now(&self, path: &str) -> StoreResult<Option<Versioned>> {
        self.check_online()?;
        Ok(self.documents.get(path).map(|doc| doc.value().clone()))
    }

    fn put_now(&self, path: &str, fields: Fields, expected_version: u64) -> StoreResult<u64> {
        self.check_online()?;
        if path.is_empty() || path.ends_with('/') {
            return Err(StoreError::InvalidPath(path.to_string()));
        }

        let conflict = || StoreError::VersionConflict {
            path: path.to_string(),
            expected: expected_version,
        };

        match self.documents.entry(path.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                if current != expected_version {
                    return Err(conflict());
                }
                let version = current + 1;
                occupied.insert(Versioned { fields, version });
                Ok(version)
            }
            Entry::Vacant(vacant) => {
                if expected_version != ABSENT_VERSION {
                    return Err(conflict());
                }
                vacant.insert(Versioned { fields, version: 1 });
                Ok(1)
            }
        }
    }

    fn list_now(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_online()?;
        let prefix = format!("{}/", prefix.trim_end_matches('/'));

        let names: BTreeSet<String> = self
            .documents
            .iter()
            .filter_map(|doc| {
                let rest = doc.key().strip_prefix(&prefix)?;
                Some(match rest.split_once('/') {
                    Some((folder, _)) => format!("{folder}/"),
                    None => rest.to_string(),
                })
            })
            .collect();

        Ok(names.into_iter().collect())
    }
}

impl SecretStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, path: &str) -> StoreRequest<Option<Versioned>> {
        StoreRequest::ready(self.get_now(path))
    }

    fn put(&self, path: &str, fields: Fields, expected_version: u64) -> StoreRequest<u64> {
        StoreRequest::ready(self.put_now(path, fields, expected_version))
    }

    fn read_version(&self, path: &str) -> StoreRequest<u64> {
        StoreRequest::ready(
            self.get_now(path)
                .map(|doc| doc.map_or(ABSENT_VERSION, |doc| doc.version)),
        )
    }

    fn delete_all_versions(&self, path: &str) -> StoreRequest<()> {
        let result = self.check_online().map(|()| {
            self.documents.remove(path);
        });
        StoreRequest::ready(result)
    }

    fn list(&self, prefix: &str) -> StoreRequest<Vec<String>> {
        StoreRequest::ready(self.list_now(prefix))
    }
}
