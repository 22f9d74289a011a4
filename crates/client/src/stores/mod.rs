//! Process-wide caches, one [`CacheEntry`] per resource and scope.

mod cache;
mod fingerprint;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crmsync_shared::ResourceKey;

use crate::api_client::FetchClient;
use crate::listeners::lock;

pub use cache::{CacheEntry, PendingWrite, Refresh};
pub use fingerprint::Fingerprint;

/// Scope used when a caller does not name one.
pub const DEFAULT_SCOPE: &str = "default";

/// Names one cache: a resource plus the caller-chosen scope sharing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub resource: ResourceKey,
    pub scope: String,
}

impl CacheKey {
    pub fn new(resource: ResourceKey, scope: impl Into<String>) -> Self {
        Self {
            resource,
            scope: scope.into(),
        }
    }
}

impl From<ResourceKey> for CacheKey {
    fn from(resource: ResourceKey) -> Self {
        Self::new(resource, DEFAULT_SCOPE)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.resource, self.scope)
    }
}

/// Shared map of cache entries. Callers asking for the same [`CacheKey`]
/// get the same entry.
pub struct CacheStore {
    fetch: Arc<dyn FetchClient>,
    entries: Mutex<HashMap<CacheKey, Arc<CacheEntry>>>,
}

impl CacheStore {
    pub fn new(fetch: Arc<dyn FetchClient>) -> Self {
        Self {
            fetch,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The entry for `key`, created empty on first use.
    pub fn entry(&self, key: &CacheKey) -> Arc<CacheEntry> {
        lock(&self.entries)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CacheEntry::new(key.resource.clone(), self.fetch.clone())))
            .clone()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        lock(&self.entries).get(key).cloned()
    }

    /// Every scope's entry for `resource`.
    pub fn entries_for(&self, resource: &ResourceKey) -> Vec<Arc<CacheEntry>> {
        lock(&self.entries)
            .iter()
            .filter(|(key, _)| &key.resource == resource)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Mark every entry stale so its next read refetches.
    pub fn invalidate_all(&self) {
        let entries: Vec<_> = lock(&self.entries).values().cloned().collect();
        for entry in entries {
            entry.invalidate();
        }
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        lock(&self.entries).remove(key)
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore").field("entries", &self.len()).finish()
    }
}
