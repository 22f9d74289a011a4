//! The sync client: one connection, shared caches kept live by push events.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crmsync_shared::ResourceKey;

use crate::api_client::{FetchClient, HttpFetchClient};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::listeners::{lock, ListenerGuard};
use crate::stores::{CacheEntry, CacheKey, CacheStore};
use crate::ws::{ConnectionManager, ConnectionState, Subscription, WsTransport};

/// Keeps one push subscription alive for as long as any handle shares it.
struct WatchShare {
    _subscription: Subscription,
}

/// A cache entry that receives push updates while this handle lives.
///
/// Dereferences to the shared [`CacheEntry`]. Handles for the same resource
/// and scope share the entry and its subscription.
#[derive(Clone)]
pub struct LiveCollection {
    entry: Arc<CacheEntry>,
    _watch: Arc<WatchShare>,
}

impl LiveCollection {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl Deref for LiveCollection {
    type Target = Arc<CacheEntry>;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl std::fmt::Debug for LiveCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LiveCollection").field(&self.entry).finish()
    }
}

/// Entry point for consumers: construct once per process and share it.
pub struct SyncClient {
    connection: ConnectionManager,
    caches: Arc<CacheStore>,
    watches: Mutex<HashMap<CacheKey, Weak<WatchShare>>>,
    _recovery: ListenerGuard,
}

impl SyncClient {
    pub fn new(connection: ConnectionManager, fetch: Arc<dyn FetchClient>) -> Self {
        let caches = Arc::new(CacheStore::new(fetch));

        // Events may have been missed while the socket was down.
        let weak_caches = Arc::downgrade(&caches);
        let recovering = AtomicBool::new(false);
        let recovery = connection.on_state_change(move |state| match state {
            ConnectionState::Reconnecting { .. } | ConnectionState::Errored { .. } => {
                recovering.store(true, Ordering::SeqCst);
            }
            ConnectionState::Authenticated => {
                if recovering.swap(false, Ordering::SeqCst) {
                    if let Some(caches) = weak_caches.upgrade() {
                        crate::log_info!("Reconnected; marking {} cache(s) stale", caches.len());
                        caches.invalidate_all();
                    }
                }
            }
            _ => {}
        });

        Self {
            connection,
            caches,
            watches: Mutex::new(HashMap::new()),
            _recovery: recovery,
        }
    }

    /// Wire the WebSocket transport and HTTP fetch client from `config`.
    pub fn from_config(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let transport = Arc::new(WsTransport::new(
            config.socket_url.clone(),
            config.handshake_timeout,
        ));
        let fetch = HttpFetchClient::with_timeout(config.fetch_url.clone(), config.request_timeout)
            .map_err(SyncError::from)?;
        Ok(Self::new(
            ConnectionManager::new(config, transport),
            Arc::new(fetch),
        ))
    }

    pub fn initialize(&self) -> bool {
        self.connection.initialize()
    }

    /// Close the connection and drop every watch and cache.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        lock(&self.watches).clear();
        self.caches.clear();
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn caches(&self) -> &Arc<CacheStore> {
        &self.caches
    }

    /// The cache for `resource` under `scope`, kept current by push events
    /// while the returned handle (or a clone) is alive.
    pub fn watch(&self, resource: ResourceKey, scope: impl Into<String>) -> LiveCollection {
        let key = CacheKey::new(resource, scope);
        let entry = self.caches.entry(&key);

        let mut watches = lock(&self.watches);
        if let Some(share) = watches.get(&key).and_then(Weak::upgrade) {
            return LiveCollection {
                entry,
                _watch: share,
            };
        }

        // Pushes were not applied while nobody watched.
        if entry.fingerprint().is_some() {
            entry.invalidate();
        }

        let target = Arc::downgrade(&entry);
        let subscription = self.connection.subscribe(
            key.resource.clone(),
            format!("cache:{}", key.scope),
            move |event| {
                if let Some(entry) = target.upgrade() {
                    entry.apply_change_event(event);
                }
            },
        );
        let share = Arc::new(WatchShare {
            _subscription: subscription,
        });
        watches.retain(|_, share| share.strong_count() > 0);
        watches.insert(key, Arc::downgrade(&share));

        LiveCollection {
            entry,
            _watch: share,
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("connection", &self.connection)
            .field("caches", &self.caches)
            .finish()
    }
}
