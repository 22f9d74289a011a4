//! crmsync client - realtime cache synchronisation
//!
//! One authenticated, self-healing WebSocket to the change-notification
//! server is shared by any number of watchers. Each watched collection is
//! cached in memory, refetched only when the requested result set changes,
//! patched in place by pushed change events, and written optimistically.
//!
//! ```rust,ignore
//! let client = SyncClient::from_config(SyncConfig::from_env())?;
//! client.initialize();
//!
//! let sales = client.watch(ResourceKey::new("sales", "sales"), "dashboard");
//! let refresh = sales.ensure_fresh(&FetchParams::new().sort_desc("no"), false).await;
//! sales.optimistic_write(Some("s1"), patch).await?;
//! ```

pub mod api_client;
pub mod config;
pub mod error;
pub mod listeners;
pub mod logging;
pub mod service;
pub mod stores;
pub mod ws;

pub use api_client::{FetchClient, HttpFetchClient, TokenProvider};
pub use config::{BackoffConfig, Credentials, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use listeners::ListenerGuard;
pub use service::{LiveCollection, SyncClient};
pub use stores::{CacheEntry, CacheKey, CacheStore, Fingerprint, PendingWrite, Refresh};
pub use ws::{
    ChangeEventDispatcher, ConnectionManager, ConnectionState, Subscription, SubscriptionRegistry,
    Transport, TransportEvent, TransportEvents, WireState, WsTransport,
};

pub use crmsync_shared as shared;
