//! Realtime push channel: one authenticated socket shared by every watcher.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 ConnectionManager                   │
//! │   (connect → login → heartbeat → reconnect task)    │
//! └─────────────────────────────────────────────────────┘
//!            │ frames                    ▲ subscribe-collection
//!            ▼                           │
//!   ┌──────────────────────┐   ┌──────────────────────┐
//!   │ ChangeEventDispatcher│──▶│ SubscriptionRegistry │
//!   │ (resolve + fan out)  │   │ (refcount per key)   │
//!   └──────────────────────┘   └──────────────────────┘
//!                                        │
//!          ┌─────────────────────────────┼─────────────┐
//!          ▼                             ▼             ▼
//!   ┌────────────┐                ┌────────────┐ ┌────────────┐
//!   │ CacheEntry │                │ CacheEntry │ │  observer  │
//!   └────────────┘                └────────────┘ └────────────┘
//! ```
//!
//! Observers register per [`ResourceKey`](crmsync_shared::ResourceKey); the
//! server only ever sees one subscribe per key and session.

mod connection;
mod dispatch;
mod manager;
mod registry;

pub use connection::{ConnectionState, Transport, TransportEvent, TransportEvents, WsTransport};
pub use dispatch::ChangeEventDispatcher;
pub use manager::ConnectionManager;
pub use registry::{ChangeCallback, Subscription, SubscriptionRegistry, WireState};
