//! Error type for the realtime core.

use std::time::Duration;

use crmsync_shared::{FetchError, ProtocolError, ResourceKey};
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the connection, the subscription layer and the caches.
///
/// Cloneable so a single failure can be handed to every error listener.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("subscription to {key} failed after {attempts} attempt(s): {reason}")]
    SubscribeExhausted {
        key: ResourceKey,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{key}: no document with id {id}")]
    NotFound { key: ResourceKey, id: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task aborted: {0}")]
    Aborted(String),
}
