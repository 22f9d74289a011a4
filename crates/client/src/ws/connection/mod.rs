//! Connection state and the transport seam.
//!
//! The [`Transport`] trait is the only thing the connection manager knows
//! about the socket. [`WsTransport`] implements it with tokio-tungstenite;
//! tests substitute a scripted double.

use async_trait::async_trait;
use crmsync_shared::{ClientCommand, ServerEvent, WsEnvelope};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::SyncError;

/// Connection state of the realtime core
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Reconnecting { attempt: u32 },
    Errored { reason: String },
}

impl ConnectionState {
    /// The socket is open, whether or not login has completed.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Authenticating
                | ConnectionState::Authenticated
        )
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, ConnectionState::Authenticated)
    }
}

/// What an open transport reports back to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Frame(WsEnvelope<ServerEvent>),
    /// The socket is gone. No further events follow.
    Closed { reason: String },
}

pub type TransportEvents = UnboundedReceiver<TransportEvent>;

/// A duplex frame channel to the change-notification server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the socket. Inbound frames arrive on the returned receiver until
    /// a [`TransportEvent::Closed`] or the receiver ends.
    async fn connect(&self) -> Result<TransportEvents, SyncError>;

    /// Close the socket if open. Safe to call in any state.
    async fn disconnect(&self);

    /// Queue a frame for sending.
    fn send(&self, frame: WsEnvelope<ClientCommand>) -> Result<(), SyncError>;

    fn is_connected(&self) -> bool;
}

mod connection_native;
pub use connection_native::WsTransport;
