//! WebSocket transport using tokio-tungstenite.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crmsync_shared::{ClientCommand, ServerEvent, WsEnvelope};
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{Transport, TransportEvent, TransportEvents};
use crate::error::SyncError;
use crate::listeners::lock;

/// One open socket: the outbound queue plus its reader and writer tasks.
struct Link {
    sender: UnboundedSender<WsEnvelope<ClientCommand>>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn shutdown(self) {
        self.connected.store(false, Ordering::SeqCst);
        // Closing the queue lets the writer flush and send a close frame.
        self.sender.close_channel();
        self.reader.abort();
        drop(self.writer);
    }
}

/// [`Transport`] over a single tokio-tungstenite WebSocket.
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
    link: Mutex<Option<Link>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            link: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<TransportEvents, SyncError> {
        if let Some(old) = lock(&self.link).take() {
            old.shutdown();
        }

        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| SyncError::Timeout {
                    operation: "connect",
                    timeout: self.connect_timeout,
                })?
                .map_err(|e| SyncError::Transport(e.to_string()))?;
        crate::log_info!("WebSocket connected to {}", self.url);

        let (mut write, mut read) = ws_stream.split();
        let (sender, mut outgoing) = unbounded::<WsEnvelope<ClientCommand>>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let connected_for_read = connected.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        crate::log_debug!("WebSocket received: {}", text.as_str());
                        match serde_json::from_str::<WsEnvelope<ServerEvent>>(text.as_str()) {
                            Ok(frame) => {
                                if events_tx.send(TransportEvent::Frame(frame)).is_err() {
                                    break "receiver dropped".to_string();
                                }
                            }
                            Err(e) => crate::log_warn!("Failed to parse frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by server ({}): {}", f.code, f.reason.as_str()))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {
                        // Pong is handled by tungstenite; binary frames are not part of the protocol.
                    }
                    Some(Err(e)) => break format!("read error: {e}"),
                    None => break "stream ended".to_string(),
                }
            };
            connected_for_read.store(false, Ordering::SeqCst);
            let _ = events_tx.send(TransportEvent::Closed { reason });
        });

        let connected_for_write = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing.next().await {
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        crate::log_debug!("Sending: {}", json);
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            crate::log_warn!("Send failed: {}", e);
                            connected_for_write.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    Err(e) => crate::log_error!("Serialize failed: {}", e),
                }
            }
            let _ = write.close().await;
        });

        *lock(&self.link) = Some(Link {
            sender,
            connected,
            reader,
            writer,
        });
        Ok(events_rx)
    }

    async fn disconnect(&self) {
        if let Some(link) = lock(&self.link).take() {
            crate::log_info!("Closing WebSocket to {}", self.url);
            link.shutdown();
        }
    }

    fn send(&self, frame: WsEnvelope<ClientCommand>) -> Result<(), SyncError> {
        let link = lock(&self.link);
        let link = link.as_ref().ok_or(SyncError::ConnectionClosed)?;
        link.sender
            .unbounded_send(frame)
            .map_err(|_| SyncError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        lock(&self.link)
            .as_ref()
            .is_some_and(|link| link.connected.load(Ordering::SeqCst))
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}
