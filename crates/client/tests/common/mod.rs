//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use crmsync_client::shared::{
    ChangedCollection, ClientCommand, Document, FetchError, FetchParams, LoginPayload, ResourceKey,
    ServerEvent, SubscribeAck, WriteTarget, WsEnvelope,
};
use crmsync_client::{
    BackoffConfig, Credentials, FetchClient, SyncConfig, SyncError, Transport, TransportEvent,
    TransportEvents,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedSender};

// ── Config ──────────────────────────────────────────────────────

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        max_attempts: 3,
        initial_delay_ms: 100,
        max_delay_ms: 1000,
        backoff_multiplier: 2.0,
        jitter: 0.0,
    }
}

/// Default timeouts (30s heartbeat, 10s acks) with short, deterministic backoff.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        credentials: Credentials::new("mobile", "secret"),
        reconnect: fast_backoff(),
        subscribe_retry: fast_backoff(),
        ..SyncConfig::default()
    }
}

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

pub fn sales() -> ResourceKey {
    ResourceKey::new("sales", "sales")
}

/// Poll `cond` every 10ms of (virtual) time for up to 5 seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Collects every value passed to a listener.
pub fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |value: &T| sink.lock().unwrap().push(value.clone()))
}

// ── Transport ───────────────────────────────────────────────────

struct TransportState {
    events: Option<UnboundedSender<TransportEvent>>,
    connect_attempts: usize,
    connects: usize,
    fail_connects: u32,
    close_on_connect: bool,
    greet: bool,
    ack_login: bool,
    login_error: Option<String>,
    ack_subscribes: bool,
    subscribe_error: Option<String>,
    failing_subscribes: u32,
    sent: Vec<WsEnvelope<ClientCommand>>,
}

/// Scripted server: greets on connect, acknowledges logins and subscribes.
pub struct MockTransport {
    state: Mutex<TransportState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TransportState {
                events: None,
                connect_attempts: 0,
                connects: 0,
                fail_connects: 0,
                close_on_connect: false,
                greet: true,
                ack_login: true,
                login_error: None,
                ack_subscribes: true,
                subscribe_error: None,
                failing_subscribes: 0,
                sent: Vec::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.state().fail_connects = n;
    }

    /// Accept connections and close them straight away.
    pub fn set_close_on_connect(&self, close: bool) {
        self.state().close_on_connect = close;
    }

    pub fn set_ack_login(&self, ack: bool) {
        self.state().ack_login = ack;
    }

    pub fn set_login_error(&self, message: Option<&str>) {
        self.state().login_error = message.map(str::to_owned);
    }

    pub fn set_ack_subscribes(&self, ack: bool) {
        self.state().ack_subscribes = ack;
    }

    /// Answer every subscribe with this error.
    pub fn set_subscribe_error(&self, error: Option<&str>) {
        self.state().subscribe_error = error.map(str::to_owned);
    }

    /// Answer the next `n` subscribes with an error, then succeed.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.state().failing_subscribes = n;
    }

    pub fn push(&self, event: ServerEvent) {
        let state = self.state();
        let events = state.events.as_ref().expect("transport not connected");
        events
            .send(TransportEvent::Frame(WsEnvelope::new(event)))
            .expect("manager dropped the event stream");
    }

    pub fn push_change(&self, change: Value) {
        let change: ChangedCollection = serde_json::from_value(change).expect("valid change");
        self.push(ServerEvent::ChangedCollection(change));
    }

    /// Simulate the server closing the socket.
    pub fn drop_connection(&self) {
        let mut state = self.state();
        if let Some(events) = state.events.take() {
            let _ = events.send(TransportEvent::Closed {
                reason: "server went away".into(),
            });
        }
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn logins(&self) -> Vec<LoginPayload> {
        self.state()
            .sent
            .iter()
            .filter_map(|frame| match &frame.payload {
                ClientCommand::Login(login) => Some(login.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn subscribe_requests(&self) -> Vec<ResourceKey> {
        self.state()
            .sent
            .iter()
            .filter_map(|frame| match &frame.payload {
                ClientCommand::SubscribeCollection(key) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state().sent.clear();
    }

    fn reply(state: &TransportState, request: &WsEnvelope<ClientCommand>, event: ServerEvent) {
        if let Some(events) = &state.events {
            let _ = events.send(TransportEvent::Frame(WsEnvelope::reply_to(
                request.id.clone(),
                event,
            )));
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<TransportEvents, SyncError> {
        let mut state = self.state();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(SyncError::Transport("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if state.close_on_connect {
            let _ = tx.send(TransportEvent::Closed {
                reason: "closed on accept".into(),
            });
            return Ok(rx);
        }
        if state.greet {
            let _ = tx.send(TransportEvent::Frame(WsEnvelope::new(ServerEvent::Greeting(
                Some(json!({ "server": "mock" })),
            ))));
        }
        state.events = Some(tx);
        state.connects += 1;
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.state().events = None;
    }

    fn send(&self, frame: WsEnvelope<ClientCommand>) -> Result<(), SyncError> {
        let mut state = self.state();
        if state.events.is_none() {
            return Err(SyncError::ConnectionClosed);
        }

        match &frame.payload {
            ClientCommand::Login(_) => {
                if let Some(message) = state.login_error.clone() {
                    Self::reply(&state, &frame, ServerEvent::LoginError { message });
                } else if state.ack_login {
                    Self::reply(&state, &frame, ServerEvent::LoginAck);
                }
            }
            ClientCommand::SubscribeCollection(_) => {
                if state.ack_subscribes {
                    let error = if state.failing_subscribes > 0 {
                        state.failing_subscribes -= 1;
                        Some("temporarily unavailable".to_string())
                    } else {
                        state.subscribe_error.clone()
                    };
                    Self::reply(&state, &frame, ServerEvent::Ack(SubscribeAck { error }));
                }
            }
        }
        state.sent.push(frame);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().events.is_some()
    }
}

// ── Fetch client ────────────────────────────────────────────────

#[derive(Default)]
struct FetchState {
    docs: Vec<Document>,
    gets: Vec<FetchParams>,
    writes: Vec<(WriteTarget, Document)>,
    removes: Vec<WriteTarget>,
    fail_gets: bool,
    fail_writes: bool,
    fail_removes: bool,
    server_fields: Document,
    latency: Option<Duration>,
}

/// In-memory document store.
#[derive(Default)]
pub struct MockFetch {
    state: Mutex<FetchState>,
}

impl MockFetch {
    pub fn with_docs(docs: Vec<Value>) -> Arc<Self> {
        let fetch = Self::default();
        fetch.state().docs = docs.into_iter().map(doc).collect();
        Arc::new(fetch)
    }

    fn state(&self) -> MutexGuard<'_, FetchState> {
        self.state.lock().unwrap()
    }

    pub fn gets(&self) -> usize {
        self.state().gets.len()
    }

    pub fn last_get(&self) -> Option<FetchParams> {
        self.state().gets.last().cloned()
    }

    pub fn writes(&self) -> Vec<(WriteTarget, Document)> {
        self.state().writes.clone()
    }

    pub fn removes(&self) -> Vec<WriteTarget> {
        self.state().removes.clone()
    }

    pub fn set_docs(&self, docs: Vec<Value>) {
        self.state().docs = docs.into_iter().map(doc).collect();
    }

    pub fn fail_gets(&self, fail: bool) {
        self.state().fail_gets = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn fail_removes(&self, fail: bool) {
        self.state().fail_removes = fail;
    }

    /// Fields the store adds to (or overrides in) every written document.
    pub fn set_server_fields(&self, fields: Value) {
        self.state().server_fields = doc(fields);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    async fn wait(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, value)| doc.get(field) == Some(value))
}

#[async_trait]
impl FetchClient for MockFetch {
    async fn get(&self, _key: &ResourceKey, params: &FetchParams) -> Result<Vec<Document>, FetchError> {
        self.wait().await;
        let mut state = self.state();
        state.gets.push(params.clone());
        if state.fail_gets {
            return Err(FetchError::Network("offline".into()));
        }
        Ok(state
            .docs
            .iter()
            .filter(|doc| matches(doc, &params.filter))
            .cloned()
            .collect())
    }

    async fn write(
        &self,
        _key: &ResourceKey,
        target: &WriteTarget,
        data: &Document,
    ) -> Result<Document, FetchError> {
        self.wait().await;
        let mut state = self.state();
        state.writes.push((target.clone(), data.clone()));
        if state.fail_writes {
            return Err(FetchError::Rejected("write refused".into()));
        }
        let mut stored = data.clone();
        for (field, value) in &state.server_fields {
            stored.insert(field.clone(), value.clone());
        }
        Ok(stored)
    }

    async fn remove(&self, _key: &ResourceKey, target: &WriteTarget) -> Result<Value, FetchError> {
        self.wait().await;
        let mut state = self.state();
        state.removes.push(target.clone());
        if state.fail_removes {
            return Err(FetchError::Http {
                status: 500,
                body: "delete failed".into(),
            });
        }
        Ok(json!({ "deleted": 1 }))
    }
}
