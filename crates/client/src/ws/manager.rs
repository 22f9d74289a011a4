//! The process-wide connection: connect, authenticate, heartbeat, reconnect.
//!
//! A single background task owns the transport session. Everything else talks
//! to it through a command channel, so frames are only ever written from one
//! place and registry drains happen only on the authenticated transition.
//!
//! ```text
//! Disconnected ─initialize─▶ Connecting ─▶ Connected ─greeting/login─▶ Authenticating
//!                                 ▲                                        │ login-ack
//!                                 │ drop / heartbeat                       ▼
//!                            Reconnecting ◀───────────────────────── Authenticated
//!                                 │ attempts exhausted
//!                                 ▼
//!                              Errored (keeps retrying)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crmsync_shared::{ChangeEvent, ClientCommand, LoginPayload, ResourceKey, ServerEvent, SubscribeAck, WsEnvelope};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::connection::{ConnectionState, Transport, TransportEvent, TransportEvents};
use super::dispatch::ChangeEventDispatcher;
use super::registry::{Subscription, SubscriptionRegistry, WatchRequest};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::listeners::{lock, ListenerGuard, ListenerSet};

/// How long `disconnect` waits for the connection task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Commands for the connection task.
pub(crate) enum ConnCmd {
    Watch(WatchRequest),
    AckTimeout { frame_id: String },
    ForceReconnect,
    Shutdown,
}

struct Runner {
    cmd_tx: UnboundedSender<ConnCmd>,
    task: JoinHandle<()>,
}

struct Inner {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: ChangeEventDispatcher,
    state: watch::Sender<ConnectionState>,
    state_listeners: Arc<ListenerSet<ConnectionState>>,
    error_listeners: Arc<ListenerSet<SyncError>>,
    authenticated: AtomicBool,
    runner: Mutex<Option<Runner>>,
    next_session: AtomicU64,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            crate::log_debug!("Connection state: {:?}", next);
            self.state_listeners.emit(&next);
        }
    }

    fn emit_error(&self, error: SyncError) {
        crate::log_warn!("Connection error: {}", error);
        self.error_listeners.emit(&error);
    }
}

/// Owns the one transport shared by every watcher in the process.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                dispatcher: ChangeEventDispatcher::new(registry.clone()),
                registry,
                state,
                state_listeners: Arc::new(ListenerSet::new("state listener")),
                error_listeners: Arc::new(ListenerSet::new("error listener")),
                authenticated: AtomicBool::new(false),
                runner: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Start connecting in the background. Returns `false` if the connection
    /// task is already running. Must be called inside a tokio runtime.
    pub fn initialize(&self) -> bool {
        let mut runner = lock(&self.inner.runner);
        if runner.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return false;
        }

        crate::log_info!("Connecting to {}", self.inner.config.socket_url);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(self.inner.clone(), cmd_tx.clone(), cmd_rx));
        *runner = Some(Runner { cmd_tx, task });
        true
    }

    /// Stop the connection task, close the transport and drop every
    /// subscription. Safe to call in any state; `initialize` may follow.
    pub async fn disconnect(&self) {
        let runner = lock(&self.inner.runner).take();
        if let Some(Runner { cmd_tx, mut task }) = runner {
            let _ = cmd_tx.send(ConnCmd::Shutdown);
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                crate::log_warn!("Connection task did not stop in {:?}; aborting", SHUTDOWN_GRACE);
                task.abort();
            }
        }
        self.inner.transport.disconnect().await;
        self.inner.registry.clear();
        self.inner.authenticated.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Force a disconnect/reconnect cycle on the running connection.
    pub fn reconnect(&self) {
        if let Some(runner) = lock(&self.inner.runner).as_ref() {
            let _ = runner.cmd_tx.send(ConnCmd::ForceReconnect);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    pub fn on_state_change(
        &self,
        callback: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.inner.state_listeners.add(callback)
    }

    pub fn on_error(&self, callback: impl Fn(&SyncError) + Send + Sync + 'static) -> ListenerGuard {
        self.inner.error_listeners.add(callback)
    }

    pub async fn wait_until_authenticated(&self, timeout: Duration) -> SyncResult<()> {
        let mut states = self.inner.state.subscribe();
        let outcome = tokio::time::timeout(timeout, states.wait_for(|s| s.is_authenticated())).await;
        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SyncError::ConnectionClosed),
            Err(_) => Err(SyncError::Timeout {
                operation: "authentication",
                timeout,
            }),
        }
    }

    /// Watch `key` as `observer_id`. See [`SubscriptionRegistry::subscribe`].
    pub fn subscribe(
        &self,
        key: ResourceKey,
        observer_id: impl Into<String>,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.registry.subscribe(key, observer_id, callback)
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("socket_url", &self.inner.config.socket_url)
            .finish()
    }
}

enum SessionExit {
    Shutdown,
    Dropped(String),
    Forced(String),
}

async fn run(
    inner: Arc<Inner>,
    cmd_tx: UnboundedSender<ConnCmd>,
    mut cmd_rx: UnboundedReceiver<ConnCmd>,
) {
    // Consecutive connect cycles that never reached Authenticated.
    let mut failures = 0u32;
    let mut recovering = false;
    let mut errored = false;

    inner.set_state(ConnectionState::Connecting);
    loop {
        let reason = match inner.transport.connect().await {
            Ok(events) => {
                inner.authenticated.store(false, Ordering::SeqCst);
                inner.set_state(ConnectionState::Connected);

                let exit = Session::new(&inner, &cmd_tx)
                    .drive(&mut cmd_rx, events, recovering)
                    .await;

                let authenticated = inner.authenticated.swap(false, Ordering::SeqCst);
                inner.registry.end_session();
                inner.transport.disconnect().await;
                if authenticated {
                    failures = 0;
                    errored = false;
                }

                match exit {
                    SessionExit::Shutdown => break,
                    SessionExit::Dropped(reason) => {
                        crate::log_warn!("Connection dropped: {}", reason);
                        reason
                    }
                    SessionExit::Forced(reason) => {
                        crate::log_warn!("Forcing reconnect: {}", reason);
                        reason
                    }
                }
            }
            Err(e) => {
                crate::log_warn!("Connect attempt {} failed: {}", failures + 1, e);
                e.to_string()
            }
        };

        failures += 1;
        recovering = true;

        let policy = &inner.config.reconnect;
        if policy.exhausted(failures) && !errored {
            errored = true;
            let reason = format!("{failures} connection attempts failed: {reason}");
            inner.set_state(ConnectionState::Errored {
                reason: reason.clone(),
            });
            inner.emit_error(SyncError::Transport(reason));
        } else if !errored {
            inner.set_state(ConnectionState::Reconnecting { attempt: failures });
        }

        let delay = policy.delay_for_attempt(failures - 1);
        crate::log_info!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_shutdown(&mut cmd_rx) => break,
        }
    }
    crate::log_info!("Connection task stopped");
}

/// Resolves on `Shutdown`, discarding commands that need a live session.
async fn wait_for_shutdown(cmd_rx: &mut UnboundedReceiver<ConnCmd>) {
    while let Some(cmd) = cmd_rx.recv().await {
        if matches!(cmd, ConnCmd::Shutdown) {
            return;
        }
    }
}

/// State of one open transport session.
struct Session<'a> {
    inner: &'a Inner,
    cmd_tx: &'a UnboundedSender<ConnCmd>,
    login_sent: bool,
    login_deadline: Option<Instant>,
    session: Option<u64>,
    /// Outstanding subscribe frames by frame id.
    pending_acks: HashMap<String, WatchRequest>,
    /// Keys with a delayed retry scheduled.
    retrying: HashSet<ResourceKey>,
}

impl<'a> Session<'a> {
    fn new(inner: &'a Inner, cmd_tx: &'a UnboundedSender<ConnCmd>) -> Self {
        Self {
            inner,
            cmd_tx,
            login_sent: false,
            login_deadline: None,
            session: None,
            pending_acks: HashMap::new(),
            retrying: HashSet::new(),
        }
    }

    async fn drive(
        mut self,
        cmd_rx: &mut UnboundedReceiver<ConnCmd>,
        mut events: TransportEvents,
        resumed: bool,
    ) -> SessionExit {
        if resumed {
            self.login();
        }

        let period = self.inner.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.login_deadline;
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Frame(frame)) => self.handle_frame(frame),
                    Some(TransportEvent::Closed { reason }) => return SessionExit::Dropped(reason),
                    None => return SessionExit::Dropped("transport event stream ended".into()),
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Watch(request)) => self.send_watch(request),
                    Some(ConnCmd::AckTimeout { frame_id }) => self.ack_timed_out(&frame_id),
                    Some(ConnCmd::ForceReconnect) => {
                        return SessionExit::Forced("reconnect requested".into())
                    }
                    Some(ConnCmd::Shutdown) | None => return SessionExit::Shutdown,
                },
                _ = heartbeat.tick() => {
                    if self.inner.transport.is_connected()
                        && !self.inner.authenticated.load(Ordering::SeqCst)
                    {
                        return SessionExit::Forced(format!(
                            "not authenticated within {:?}",
                            period
                        ));
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.login_deadline = None;
                    self.inner.emit_error(SyncError::Timeout {
                        operation: "login",
                        timeout: self.inner.config.handshake_timeout,
                    });
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: WsEnvelope<ServerEvent>) {
        match frame.payload {
            ServerEvent::Greeting(_) => {
                if self.login_sent {
                    crate::log_debug!("Greeting after login was sent; ignoring");
                } else {
                    self.login();
                }
            }
            ServerEvent::LoginAck => self.authenticated(),
            ServerEvent::LoginError { message } => {
                self.login_deadline = None;
                self.inner.emit_error(SyncError::Auth(message));
            }
            ServerEvent::Ack(ack) => self.handle_ack(frame.correlation_id, ack),
            ServerEvent::ChangedCollection(change) => {
                self.inner.dispatcher.dispatch(change);
            }
        }
    }

    fn login(&mut self) {
        self.inner.set_state(ConnectionState::Authenticating);
        let credentials = &self.inner.config.credentials;
        let frame = WsEnvelope::new(ClientCommand::Login(LoginPayload {
            alias: credentials.alias.clone(),
            secret_key: credentials.secret_key.clone(),
            data: String::new(),
        }));
        match self.inner.transport.send(frame) {
            Ok(()) => {
                crate::log_info!("Login sent as {}", credentials.alias);
                self.login_sent = true;
                self.login_deadline = Some(Instant::now() + self.inner.config.handshake_timeout);
            }
            Err(e) => crate::log_warn!("Failed to send login: {}", e),
        }
    }

    fn authenticated(&mut self) {
        if self.session.is_some() {
            crate::log_debug!("Duplicate login-ack ignored");
            return;
        }
        self.login_deadline = None;

        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        self.session = Some(id);
        self.inner.authenticated.store(true, Ordering::SeqCst);

        let keys = self.inner.registry.begin_session(id, self.cmd_tx.clone());
        crate::log_info!("Authenticated; subscribing {} collection(s)", keys.len());
        for key in keys {
            self.send_watch(WatchRequest {
                key,
                session: id,
                attempt: 0,
            });
        }
        self.inner.set_state(ConnectionState::Authenticated);
    }

    fn send_watch(&mut self, request: WatchRequest) {
        let Some(session) = self.session else {
            return;
        };
        if request.session != session {
            return;
        }
        if request.attempt > 0 {
            self.retrying.remove(&request.key);
        } else if self.retrying.contains(&request.key) {
            crate::log_debug!("{}: retry already scheduled", request.key);
            return;
        }
        if !self.inner.registry.needs_watch(&request.key, session) {
            return;
        }
        if self.pending_acks.values().any(|p| p.key == request.key) {
            crate::log_debug!("{}: subscribe already in flight", request.key);
            return;
        }

        let frame = WsEnvelope::new(ClientCommand::SubscribeCollection(request.key.clone()));
        let frame_id = frame.id.clone();
        match self.inner.transport.send(frame) {
            Ok(()) => {
                crate::log_debug!("{}: subscribe sent (attempt {})", request.key, request.attempt + 1);
                self.pending_acks.insert(frame_id.clone(), request);
                let cmd_tx = self.cmd_tx.clone();
                let timeout = self.inner.config.subscribe_ack_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = cmd_tx.send(ConnCmd::AckTimeout { frame_id });
                });
            }
            Err(e) => self.watch_failed(request, e.to_string()),
        }
    }

    fn handle_ack(&mut self, correlation_id: Option<String>, ack: SubscribeAck) {
        let Some(request) = correlation_id.and_then(|id| self.pending_acks.remove(&id)) else {
            crate::log_debug!("Ack without a matching subscribe; ignoring");
            return;
        };
        match ack.error {
            None => {
                crate::log_info!("{}: watching", request.key);
                self.inner.registry.mark_watched(&request.key, request.session);
            }
            Some(error) => self.watch_failed(request, error),
        }
    }

    fn ack_timed_out(&mut self, frame_id: &str) {
        if let Some(request) = self.pending_acks.remove(frame_id) {
            let timeout = self.inner.config.subscribe_ack_timeout;
            self.watch_failed(request, format!("no ack within {timeout:?}"));
        }
    }

    fn watch_failed(&mut self, request: WatchRequest, reason: String) {
        let attempts = request.attempt + 1;
        let policy = &self.inner.config.subscribe_retry;

        if policy.exhausted(attempts) {
            crate::log_error!(
                "{}: subscribe failed after {} attempt(s): {}",
                request.key,
                attempts,
                reason
            );
            self.inner.registry.mark_failed(&request.key, request.session);
            self.inner.emit_error(SyncError::SubscribeExhausted {
                key: request.key,
                attempts,
                reason,
            });
            return;
        }
        if !self.inner.registry.needs_watch(&request.key, request.session) {
            return;
        }

        let delay = policy.delay_for_attempt(request.attempt);
        crate::log_warn!(
            "{}: subscribe failed ({}); retrying in {:?}",
            request.key,
            reason,
            delay
        );
        self.retrying.insert(request.key.clone());
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(ConnCmd::Watch(WatchRequest {
                attempt: attempts,
                ..request
            }));
        });
    }
}
