//! Reference-counted wire subscriptions keyed by [`ResourceKey`].
//!
//! Any number of observers may watch a key; the server sees a single
//! `subscribe-collection` per key and authenticated session. Keys watched
//! before authentication wait in a FIFO queue that the connection manager
//! drains when the session starts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crmsync_shared::{ChangeEvent, ResourceKey};
use tokio::sync::mpsc::UnboundedSender;

use super::manager::ConnCmd;
use crate::listeners::lock;

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Wire-level status of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
    /// Waiting for an authenticated session.
    Pending,
    /// Subscribe frame sent, ack outstanding (or a retry is scheduled).
    InFlight,
    /// Acknowledged by the server.
    Watching,
    /// Retries exhausted for this session.
    Failed,
}

/// A subscribe the connection manager should put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WatchRequest {
    pub key: ResourceKey,
    pub session: u64,
    pub attempt: u32,
}

struct Observer {
    id: String,
    token: u64,
    callback: ChangeCallback,
}

struct KeyEntry {
    observers: Vec<Observer>,
    wire: WireState,
}

struct Session {
    id: u64,
    sink: UnboundedSender<ConnCmd>,
    /// Keys the server acknowledged in this session. There is no unwatch
    /// frame, so these stay live server-side even after local release.
    watched: HashSet<ResourceKey>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<ResourceKey, KeyEntry>,
    pending: VecDeque<ResourceKey>,
    session: Option<Session>,
}

pub struct SubscriptionRegistry {
    next_token: AtomicU64,
    state: Mutex<RegistryState>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Register `callback` as `observer_id` for `key`.
    ///
    /// The first observer of a key requests the wire subscription, or queues
    /// it if no session is authenticated. Registering an observer id that is
    /// already present replaces its callback.
    pub fn subscribe(
        self: &Arc<Self>,
        key: ResourceKey,
        observer_id: impl Into<String>,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let observer_id = observer_id.into();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let callback: ChangeCallback = Arc::new(callback);

        let mut state = lock(&self.state);
        let first = !state.entries.contains_key(&key);
        let entry = state.entries.entry(key.clone()).or_insert_with(|| KeyEntry {
            observers: Vec::new(),
            wire: WireState::Pending,
        });

        match entry.observers.iter_mut().find(|o| o.id == observer_id) {
            Some(existing) => {
                crate::log_debug!("{}: replacing observer {}", key, observer_id);
                existing.token = token;
                existing.callback = callback;
            }
            None => entry.observers.push(Observer {
                id: observer_id,
                token,
                callback,
            }),
        }

        if first {
            state.request_wire(&key);
        }
        drop(state);

        Subscription {
            registry: Arc::downgrade(self),
            key,
            token,
        }
    }

    fn release(&self, key: &ResourceKey, token: u64) {
        let mut state = lock(&self.state);
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        entry.observers.retain(|o| o.token != token);
        if entry.observers.is_empty() {
            state.entries.remove(key);
            state.pending.retain(|k| k != key);
            crate::log_debug!("{}: last observer released", key);
        }
    }

    /// Snapshot of the callbacks currently registered for `key`.
    pub fn observers(&self, key: &ResourceKey) -> Vec<ChangeCallback> {
        lock(&self.state)
            .entries
            .get(key)
            .map(|entry| entry.observers.iter().map(|o| o.callback.clone()).collect())
            .unwrap_or_default()
    }

    pub fn observer_count(&self, key: &ResourceKey) -> usize {
        lock(&self.state)
            .entries
            .get(key)
            .map_or(0, |entry| entry.observers.len())
    }

    /// Keys with at least one live observer, sorted.
    pub fn live_keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = lock(&self.state).entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys queued for the next session, in FIFO order.
    pub fn pending_keys(&self) -> Vec<ResourceKey> {
        lock(&self.state).pending.iter().cloned().collect()
    }

    pub fn wire_state(&self, key: &ResourceKey) -> Option<WireState> {
        lock(&self.state).entries.get(key).map(|entry| entry.wire)
    }

    /// Start an authenticated session. Returns the keys to subscribe:
    /// the pending queue in FIFO order, then every other live key.
    pub(crate) fn begin_session(&self, id: u64, sink: UnboundedSender<ConnCmd>) -> Vec<ResourceKey> {
        let mut state = lock(&self.state);
        state.session = Some(Session {
            id,
            sink,
            watched: HashSet::new(),
        });

        let mut keys: Vec<ResourceKey> = Vec::with_capacity(state.entries.len());
        while let Some(key) = state.pending.pop_front() {
            if state.entries.contains_key(&key) && !keys.contains(&key) {
                keys.push(key);
            }
        }
        let mut rest: Vec<ResourceKey> = state
            .entries
            .keys()
            .filter(|key| !keys.contains(key))
            .cloned()
            .collect();
        rest.sort();
        keys.extend(rest);

        for key in &keys {
            if let Some(entry) = state.entries.get_mut(key) {
                entry.wire = WireState::InFlight;
            }
        }
        keys
    }

    /// The session is over; every live key waits for the next one.
    pub(crate) fn end_session(&self) {
        let mut state = lock(&self.state);
        state.session = None;
        for entry in state.entries.values_mut() {
            entry.wire = WireState::Pending;
        }
    }

    /// Whether a subscribe for `key` still belongs on the wire in `session`.
    pub(crate) fn needs_watch(&self, key: &ResourceKey, session: u64) -> bool {
        let state = lock(&self.state);
        let current = state
            .session
            .as_ref()
            .is_some_and(|s| s.id == session && !s.watched.contains(key));
        current
            && state
                .entries
                .get(key)
                .is_some_and(|entry| entry.wire != WireState::Watching)
    }

    pub(crate) fn mark_watched(&self, key: &ResourceKey, session: u64) {
        let mut state = lock(&self.state);
        match state.session.as_mut() {
            Some(s) if s.id == session => {
                s.watched.insert(key.clone());
            }
            _ => return,
        }
        if let Some(entry) = state.entries.get_mut(key) {
            entry.wire = WireState::Watching;
        }
    }

    pub(crate) fn mark_failed(&self, key: &ResourceKey, session: u64) {
        let mut state = lock(&self.state);
        if state.session.as_ref().map(|s| s.id) != Some(session) {
            return;
        }
        if let Some(entry) = state.entries.get_mut(key) {
            entry.wire = WireState::Failed;
        }
    }

    /// Drop every observer, the pending queue and the session.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.pending.clear();
        state.session = None;
    }
}

impl RegistryState {
    fn request_wire(&mut self, key: &ResourceKey) {
        let RegistryState {
            entries,
            pending,
            session,
        } = self;
        let Some(entry) = entries.get_mut(key) else {
            return;
        };

        match session {
            Some(session) if session.watched.contains(key) => {
                entry.wire = WireState::Watching;
            }
            Some(session) => {
                let request = WatchRequest {
                    key: key.clone(),
                    session: session.id,
                    attempt: 0,
                };
                if session.sink.send(ConnCmd::Watch(request)).is_ok() {
                    entry.wire = WireState::InFlight;
                } else {
                    entry.wire = WireState::Pending;
                    pending.push_back(key.clone());
                }
            }
            None => {
                entry.wire = WireState::Pending;
                if !pending.contains(key) {
                    pending.push_back(key.clone());
                }
            }
        }
    }
}

/// Handle for one registered observer. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<SubscriptionRegistry>,
    key: ResourceKey,
    token: u64,
}

impl Subscription {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.key, self.token);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn key(coll: &str) -> ResourceKey {
        ResourceKey::new("sales", coll)
    }

    #[test]
    fn keys_queue_until_a_session_starts() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let _a = registry.subscribe(key("orders"), "a", |_| {});
        let _b = registry.subscribe(key("clients"), "b", |_| {});
        let _c = registry.subscribe(key("orders"), "c", |_| {});

        assert_eq!(registry.pending_keys(), vec![key("orders"), key("clients")]);
        assert_eq!(registry.wire_state(&key("orders")), Some(WireState::Pending));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(registry.begin_session(1, tx), vec![key("orders"), key("clients")]);
        assert!(registry.pending_keys().is_empty());
        assert_eq!(registry.wire_state(&key("clients")), Some(WireState::InFlight));
    }

    #[test]
    fn first_observer_in_a_session_requests_one_watch() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.begin_session(7, tx);

        let _a = registry.subscribe(key("orders"), "a", |_| {});
        let _b = registry.subscribe(key("orders"), "b", |_| {});

        match rx.try_recv() {
            Ok(ConnCmd::Watch(request)) => {
                assert_eq!(request.key, key("orders"));
                assert_eq!(request.session, 7);
                assert_eq!(request.attempt, 0);
            }
            _ => panic!("expected a watch request"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn releasing_last_observer_clears_bookkeeping() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let a = registry.subscribe(key("orders"), "a", |_| {});
        let b = registry.subscribe(key("orders"), "b", |_| {});

        a.unsubscribe();
        assert_eq!(registry.observer_count(&key("orders")), 1);
        drop(b);
        assert_eq!(registry.observer_count(&key("orders")), 0);
        assert!(registry.pending_keys().is_empty());
        assert!(registry.live_keys().is_empty());
    }

    #[test]
    fn rewatch_within_session_reuses_server_watch() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.begin_session(1, tx);

        let first = registry.subscribe(key("orders"), "a", |_| {});
        assert!(rx.try_recv().is_ok());
        registry.mark_watched(&key("orders"), 1);
        drop(first);

        let _again = registry.subscribe(key("orders"), "a", |_| {});
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.wire_state(&key("orders")), Some(WireState::Watching));
    }

    #[test]
    fn same_observer_id_replaces_callback() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let old = registry.subscribe(key("orders"), "cache", |_| {});
        let _new = registry.subscribe(key("orders"), "cache", |_| {});
        assert_eq!(registry.observers(&key("orders")).len(), 1);

        // The replaced handle no longer owns the observer.
        drop(old);
        assert_eq!(registry.observer_count(&key("orders")), 1);
    }

    #[test]
    fn stale_session_acks_are_ignored() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let _a = registry.subscribe(key("orders"), "a", |_| {});
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.begin_session(2, tx);

        registry.mark_watched(&key("orders"), 1);
        assert_eq!(registry.wire_state(&key("orders")), Some(WireState::InFlight));
        assert!(registry.needs_watch(&key("orders"), 2));
        assert!(!registry.needs_watch(&key("orders"), 1));
    }
}
