//! A fetch-backed, push-updated collection with optimistic writes.
//!
//! Items are keyed by document id and never hold two documents with the same
//! id. Reads go through [`CacheEntry::ensure_fresh`], which only hits the
//! network when the requested result set differs from the one held. Push
//! events are merged with [`CacheEntry::apply_change_event`]. Writes are
//! visible immediately and rolled back if the store refuses them.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crmsync_shared::{
    document_id, ChangeEvent, Document, FetchParams, OperationKind, ResourceKey, WriteTarget,
    ID_FIELD,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::fingerprint::Fingerprint;
use crate::api_client::FetchClient;
use crate::error::{SyncError, SyncResult};
use crate::listeners::lock;

/// Outcome of [`CacheEntry::ensure_fresh`].
#[derive(Debug, Clone)]
pub struct Refresh {
    pub items: Vec<Document>,
    /// Whether the store was queried.
    pub fetched: bool,
    /// Set when the fetch failed; `items` are then the previous ones.
    pub error: Option<SyncError>,
}

#[derive(Default)]
struct EntryState {
    items: Vec<Document>,
    fingerprint: Option<Fingerprint>,
    stale: bool,
    active_item: Option<Document>,
    last_error: Option<SyncError>,
    loading: bool,
    writing: usize,
    /// Unconfirmed writes per document id.
    pending: HashMap<String, u32>,
    /// Events applied while a fetch was in flight, replayed over its result.
    missed: Vec<ChangeEvent>,
}

impl EntryState {
    fn position(&self, id: &str) -> Option<usize> {
        position(&self.items, id)
    }

    fn pending_write(&mut self, id: &str) {
        *self.pending.entry(id.to_string()).or_insert(0) += 1;
        self.writing += 1;
    }

    fn settle_write(&mut self, id: &str) {
        self.writing = self.writing.saturating_sub(1);
        if let Some(count) = self.pending.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(id);
            }
        }
    }

    fn active_is(&self, id: &str) -> bool {
        self.active_item
            .as_ref()
            .and_then(document_id)
            .is_some_and(|active| active == id)
    }
}

pub struct CacheEntry {
    key: ResourceKey,
    fetch: Arc<dyn FetchClient>,
    state: Mutex<EntryState>,
    /// Serialises fetches so concurrent callers share one round trip.
    fetch_lock: tokio::sync::Mutex<()>,
    revision: watch::Sender<u64>,
}

impl CacheEntry {
    pub fn new(key: ResourceKey, fetch: Arc<dyn FetchClient>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            key,
            fetch,
            state: Mutex::new(EntryState::default()),
            fetch_lock: tokio::sync::Mutex::new(()),
            revision,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Return items for `params`, fetching only if nothing was fetched yet,
    /// the entry was invalidated, `force` is set, or the filter, sort or
    /// projection differ from the ones behind the held items.
    ///
    /// A failed fetch keeps the previous items and reports the error
    /// alongside them.
    pub async fn ensure_fresh(&self, params: &FetchParams, force: bool) -> Refresh {
        let fingerprint = Fingerprint::of(params);
        if !force {
            if let Some(hit) = self.cached(&fingerprint) {
                return hit;
            }
        }

        let _fetching = self.fetch_lock.lock().await;
        // Someone may have fetched the same set while we waited.
        if !force {
            if let Some(hit) = self.cached(&fingerprint) {
                return hit;
            }
        }

        {
            let mut state = lock(&self.state);
            state.loading = true;
            state.missed.clear();
        }
        self.bump();
        crate::log_debug!("{}: fetching ({})", self.key, fingerprint);
        let result = self.fetch.get(&self.key, params).await;

        let refresh = {
            let mut state = lock(&self.state);
            state.loading = false;
            let missed = std::mem::take(&mut state.missed);
            match result {
                Ok(docs) => {
                    let mut items = unique_by_id(docs);
                    // The fetched snapshot may predate events seen meanwhile.
                    for event in &missed {
                        apply(&mut items, event);
                    }
                    overlay_pending(&mut items, &state);
                    if let Some(id) = state.active_item.as_ref().and_then(document_id) {
                        if let Some(pos) = position(&items, &id) {
                            state.active_item = Some(items[pos].clone());
                        }
                    }
                    state.items = items;
                    state.fingerprint = Some(fingerprint);
                    state.stale = false;
                    state.last_error = None;
                    Refresh {
                        items: state.items.clone(),
                        fetched: true,
                        error: None,
                    }
                }
                Err(e) => {
                    let error = SyncError::from(e);
                    crate::log_warn!("{}: fetch failed, keeping cached items: {}", self.key, error);
                    state.last_error = Some(error.clone());
                    Refresh {
                        items: state.items.clone(),
                        fetched: false,
                        error: Some(error),
                    }
                }
            }
        };
        self.bump();
        refresh
    }

    fn cached(&self, fingerprint: &Fingerprint) -> Option<Refresh> {
        let state = lock(&self.state);
        let fresh = !state.stale && state.fingerprint.as_ref() == Some(fingerprint);
        fresh.then(|| Refresh {
            items: state.items.clone(),
            fetched: false,
            error: None,
        })
    }

    /// Merge a pushed change into the held items. Returns whether anything changed.
    pub fn apply_change_event(&self, event: &ChangeEvent) -> bool {
        if event.key != self.key {
            return false;
        }
        let changed = {
            let mut state = lock(&self.state);
            if state.loading {
                state.missed.push(event.clone());
            }
            let changed = apply(&mut state.items, event);
            let active_changed = state.active_is(&event.document_id)
                && apply_to_active(&mut state.active_item, event);
            changed || active_changed
        };
        if changed {
            self.bump();
        }
        changed
    }

    /// Apply `patch` to the item `id` now and write it in the background.
    ///
    /// Without an id the patch's own `id` is used, or a fresh one is
    /// generated and the patch is inserted as a new item. The item counts as
    /// pending until the write settles. On success the stored document is
    /// merged over the optimistic one; on failure the item is restored.
    pub fn optimistic_write(self: &Arc<Self>, id: Option<&str>, patch: Document) -> PendingWrite<Document> {
        let id = id
            .map(str::to_owned)
            .or_else(|| document_id(&patch))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut data = patch;
        data.insert(ID_FIELD.to_string(), Value::String(id.clone()));

        let snapshot = {
            let mut state = lock(&self.state);
            let before = match state.position(&id) {
                Some(pos) => {
                    let before = state.items[pos].clone();
                    merge(&mut state.items[pos], &data);
                    Some(before)
                }
                None => {
                    state.items.push(data.clone());
                    None
                }
            };
            let active_before = if state.active_is(&id) {
                let previous = state.active_item.clone();
                if let Some(active) = state.active_item.as_mut() {
                    merge(active, &data);
                }
                previous
            } else {
                None
            };
            state.pending_write(&id);
            WriteSnapshot {
                item: before,
                active: active_before,
            }
        };
        self.bump();

        let entry = self.clone();
        let write_id = id.clone();
        let handle = tokio::spawn(async move { entry.confirm_write(write_id, data, snapshot).await });
        PendingWrite { id, handle }
    }

    async fn confirm_write(
        self: Arc<Self>,
        id: String,
        data: Document,
        snapshot: WriteSnapshot,
    ) -> SyncResult<Document> {
        let result = self
            .fetch
            .write(&self.key, &WriteTarget::Id(id.clone()), &data)
            .await;

        let outcome = {
            let mut state = lock(&self.state);
            state.settle_write(&id);
            match result {
                Ok(stored) => {
                    let confirmed = match state.position(&id) {
                        Some(pos) => {
                            merge(&mut state.items[pos], &stored);
                            let confirmed = state.items[pos].clone();
                            if let Some(new_id) = document_id(&confirmed).filter(|new| *new != id) {
                                drop_other_copies(&mut state.items, pos, &new_id);
                            }
                            confirmed
                        }
                        // Deleted while the write was in flight; do not resurrect it.
                        None => stored,
                    };
                    if state.active_is(&id) {
                        if let Some(active) = state.active_item.as_mut() {
                            merge(active, &confirmed);
                        }
                    }
                    Ok(confirmed)
                }
                Err(e) => {
                    let error = SyncError::from(e);
                    if let Some(pos) = state.position(&id) {
                        match snapshot.item {
                            Some(before) => state.items[pos] = before,
                            None => {
                                state.items.remove(pos);
                            }
                        }
                    }
                    if let Some(active) = snapshot.active {
                        if state.active_is(&id) {
                            state.active_item = Some(active);
                        }
                    }
                    state.last_error = Some(error.clone());
                    Err(error)
                }
            }
        };
        self.bump();

        if let Err(error) = &outcome {
            crate::log_warn!("{}: write of {} failed, rolled back: {}", self.key, id, error);
        }
        outcome
    }

    /// Remove `id` now and delete it in the background. If the store refuses,
    /// the item is put back at its previous position.
    pub fn delete(self: &Arc<Self>, id: &str) -> PendingWrite<()> {
        let removed = {
            let mut state = lock(&self.state);
            let removed = state.position(id).map(|pos| (pos, state.items.remove(pos)));
            let active = if state.active_is(id) {
                state.active_item.take()
            } else {
                None
            };
            state.pending_write(id);
            (removed, active)
        };
        self.bump();

        let entry = self.clone();
        let delete_id = id.to_string();
        let handle = tokio::spawn(async move { entry.confirm_delete(delete_id, removed).await });
        PendingWrite {
            id: id.to_string(),
            handle,
        }
    }

    async fn confirm_delete(
        self: Arc<Self>,
        id: String,
        removed: (Option<(usize, Document)>, Option<Document>),
    ) -> SyncResult<()> {
        let result = self
            .fetch
            .remove(&self.key, &WriteTarget::Id(id.clone()))
            .await;

        let outcome = {
            let mut state = lock(&self.state);
            state.settle_write(&id);
            match result {
                Ok(_) => Ok(()),
                Err(e) => {
                    let error = SyncError::from(e);
                    let (item, active) = removed;
                    if let Some((pos, doc)) = item {
                        if state.position(&id).is_none() {
                            let at = pos.min(state.items.len());
                            state.items.insert(at, doc);
                        }
                    }
                    if let Some(doc) = active {
                        if state.active_item.is_none() {
                            state.active_item = Some(doc);
                        }
                    }
                    state.last_error = Some(error.clone());
                    Err(error)
                }
            }
        };
        self.bump();

        if let Err(error) = &outcome {
            crate::log_warn!("{}: delete of {} failed, restored: {}", self.key, id, error);
        }
        outcome
    }

    /// Select `id` as the active item, from the held items or by fetching it.
    pub async fn load_active(&self, id: &str) -> SyncResult<Document> {
        let held = {
            let mut state = lock(&self.state);
            let held = state.position(id).map(|pos| state.items[pos].clone());
            if let Some(doc) = &held {
                state.active_item = Some(doc.clone());
            }
            held
        };
        if let Some(doc) = held {
            self.bump();
            return Ok(doc);
        }

        let params = FetchParams::new().filter(ID_FIELD, id).limit(1);
        let result = self.fetch.get(&self.key, &params).await;

        let outcome = {
            let mut state = lock(&self.state);
            match result {
                Ok(docs) => match docs.into_iter().next() {
                    Some(doc) => {
                        state.active_item = Some(doc.clone());
                        Ok(doc)
                    }
                    None => Err(SyncError::NotFound {
                        key: self.key.clone(),
                        id: id.to_string(),
                    }),
                },
                Err(e) => {
                    let error = SyncError::from(e);
                    state.last_error = Some(error.clone());
                    Err(error)
                }
            }
        };
        self.bump();
        outcome
    }

    pub fn active_item(&self) -> Option<Document> {
        lock(&self.state).active_item.clone()
    }

    pub fn clear_active(&self) {
        if lock(&self.state).active_item.take().is_some() {
            self.bump();
        }
    }

    pub fn items(&self) -> Vec<Document> {
        lock(&self.state).items.clone()
    }

    pub fn item(&self, id: &str) -> Option<Document> {
        let state = lock(&self.state);
        state.position(id).map(|pos| state.items[pos].clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    /// Whether any write or delete is still unconfirmed.
    pub fn is_saving(&self) -> bool {
        lock(&self.state).writing > 0
    }

    /// Whether `id` carries an unconfirmed optimistic change.
    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.state).pending.contains_key(id)
    }

    pub fn last_error(&self) -> Option<SyncError> {
        lock(&self.state).last_error.clone()
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        lock(&self.state).fingerprint.clone()
    }

    /// Force the next [`ensure_fresh`](Self::ensure_fresh) to refetch.
    pub fn invalidate(&self) {
        lock(&self.state).stale = true;
    }

    pub fn is_stale(&self) -> bool {
        lock(&self.state).stale
    }

    /// Revision counter, bumped on every visible change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("items", &state.items.len())
            .field("fingerprint", &state.fingerprint)
            .field("stale", &state.stale)
            .field("writing", &state.writing)
            .finish()
    }
}

struct WriteSnapshot {
    item: Option<Document>,
    active: Option<Document>,
}

/// An optimistic write or delete whose confirmation is still running.
///
/// Awaiting yields the store's verdict. Dropping it does not cancel the
/// write; rollback still happens on failure.
#[must_use = "await the write to learn whether the store accepted it"]
pub struct PendingWrite<T> {
    id: String,
    handle: JoinHandle<SyncResult<T>>,
}

impl<T> PendingWrite<T> {
    /// Id of the document being written.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for PendingWrite<T> {
    type Output = SyncResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(SyncError::Aborted(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn position(items: &[Document], id: &str) -> Option<usize> {
    items
        .iter()
        .position(|doc| document_id(doc).is_some_and(|doc_id| doc_id == id))
}

/// Shallow merge: top-level fields of `patch` overwrite those of `target`.
fn merge(target: &mut Document, patch: &Document) {
    for (field, value) in patch {
        target.insert(field.clone(), value.clone());
    }
}

fn with_id(mut doc: Document, id: &str) -> Document {
    if document_id(&doc).is_none() {
        doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    }
    doc
}

fn unique_by_id(docs: Vec<Document>) -> Vec<Document> {
    let mut seen = HashSet::new();
    docs.into_iter()
        .filter(|doc| match document_id(doc) {
            Some(id) => seen.insert(id),
            None => true,
        })
        .collect()
}

/// Keep unconfirmed local values visible over a freshly fetched list.
fn overlay_pending(items: &mut Vec<Document>, state: &EntryState) {
    for id in state.pending.keys() {
        let Some(local) = state.position(id).map(|pos| state.items[pos].clone()) else {
            continue;
        };
        match position(items, id) {
            Some(pos) => items[pos] = local,
            None => items.push(local),
        }
    }
}

fn drop_other_copies(items: &mut Vec<Document>, keep: usize, id: &str) {
    let mut index = 0;
    items.retain(|doc| {
        let other = index != keep && document_id(doc).is_some_and(|doc_id| doc_id == id);
        index += 1;
        !other
    });
}

/// Apply one change event to a list of documents. Idempotent.
pub(crate) fn apply(items: &mut Vec<Document>, event: &ChangeEvent) -> bool {
    let pos = position(items, &event.document_id);
    match event.kind {
        OperationKind::Insert => match (pos, &event.full_document) {
            (None, Some(doc)) => {
                items.push(with_id(doc.clone(), &event.document_id));
                true
            }
            _ => false,
        },
        OperationKind::Update => {
            let Some(pos) = pos else {
                return false;
            };
            let before = items[pos].clone();
            update_document(&mut items[pos], event);
            items[pos] != before
        }
        OperationKind::Delete => match pos {
            Some(pos) => {
                items.remove(pos);
                true
            }
            None => false,
        },
    }
}

fn apply_to_active(active: &mut Option<Document>, event: &ChangeEvent) -> bool {
    match event.kind {
        OperationKind::Delete => active.take().is_some(),
        OperationKind::Update => match active.as_mut() {
            Some(doc) => {
                let before = doc.clone();
                update_document(doc, event);
                *doc != before
            }
            None => false,
        },
        OperationKind::Insert => false,
    }
}

fn update_document(doc: &mut Document, event: &ChangeEvent) {
    match (&event.updated_fields, &event.full_document) {
        (Some(fields), _) => merge(doc, fields),
        // A replace carries the whole document instead of a field diff.
        (None, Some(full)) => *doc = with_id(full.clone(), &event.document_id),
        (None, None) => {}
    }
    for field in &event.removed_fields {
        doc.remove(field);
    }
}
