//! Routes `changed-collection` pushes to the observers of their key.

use std::sync::Arc;

use crmsync_shared::{ChangeEvent, ChangedCollection};

use super::registry::SubscriptionRegistry;
use crate::listeners::call_isolated;

pub struct ChangeEventDispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl ChangeEventDispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve a raw notification and deliver it. Malformed notifications
    /// are logged and dropped. Returns the number of observers that ran.
    pub fn dispatch(&self, change: ChangedCollection) -> usize {
        let key = change.resource_key();
        match change.into_change_event() {
            Ok(event) => self.deliver(&event),
            Err(e) => {
                crate::log_warn!("{}: dropping change notification: {}", key, e);
                0
            }
        }
    }

    /// Invoke every observer registered for the event's key at this moment,
    /// once each. A panicking observer is logged and skipped.
    pub fn deliver(&self, event: &ChangeEvent) -> usize {
        let observers = self.registry.observers(&event.key);
        if observers.is_empty() {
            crate::log_debug!("{}: no observers for {:?} event", event.key, event.kind);
            return 0;
        }
        observers
            .into_iter()
            .filter(|callback| call_isolated("change observer", || callback(event)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmsync_shared::ResourceKey;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn insert(db: &str, coll: &str) -> ChangedCollection {
        serde_json::from_value(json!({
            "operationType": "insert",
            "fullDocument": { "id": "s1", "no": 1001 },
            "ns": { "db": db, "coll": coll }
        }))
        .unwrap()
    }

    #[test]
    fn delivers_once_per_observer_of_the_key() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = ChangeEventDispatcher::new(registry.clone());
        let hits = Arc::new(AtomicUsize::new(0));

        let mut subs = Vec::new();
        for observer in ["a", "b", "c"] {
            let hits = hits.clone();
            subs.push(registry.subscribe(ResourceKey::new("sales", "sales"), observer, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let other_hits = hits.clone();
        let _other = registry.subscribe(ResourceKey::new("sales", "clients"), "d", move |_| {
            other_hits.fetch_add(100, Ordering::SeqCst);
        });

        assert_eq!(dispatcher.dispatch(insert("sales", "sales")), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn observer_unsubscribing_mid_dispatch_is_safe() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = ChangeEventDispatcher::new(registry.clone());
        let slot = Arc::new(std::sync::Mutex::new(None));

        let inner = slot.clone();
        let sub = registry.subscribe(ResourceKey::new("sales", "sales"), "a", move |_| {
            crate::listeners::lock(&inner).take();
        });
        *crate::listeners::lock(&slot) = Some(sub);

        assert_eq!(dispatcher.dispatch(insert("sales", "sales")), 1);
        assert_eq!(dispatcher.dispatch(insert("sales", "sales")), 0);
    }

    #[test]
    fn malformed_notification_is_dropped() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = ChangeEventDispatcher::new(registry.clone());
        let _sub = registry.subscribe(ResourceKey::new("sales", "sales"), "a", |_| {
            panic!("must not be called")
        });
        let change: ChangedCollection = serde_json::from_value(json!({
            "operationType": "invalidate",
            "ns": { "db": "sales", "coll": "sales" }
        }))
        .unwrap();
        assert_eq!(dispatcher.dispatch(change), 0);
    }
}
