//! Listener sets with snapshot delivery and panic isolation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Run a callback, logging and swallowing a panic. Returns `false` if it panicked.
pub(crate) fn call_isolated(label: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            crate::log_error!("{} panicked: {}", label, message);
            false
        }
    }
}

/// A set of callbacks notified with `&T`.
pub struct ListenerSet<T> {
    label: &'static str,
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<T>)>>,
}

impl<T: 'static> ListenerSet<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback; it stays registered until the guard is removed or dropped.
    pub fn add(self: &Arc<Self>, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push((id, Arc::new(callback)));

        let set = Arc::downgrade(self);
        ListenerGuard::new(move || {
            if let Some(set) = set.upgrade() {
                lock(&set.entries).retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Notify every listener registered at the time of the call.
    /// Returns how many ran without panicking.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<Callback<T>> =
            lock(&self.entries).iter().map(|(_, cb)| cb.clone()).collect();
        snapshot
            .into_iter()
            .filter(|cb| call_isolated(self.label, || cb(value)))
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

/// Unregisters a listener when removed or dropped.
#[must_use = "dropping the guard unregisters the listener; call `detach` to keep it"]
pub struct ListenerGuard {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerGuard {
    pub(crate) fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    pub fn remove(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keep the listener registered for the lifetime of its set.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
