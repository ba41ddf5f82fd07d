//! In-process [`ListerWatcher`] holding its own snapshot and fanning change events
//! out to every live subscription.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mirra_core::{ChangeEvent, KeyError, KeyFunc, Object};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::backend::{BackendError, ListerWatcher, Subscription};

const DEFAULT_EVENT_BUFFER: usize = 1024;

struct State<T> {
    items: BTreeMap<String, T>,
    subscribers: Vec<mpsc::Sender<ChangeEvent<T>>>,
}

pub struct MemoryBackend<T> {
    key_func: KeyFunc<T>,
    buffer: usize,
    state: Mutex<State<T>>,
    fail_list: AtomicBool,
    fail_watch: AtomicBool,
    watches: AtomicUsize,
}

impl<T: Object + Clone + Send + Sync + 'static> MemoryBackend<T> {
    /// Backend whose per-subscription buffer comes from `MIRRA_EVENT_BUFFER` (default 1024).
    pub fn new(key_func: KeyFunc<T>) -> Self {
        let buffer = std::env::var("MIRRA_EVENT_BUFFER")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_EVENT_BUFFER);
        Self::with_buffer(key_func, buffer)
    }

    pub fn with_buffer(key_func: KeyFunc<T>, buffer: usize) -> Self {
        Self {
            key_func,
            buffer: buffer.max(1),
            state: Mutex::new(State { items: BTreeMap::new(), subscribers: Vec::new() }),
            fail_list: AtomicBool::new(false),
            fail_watch: AtomicBool::new(false),
            watches: AtomicUsize::new(0),
        }
    }

    /// Load objects into the snapshot without emitting events.
    pub fn seed(&self, items: impl IntoIterator<Item = T>) -> Result<(), KeyError> {
        let mut st = self.state.lock();
        for it in items {
            let key = (self.key_func)(&it)?;
            st.items.insert(key, it);
        }
        Ok(())
    }

    /// Store `obj` and emit `Added` or `Updated` depending on prior presence.
    pub fn apply(&self, obj: T) -> Result<(), KeyError> {
        let key = (self.key_func)(&obj)?;
        let mut st = self.state.lock();
        let existed = st.items.insert(key, obj.clone()).is_some();
        let event = if existed { ChangeEvent::updated(obj) } else { ChangeEvent::added(obj) };
        broadcast(&mut st.subscribers, event);
        Ok(())
    }

    /// Store `obj` and emit `Synced`.
    pub fn sync(&self, obj: T) -> Result<(), KeyError> {
        let key = (self.key_func)(&obj)?;
        let mut st = self.state.lock();
        st.items.insert(key, obj.clone());
        broadcast(&mut st.subscribers, ChangeEvent::synced(obj));
        Ok(())
    }

    /// Drop `obj`'s key and emit `Deleted` carrying `obj` as payload. Returns
    /// whether the key was present; nothing is emitted otherwise.
    pub fn remove(&self, obj: T) -> Result<bool, KeyError> {
        let key = (self.key_func)(&obj)?;
        let mut st = self.state.lock();
        if st.items.remove(&key).is_none() {
            return Ok(false);
        }
        broadcast(&mut st.subscribers, ChangeEvent::deleted(obj));
        Ok(true)
    }

    /// Forward a raw event to subscribers without touching the snapshot.
    pub fn emit(&self, event: ChangeEvent<T>) {
        broadcast(&mut self.state.lock().subscribers, event);
    }

    /// Close every live subscription, as a lost connection would.
    pub fn disconnect(&self) {
        let dropped = std::mem::take(&mut self.state.lock().subscribers);
        debug!(subscribers = dropped.len(), "memory backend disconnecting watchers");
    }

    pub fn set_list_failure(&self, fail: bool) { self.fail_list.store(fail, Ordering::SeqCst); }

    pub fn set_watch_failure(&self, fail: bool) { self.fail_watch.store(fail, Ordering::SeqCst); }

    /// Subscriptions whose receiving side is still open.
    pub fn subscriber_count(&self) -> usize {
        let mut st = self.state.lock();
        st.subscribers.retain(|tx| !tx.is_closed());
        st.subscribers.len()
    }

    /// Successful `watch` calls so far.
    pub fn watch_count(&self) -> usize { self.watches.load(Ordering::SeqCst) }

    pub fn len(&self) -> usize { self.state.lock().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

fn broadcast<T: Clone>(subscribers: &mut Vec<mpsc::Sender<ChangeEvent<T>>>, event: ChangeEvent<T>) {
    subscribers.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Closed(_)) => false,
        Err(TrySendError::Full(_)) => {
            // Slow consumer: cut it loose so it relists and resubscribes.
            warn!(kind = %event.kind, "subscriber buffer full, dropping subscription");
            false
        }
    });
}

#[async_trait::async_trait]
impl<T: Object + Clone + Send + Sync + 'static> ListerWatcher<T> for MemoryBackend<T> {
    async fn list(&self) -> Result<Vec<T>, BackendError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(BackendError::List("memory backend list failure injected".into()));
        }
        Ok(self.state.lock().items.values().cloned().collect())
    }

    async fn watch(&self) -> Result<Subscription<T>, BackendError> {
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(BackendError::Subscribe("memory backend watch failure injected".into()));
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        self.state.lock().subscribers.push(tx);
        self.watches.fetch_add(1, Ordering::SeqCst);
        Ok(Subscription::new(rx))
    }
}
