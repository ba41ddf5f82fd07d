//! Mirra store: a concurrency-safe map from derived keys to objects.
//!
//! Writers take an exclusive lock, readers a shared one. Values come back as
//! clones; use `Arc<_>` as the item type to share instead of copy.

#![forbid(unsafe_code)]

use std::sync::Arc;

use mirra_core::{KeyError, KeyFunc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("no entry for key {key}")]
    NotFound { key: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Keyed object store. `add` and `update` are both upserts; telling them apart is
/// the caller's job.
pub trait Store<T>: Send + Sync {
    fn add(&self, obj: T) -> StoreResult<()>;
    fn update(&self, obj: T) -> StoreResult<()>;
    fn delete(&self, obj: &T) -> StoreResult<()>;
    /// Fails only when the key cannot be derived.
    fn get(&self, obj: &T) -> StoreResult<Option<T>>;
    fn get_by_key(&self, key: &str) -> Option<T>;
    fn list(&self) -> Vec<T>;
    fn list_keys(&self) -> Vec<String>;
    fn count(&self) -> usize;
    fn clear(&self);
    /// Upsert every item; entries missing from `items` stay.
    fn replace(&self, items: Vec<T>) -> StoreResult<()>;
    /// Swap the whole content for `items`.
    fn reset(&self, items: Vec<T>) -> StoreResult<()>;

    /// Insert `obj` and hand back the entry it displaced, under one write lock.
    fn upsert(&self, obj: T) -> StoreResult<Option<T>>;
    /// Remove the entry for `obj`'s key and hand it back, under one write lock.
    fn take(&self, obj: &T) -> StoreResult<Option<T>>;
}

/// [`Store`] backed by an `FxHashMap` under a read/write lock.
pub struct Cache<T> {
    name: String,
    key_func: KeyFunc<T>,
    items: RwLock<FxHashMap<String, T>>,
}

impl<T> Cache<T> {
    pub fn new(name: impl Into<String>, key_func: KeyFunc<T>) -> Self {
        Self { name: name.into(), key_func, items: RwLock::new(FxHashMap::default()) }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn key_of(&self, obj: &T) -> StoreResult<String> { Ok((self.key_func)(obj)?) }

    fn keyed(&self, items: Vec<T>) -> StoreResult<Vec<(String, T)>> {
        items.into_iter().map(|it| -> StoreResult<(String, T)> { Ok(((self.key_func)(&it)?, it)) }).collect()
    }

    fn record_len(&self, len: usize) {
        metrics::gauge!("store_items", len as f64, "store" => self.name.clone());
    }

    fn swap_in(&self, obj: T) -> StoreResult<Option<T>> {
        let key = self.key_of(&obj)?;
        let mut items = self.items.write();
        let prev = items.insert(key, obj);
        self.record_len(items.len());
        Ok(prev)
    }
}

impl<T: Clone + Send + Sync> Store<T> for Cache<T> {
    fn add(&self, obj: T) -> StoreResult<()> { self.swap_in(obj).map(|_| ()) }

    fn update(&self, obj: T) -> StoreResult<()> { self.swap_in(obj).map(|_| ()) }

    fn delete(&self, obj: &T) -> StoreResult<()> {
        match self.take(obj)? {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound { key: self.key_of(obj)? }),
        }
    }

    fn get(&self, obj: &T) -> StoreResult<Option<T>> {
        let key = self.key_of(obj)?;
        Ok(self.items.read().get(&key).cloned())
    }

    fn get_by_key(&self, key: &str) -> Option<T> { self.items.read().get(key).cloned() }

    fn list(&self) -> Vec<T> { self.items.read().values().cloned().collect() }

    fn list_keys(&self) -> Vec<String> { self.items.read().keys().cloned().collect() }

    fn count(&self) -> usize { self.items.read().len() }

    fn clear(&self) {
        self.items.write().clear();
        self.record_len(0);
    }

    fn replace(&self, items: Vec<T>) -> StoreResult<()> {
        // Keys are derived before locking so a bad item leaves the map untouched.
        let keyed = self.keyed(items)?;
        let mut map = self.items.write();
        map.extend(keyed);
        self.record_len(map.len());
        Ok(())
    }

    fn reset(&self, items: Vec<T>) -> StoreResult<()> {
        let keyed = self.keyed(items)?;
        let fresh: FxHashMap<String, T> = keyed.into_iter().collect();
        let len = fresh.len();
        *self.items.write() = fresh;
        self.record_len(len);
        trace!(store = %self.name, count = len, "store reset");
        Ok(())
    }

    fn upsert(&self, obj: T) -> StoreResult<Option<T>> { self.swap_in(obj) }

    fn take(&self, obj: &T) -> StoreResult<Option<T>> {
        let key = self.key_of(obj)?;
        let mut items = self.items.write();
        let prev = items.remove(&key);
        if prev.is_some() {
            self.record_len(items.len());
        }
        Ok(prev)
    }
}

/// Read-only view over a shared store.
pub struct Reader<T> {
    inner: Arc<dyn Store<T>>,
}

impl<T> Clone for Reader<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T> Reader<T> {
    pub fn new(inner: Arc<dyn Store<T>>) -> Self { Self { inner } }

    pub fn get(&self, obj: &T) -> StoreResult<Option<T>> { self.inner.get(obj) }
    pub fn get_by_key(&self, key: &str) -> Option<T> { self.inner.get_by_key(key) }
    pub fn list(&self) -> Vec<T> { self.inner.list() }
    pub fn list_keys(&self) -> Vec<String> { self.inner.list_keys() }
    pub fn count(&self) -> usize { self.inner.count() }
}
