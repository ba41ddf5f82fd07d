//! Mirra core types: the object capability set, key derivation and watch events.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Annotation mapping carried by synchronized objects.
pub type Annotations = BTreeMap<String, String>;

/// Annotation naming the storage backend an object was read from.
pub const INNER_STORAGE_ANNOTATION: &str = "bk-bcs-inner-storage";
/// Value of [`INNER_STORAGE_ANNOTATION`] for the zookeeper backend, which cannot
/// deliver an object payload alongside a deletion.
pub const ZOOKEEPER_STORAGE: &str = "bkbcs-zookeeper";

/// Minimal capability a synchronized object must expose.
pub trait Object {
    fn namespace(&self) -> &str;
    fn name(&self) -> &str;
    fn annotations(&self) -> Option<&Annotations>;

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().and_then(|a| a.get(key)).map(String::as_str)
    }
}

impl<T: Object + ?Sized> Object for Arc<T> {
    fn namespace(&self) -> &str { (**self).namespace() }
    fn name(&self) -> &str { (**self).name() }
    fn annotations(&self) -> Option<&Annotations> { (**self).annotations() }
}

/// True when `obj` comes from a backend that never ships a payload with deletions.
///
/// Deletion events from such backends must be reported with the locally cached
/// object rather than the event's own (hollow) data.
pub fn omits_delete_payload<T: Object + ?Sized>(obj: &T) -> bool {
    obj.annotation(INNER_STORAGE_ANNOTATION) == Some(ZOOKEEPER_STORAGE)
}

/// Key derivation failure for a single object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot derive key for {namespace}/{name}: {reason}")]
pub struct KeyError {
    pub namespace: String,
    pub name: String,
    pub reason: String,
}

impl KeyError {
    pub fn new<T: Object + ?Sized>(obj: &T, reason: impl Into<String>) -> Self {
        Self { namespace: obj.namespace().to_string(), name: obj.name().to_string(), reason: reason.into() }
    }
}

/// Pure, deterministic mapping from an object to its store key.
pub type KeyFunc<T> = Arc<dyn Fn(&T) -> Result<String, KeyError> + Send + Sync>;

/// Default key: `namespace/name`, or just `name` for cluster-scoped objects.
pub fn namespace_key<T: Object + ?Sized>(obj: &T) -> Result<String, KeyError> {
    if obj.name().is_empty() {
        return Err(KeyError::new(obj, "object has no name"));
    }
    if obj.namespace().is_empty() {
        Ok(obj.name().to_string())
    } else {
        Ok(format!("{}/{}", obj.namespace(), obj.name()))
    }
}

/// [`namespace_key`] boxed as a [`KeyFunc`].
pub fn namespace_key_func<T: Object + 'static>() -> KeyFunc<T> {
    Arc::new(|obj: &T| namespace_key(obj))
}

/// Kind of a change observed on a watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
    Synced,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Synced => "synced",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One typed change delivered by a backend subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent<T> {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Object payload; absent on `Error` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ChangeEvent<T> {
    pub fn added(obj: T) -> Self { Self { kind: EventKind::Added, data: Some(obj) } }
    pub fn updated(obj: T) -> Self { Self { kind: EventKind::Updated, data: Some(obj) } }
    pub fn deleted(obj: T) -> Self { Self { kind: EventKind::Deleted, data: Some(obj) } }
    pub fn synced(obj: T) -> Self { Self { kind: EventKind::Synced, data: Some(obj) } }
    pub fn error() -> Self { Self { kind: EventKind::Error, data: None } }
}

/// General-purpose synchronized object: identity, annotations and an opaque JSON body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Resource {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl Resource {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), annotations: None, data: serde_json::Value::Null }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.get_or_insert_with(Annotations::new).insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

impl Object for Resource {
    fn namespace(&self) -> &str { &self.namespace }
    fn name(&self) -> &str { &self.name }
    fn annotations(&self) -> Option<&Annotations> { self.annotations.as_ref() }
}

pub mod prelude {
    pub use super::{
        namespace_key, namespace_key_func, omits_delete_payload, Annotations, ChangeEvent, EventKind, KeyError,
        KeyFunc, Object, Resource,
    };
}
