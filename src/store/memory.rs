//! In-process [`Store`] implementation.
//!
//! Objects are held as JSON values keyed by kind, namespace and name, so any
//! [`Managed`] type can be stored without registration.  The model follows
//! the API server where the operator depends on it:
//!
//! * `resourceVersion` is bumped on every write and checked on replace;
//! * `create` drops `status`, `replace` keeps the stored status and
//!   `replace_status` touches nothing else;
//! * `metadata.generation` moves only when the spec changes;
//! * deleting an object with finalizers only stamps `deletionTimestamp`;
//!   the object disappears once a replace clears its finalizers;
//! * removing an object cascades to every object that lists its uid in
//!   `ownerReferences`, which is what the garbage collector does.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::debug;

use super::{selector, Managed, ObjectEvent, Store};
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn of<K: Managed>(namespace: &str, name: &str) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Replace,
    ReplaceStatus,
    Delete,
}

/// One mutating call made through the [`Store`] trait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub op: WriteOp,
    pub key: ObjectKey,
}

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub key: ObjectKey,
    pub event: ObjectEvent,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    counter: u64,
    writes: Vec<Write>,
    events: Vec<RecordedEvent>,
}

impl Inner {
    fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Remove `key` and everything that (transitively) names it as owner.
    /// Dependents with finalizers are only marked for deletion.
    fn remove_cascading(&mut self, key: &ObjectKey) {
        let mut queue = vec![key.clone()];
        while let Some(key) = queue.pop() {
            let Some(value) = self.objects.remove(&key) else {
                continue;
            };
            debug!(%key, "memory store: removed");
            let Some(uid) = meta_of(&value).uid else {
                continue;
            };
            let dependents: Vec<ObjectKey> = self
                .objects
                .iter()
                .filter(|(_, v)| {
                    meta_of(v)
                        .owner_references
                        .unwrap_or_default()
                        .iter()
                        .any(|o| o.uid == uid)
                })
                .map(|(k, _)| k.clone())
                .collect();
            for dep in dependents {
                if self.mark_or_remove(&dep) {
                    queue.push(dep);
                }
            }
        }
    }

    /// Stamp `deletionTimestamp` when finalizers remain.  Returns true when
    /// the object should be removed outright.
    fn mark_or_remove(&mut self, key: &ObjectKey) -> bool {
        let rv = self.next();
        let Some(value) = self.objects.get_mut(key) else {
            return false;
        };
        let meta = meta_of(value);
        if meta.finalizers.unwrap_or_default().is_empty() {
            return true;
        }
        if meta.deletion_timestamp.is_none() {
            set_meta_field(value, "deletionTimestamp", Value::String(now_rfc3339()));
            set_meta_field(value, "resourceVersion", Value::String(rv.to_string()));
        }
        false
    }
}

fn meta_of(value: &Value) -> ObjectMeta {
    value
        .get("metadata")
        .cloned()
        .and_then(|m| serde_json::from_value(m).ok())
        .unwrap_or_default()
}

fn set_meta_field(value: &mut Value, field: &str, v: Value) {
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(field.to_string(), v);
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Everything except metadata and status: what `generation` tracks.
fn desired_part(value: &Value) -> Value {
    let mut v = value.clone();
    if let Some(map) = v.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    v
}

fn check_version(key: &ObjectKey, stored: &Value, incoming: &ObjectMeta) -> Result<()> {
    let stored_rv = meta_of(stored).resource_version;
    match (&incoming.resource_version, &stored_rv) {
        (Some(theirs), Some(ours)) if theirs != ours => Err(Error::Conflict(format!(
            "{key}: resourceVersion {theirs} is stale (current {ours})"
        ))),
        _ => Ok(()),
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an object as-is, status included, filling in server-assigned
    /// metadata that is missing.  Not recorded as a write.
    pub fn seed<K: Managed>(&self, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        let ns = obj.namespace().unwrap_or_else(|| "default".to_string());
        let name = obj.name_any();
        let mut inner = self.lock();
        let uid = inner.next();
        let rv = inner.next();
        let meta = obj.meta_mut();
        meta.namespace = Some(ns.clone());
        meta.uid.get_or_insert_with(|| format!("uid-{uid}"));
        meta.resource_version = Some(rv.to_string());
        meta.generation.get_or_insert(1);
        meta.creation_timestamp.get_or_insert_with(|| Time(Utc::now()));
        let value = serde_json::to_value(&obj)?;
        inner.objects.insert(ObjectKey::of::<K>(&ns, &name), value.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Read-modify-write outside the controller's view: the change is not
    /// recorded as a write.  Used to simulate the executor and other actors.
    pub fn mutate<K: Managed>(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut K),
    ) -> Result<K> {
        let key = ObjectKey::of::<K>(namespace, name);
        let mut inner = self.lock();
        let rv = inner.next();
        let value = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let mut obj: K = serde_json::from_value(value)?;
        f(&mut obj);
        obj.meta_mut().resource_version = Some(rv.to_string());
        let value = serde_json::to_value(&obj)?;
        inner.objects.insert(key, value);
        Ok(obj)
    }

    pub fn contains<K: Managed>(&self, namespace: &str, name: &str) -> bool {
        self.lock()
            .objects
            .contains_key(&ObjectKey::of::<K>(namespace, name))
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.lock().events.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let key = ObjectKey::of::<K>(namespace, name);
        let value = self.lock().objects.get(&key).cloned();
        match value {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn list<K: Managed>(
        &self,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let values: Vec<Value> = self
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind && k.namespace == namespace)
            .map(|(_, v)| v.clone())
            .collect();
        let mut out = Vec::with_capacity(values.len());
        for v in values {
            let obj: K = serde_json::from_value(v)?;
            if selector.map_or(true, |s| selector::matches(s, obj.labels())) {
                out.push(obj);
            }
        }
        Ok(out)
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        let mut inner = self.lock();
        let name = match (obj.meta().name.clone(), obj.meta().generate_name.clone()) {
            (Some(name), _) if !name.is_empty() => name,
            (_, Some(prefix)) => format!("{prefix}{:05x}", inner.next()),
            _ => {
                return Err(Error::validation(format!(
                    "{}: metadata.name or metadata.generateName is required",
                    K::kind(&())
                )))
            }
        };
        let key = ObjectKey::of::<K>(namespace, &name);
        if inner.objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{key} already exists")));
        }
        let uid = inner.next();
        let rv = inner.next();
        let meta = obj.meta_mut();
        meta.name = Some(name);
        meta.namespace = Some(namespace.to_string());
        meta.uid = Some(format!("uid-{uid}"));
        meta.resource_version = Some(rv.to_string());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;

        let mut value = serde_json::to_value(&obj)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("status");
        }
        inner.objects.insert(key.clone(), value.clone());
        inner.writes.push(Write {
            op: WriteOp::Create,
            key,
        });
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: Managed>(&self, obj: &K) -> Result<K> {
        let ns = obj.namespace().unwrap_or_default();
        let key = ObjectKey::of::<K>(&ns, &obj.name_any());
        let mut inner = self.lock();
        let stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        check_version(&key, &stored, obj.meta())?;

        let current = meta_of(&stored);
        let rv = inner.next();
        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        meta.uid = current.uid.clone();
        meta.creation_timestamp = current.creation_timestamp.clone();
        meta.deletion_timestamp = current.deletion_timestamp.clone();
        meta.resource_version = Some(rv.to_string());

        let mut value = serde_json::to_value(&obj)?;
        let generation = current.generation.unwrap_or(1)
            + i64::from(desired_part(&value) != desired_part(&stored));
        set_meta_field(&mut value, "generation", Value::from(generation));
        if let Some(map) = value.as_object_mut() {
            match stored.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }

        inner.writes.push(Write {
            op: WriteOp::Replace,
            key: key.clone(),
        });
        let finalizers_cleared = obj.finalizers().is_empty();
        inner.objects.insert(key.clone(), value.clone());
        if current.deletion_timestamp.is_some() && finalizers_cleared {
            inner.remove_cascading(&key);
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn replace_status<K: Managed>(&self, obj: &K) -> Result<K> {
        let ns = obj.namespace().unwrap_or_default();
        let key = ObjectKey::of::<K>(&ns, &obj.name_any());
        let mut inner = self.lock();
        let mut stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        check_version(&key, &stored, obj.meta())?;

        let rv = inner.next();
        let incoming = serde_json::to_value(obj)?;
        if let Some(map) = stored.as_object_mut() {
            match incoming.get("status") {
                Some(status) if !status.is_null() => map.insert("status".to_string(), status.clone()),
                _ => map.remove("status"),
            };
        }
        set_meta_field(&mut stored, "resourceVersion", Value::String(rv.to_string()));
        inner.objects.insert(key.clone(), stored.clone());
        inner.writes.push(Write {
            op: WriteOp::ReplaceStatus,
            key,
        });
        Ok(serde_json::from_value(stored)?)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<bool> {
        let key = ObjectKey::of::<K>(namespace, name);
        let mut inner = self.lock();
        if !inner.objects.contains_key(&key) {
            return Ok(false);
        }
        inner.writes.push(Write {
            op: WriteOp::Delete,
            key: key.clone(),
        });
        if inner.mark_or_remove(&key) {
            inner.remove_cascading(&key);
        }
        Ok(true)
    }

    async fn publish_event<K: Managed>(&self, obj: &K, event: ObjectEvent) {
        let key = ObjectKey::of::<K>(&obj.namespace().unwrap_or_default(), &obj.name_any());
        self.lock().events.push(RecordedEvent { key, event });
    }
}
