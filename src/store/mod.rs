//! Desired-state store seam.
//!
//! Reconcilers never talk to `kube::Api` directly: every read and write goes
//! through [`Store`].  [`KubeStore`] is the production implementation;
//! [`MemoryStore`] is an in-process model of the same contract (optimistic
//! concurrency, finalizers, owner-reference cascade) used by the tests.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub mod kube_store;
pub mod memory;
pub mod selector;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Any namespaced, statically-typed object the operator reads or writes.
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// A Kubernetes event attached to an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEvent {
    pub severity: EventSeverity,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

impl ObjectEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch one object; `None` when it does not exist.
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects in a namespace, optionally filtered by a label selector.
    async fn list<K: Managed>(
        &self,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<K>>;

    /// Create an object.  `metadata.generateName` is honoured when `name`
    /// is unset.  Fails with `Error::Conflict` when the name is taken.
    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace an object's metadata and spec.  The write carries the read
    /// `resourceVersion`; a stale version fails with `Error::Conflict`.
    async fn replace<K: Managed>(&self, obj: &K) -> Result<K>;

    /// Replace only the status subresource, with the same concurrency rule.
    async fn replace_status<K: Managed>(&self, obj: &K) -> Result<K>;

    /// Request deletion.  Returns `false` when the object was already gone.
    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Record an event against `obj`.  Never fails the caller.
    async fn publish_event<K: Managed>(&self, obj: &K, event: ObjectEvent);
}
