//! Shared helpers for controller modules.
//!
//! Owner references, well-known labels and parent lookup.  Pure utility
//! functions (naming, hashing, configuration) live in `crate::helpers`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

/// Field manager name recorded on every write.
pub const FIELD_MANAGER: &str = "eksforge-operator";

/// Label naming the CAPI cluster an object belongs to.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label carrying the machine-template hash of a deployment revision.
pub const TEMPLATE_HASH_LABEL: &str = "eksforge.io/template-hash";

/// Label linking a Workspace back to its ApplyRequest.
pub const APPLY_REQUEST_LABEL: &str = "eksforge.io/apply-request";

const CAPI_GROUP_PREFIX: &str = "cluster.x-k8s.io/";

/// Build a controller OwnerReference for any kube-rs `Resource`.
///
/// The trait bound `K: Resource<DynamicType = ()>` means "any type whose
/// Kubernetes metadata is known at compile time", which holds for every
/// struct that derives `CustomResource`.
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// A plain (non-controller) owner link, used for the CAPI parent.
pub fn owner_ref<K: Resource<DynamicType = ()>>(obj: &K) -> OwnerReference {
    OwnerReference {
        controller: None,
        block_owner_deletion: None,
        ..controller_owner_ref(obj)
    }
}

fn api_group(api_version: &str) -> &str {
    api_version.split_once('/').map_or("", |(group, _)| group)
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    a.kind == b.kind && a.name == b.name && api_group(&a.api_version) == api_group(&b.api_version)
}

/// Add `oref` unless an owner with the same group, kind and name is already
/// recorded.  Returns true when `meta` changed.
pub fn ensure_owner_ref(meta: &mut ObjectMeta, oref: OwnerReference) -> bool {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    if refs.iter().any(|r| same_owner(r, &oref)) {
        return false;
    }
    refs.push(oref);
    true
}

/// Drop every owner reference pointing at `uid`.  Returns true when `meta`
/// changed.
pub fn remove_owner_ref(meta: &mut ObjectMeta, uid: &str) -> bool {
    let Some(refs) = meta.owner_references.as_mut() else {
        return false;
    };
    let before = refs.len();
    refs.retain(|r| r.uid != uid);
    let changed = refs.len() != before;
    if refs.is_empty() {
        meta.owner_references = None;
    }
    changed
}

pub fn is_owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.uid == uid)
}

/// Name of the CAPI cluster `meta` belongs to: the cluster-name label, or
/// failing that an owner reference of kind `Cluster` in the CAPI group.
pub fn cluster_name_of(meta: &ObjectMeta) -> Option<String> {
    if let Some(name) = meta
        .labels
        .as_ref()
        .and_then(|l| l.get(CLUSTER_NAME_LABEL))
        .filter(|n| !n.is_empty())
    {
        return Some(name.clone());
    }
    meta.owner_references
        .iter()
        .flatten()
        .find(|r| r.kind == "Cluster" && r.api_version.starts_with(CAPI_GROUP_PREFIX))
        .map(|r| r.name.clone())
}

/// True while the object is marked for deletion.
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}
