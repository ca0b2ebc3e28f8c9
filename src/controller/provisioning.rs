//! Owning ApplyRequests on behalf of the cluster, control-plane and machine
//! reconcilers: get-or-create with a deterministic name, and release on the
//! delete path.

use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::crd::apply_request::{ApplyRequest, ApplyRequestSpec};
use crate::error::{Error, Result};
use crate::store::{Managed, Store};

use super::helpers::{controller_owner_ref, remove_owner_ref, CLUSTER_NAME_LABEL};

/// Get or create the ApplyRequest `name`, owned by `owner`.  The stored spec
/// is replaced only when it differs from `spec`.
pub async fn ensure_apply_request<K: Managed, S: Store>(
    store: &S,
    owner: &K,
    name: &str,
    spec: ApplyRequestSpec,
    cluster_name: Option<&str>,
) -> Result<ApplyRequest> {
    let ns = owner.namespace().unwrap_or_default();
    match store.get::<ApplyRequest>(&ns, name).await? {
        Some(existing) if existing.spec == spec => Ok(existing),
        Some(existing) => {
            info!(%ns, %name, "updating apply request spec");
            let mut updated = existing;
            updated.spec = spec;
            store.replace(&updated).await
        }
        None => {
            info!(%ns, %name, owner = %owner.name_any(), "creating apply request");
            let labels = cluster_name
                .map(|c| [(CLUSTER_NAME_LABEL.to_string(), c.to_string())].into());
            let request = ApplyRequest {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(ns.clone()),
                    labels,
                    owner_references: Some(vec![controller_owner_ref(owner)]),
                    ..Default::default()
                },
                spec,
                status: None,
            };
            store.create(&ns, &request).await
        }
    }
}

/// Outcome of releasing one owned ApplyRequest on the delete path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Absent, or retained and detached: the owner may go.
    Gone,
    /// Deletion requested; still present.
    Pending,
}

/// Release the ApplyRequest `name` owned by `owner`.  Retained requests are
/// detached by stripping the owner link; the rest are deleted and reported
/// `Pending` until the store confirms they are absent.
pub async fn release_apply_request<K: Managed, S: Store>(
    store: &S,
    owner: &K,
    name: &str,
) -> Result<Release> {
    let ns = owner.namespace().unwrap_or_default();
    let Some(request) = store.get::<ApplyRequest>(&ns, name).await? else {
        return Ok(Release::Gone);
    };

    if request.spec.retain_on_delete {
        let uid = owner.meta().uid.clone().unwrap_or_default();
        let mut detached = request.clone();
        if remove_owner_ref(&mut detached.metadata, &uid) {
            info!(%ns, %name, "retaining apply request, removing owner link");
            match store.replace(&detached).await {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        return Ok(Release::Gone);
    }

    if request.metadata.deletion_timestamp.is_none() {
        info!(%ns, %name, "deleting apply request");
        if !store.delete::<ApplyRequest>(&ns, name).await? {
            return Ok(Release::Gone);
        }
    } else {
        debug!(%ns, %name, "apply request still terminating");
    }

    if store.get::<ApplyRequest>(&ns, name).await?.is_some() {
        Ok(Release::Pending)
    } else {
        Ok(Release::Gone)
    }
}

/// Release every request in `names`; `Gone` only when all of them are.
pub async fn release_all<K: Managed, S: Store>(
    store: &S,
    owner: &K,
    names: &[String],
) -> Result<Release> {
    let mut outcome = Release::Gone;
    for name in names {
        if release_apply_request(store, owner, name).await? == Release::Pending {
            outcome = Release::Pending;
        }
    }
    Ok(outcome)
}
