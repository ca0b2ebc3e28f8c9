//! Controllers and the pieces they share.
//!
//! Every reconciler has the same shape: an `async fn reconcile(obj, ctx)`
//! entry point handed to `kube::runtime::Controller`, which re-reads the
//! object through the [`Store`] and runs the per-kind logic.  Waiting is
//! always a returned `Action::requeue`, never a sleep.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use kube::core::object::HasStatus;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::capi::Cluster;
use crate::crd::shared::ProvisioningPhase;
use crate::error::{Error, Result};
use crate::helpers::OperatorConfig;
use crate::store::{KubeStore, Managed, ObjectEvent, Store};

pub mod apply_request;
pub mod cluster;
pub mod control_plane;
pub mod dependency;
pub mod finalizer;
pub mod helpers;
pub mod machine;
pub mod machine_deployment;
pub mod machine_set;
pub mod provisioning;
pub mod rollout;
pub mod status;

use helpers::{cluster_name_of, ensure_owner_ref, owner_ref};

// ── Shared context passed to every reconcile call ─────────────────────────────

pub struct Context<S: Store> {
    pub store: S,
    pub config: OperatorConfig,
}

impl<S: Store> Context<S> {
    pub fn new(store: S, config: OperatorConfig) -> Self {
        Self { store, config }
    }

    pub fn requeue(&self) -> Action {
        Action::requeue(self.config.requeue_interval)
    }
}

// ── Controller entry point ────────────────────────────────────────────────────

/// Run every controller concurrently.  Returns when all of them stop, which
/// in practice means never.
pub async fn run(ctx: Arc<Context<KubeStore>>) {
    info!("starting controllers");
    futures::join!(
        cluster::run(ctx.clone()),
        control_plane::run(ctx.clone()),
        machine::run(ctx.clone()),
        apply_request::run(ctx.clone()),
        machine_set::run(ctx.clone()),
        machine_deployment::run(ctx.clone()),
    );
}

/// Map reconcile errors to requeue intervals.  Write conflicts retry at once
/// with a fresh read; missing objects and unready dependencies wait one
/// interval; everything else backs off.
pub fn error_policy<K: Managed, S: Store>(obj: Arc<K>, error: &Error, ctx: Arc<Context<S>>) -> Action {
    let name = obj.name_any();
    let kind = K::kind(&());
    match error {
        Error::Conflict(_) => {
            debug!(%kind, %name, %error, "write conflict, retrying");
            Action::requeue(Duration::from_secs(0))
        }
        Error::NotFound(_) | Error::DependencyNotReady(_) => {
            info!(%kind, %name, %error, "waiting");
            ctx.requeue()
        }
        _ => {
            warn!(%kind, %name, %error, "reconcile error, backing off");
            Action::requeue(ctx.config.error_backoff)
        }
    }
}

/// Log the outcome of each reconcile the controller stream yields.
pub(crate) async fn log_outcome<T, E: Debug>(res: std::result::Result<T, E>) {
    if let Err(e) = res {
        let msg = format!("{e:?}");
        if msg.contains("ObjectNotFound") {
            debug!("reconcile: object already deleted");
        } else {
            warn!("reconcile failed: {msg}");
        }
    }
}

// ── Helpers shared by the provisioning reconcilers ────────────────────────────

/// Persist `status` unless it equals what is already stored.
pub async fn update_status<K, S>(store: &S, obj: &K, status: K::Status) -> Result<K>
where
    K: Managed + HasStatus,
    K::Status: PartialEq + Clone + Send + Sync,
    S: Store,
{
    if obj.status() == Some(&status) {
        return Ok(obj.clone());
    }
    let mut updated = obj.clone();
    *updated.status_mut() = Some(status);
    store.replace_status(&updated).await
}

/// The CAPI Cluster `obj` belongs to, if it exists.
pub async fn resolve_parent<K: Managed, S: Store>(store: &S, obj: &K) -> Result<Option<Cluster>> {
    let Some(name) = cluster_name_of(obj.meta()) else {
        return Ok(None);
    };
    let ns = obj.namespace().unwrap_or_default();
    store.get::<Cluster>(&ns, &name).await
}

/// Record `parent` as an owner of `obj` unless it already is.
pub async fn link_owner<K: Managed, S: Store>(store: &S, obj: K, parent: &Cluster) -> Result<K> {
    let mut updated = obj.clone();
    if !ensure_owner_ref(updated.meta_mut(), owner_ref(parent)) {
        return Ok(obj);
    }
    debug!(name = %obj.name_any(), parent = %parent.name_any(), "linking owner");
    store.replace(&updated).await
}

/// Emit an event when a provisioning phase changes.
pub async fn announce_phase<K: Managed, S: Store>(
    store: &S,
    obj: &K,
    before: Option<&ProvisioningPhase>,
    after: Option<&ProvisioningPhase>,
    message: Option<&str>,
) {
    if before == after {
        return;
    }
    let Some(phase) = after else {
        return;
    };
    let note = message.unwrap_or_default().to_string();
    let event = match phase {
        ProvisioningPhase::Failed => ObjectEvent::warning("Failed", "Reconcile", note),
        ProvisioningPhase::Ready => ObjectEvent::normal("Ready", "Reconcile", note),
        ProvisioningPhase::Creating => ObjectEvent::normal("Creating", "Reconcile", note),
    };
    store.publish_event(obj, event).await;
}
