//! EksMachine controller: one managed node group per machine, provisioned
//! through the `<name>-nodegroup` ApplyRequest once the control plane is
//! Ready.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
};
use tracing::{debug, info};

use crate::crd::apply_request::{ApplyRequest, ApplyRequestSpec, WaitFor};
use crate::crd::capi::Cluster;
use crate::crd::control_plane::EksControlPlane;
use crate::crd::machine::{EksMachine, NodeGroupConfig};
use crate::crd::shared::{NamespacedRef, TemplateStatus};
use crate::error::{Error, Result};
use crate::helpers::{eks_request_name, nodegroup_request_name, now};
use crate::store::{KubeStore, Store};

use super::helpers::is_deleting;
use super::provisioning::{ensure_apply_request, release_apply_request, Release};
use super::status::derive_readiness;
use super::{
    announce_phase, error_policy, finalizer, link_owner, log_outcome, resolve_parent,
    update_status, Context,
};

pub const FINALIZER: &str = "eksforge.io/machine-cleanup";

/// Start the EksMachine controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context<KubeStore>>) {
    let client = ctx.store.client().clone();
    let machines: Api<EksMachine> = Api::all(client.clone());
    let requests: Api<ApplyRequest> = Api::all(client);

    Controller::new(machines, WatcherConfig::default())
        .owns(requests, WatcherConfig::default())
        .run(reconcile::<KubeStore>, error_policy::<EksMachine, KubeStore>, ctx)
        .for_each(log_outcome)
        .await;
}

pub async fn reconcile<S: Store>(machine: Arc<EksMachine>, ctx: Arc<Context<S>>) -> Result<Action> {
    let ns = machine.namespace().unwrap_or_default();
    reconcile_machine(&ctx, &ns, &machine.name_any()).await
}

/// Name of the EksControlPlane for `parent`: its controlPlaneRef, or the
/// parent's own name when the reference is absent.
fn control_plane_name(parent: &Cluster) -> String {
    parent
        .spec
        .control_plane_ref
        .as_ref()
        .filter(|r| r.kind.as_deref().map_or(true, |k| k == "EksControlPlane"))
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| parent.name_any())
}

fn node_group_variables(
    machine: &str,
    cluster_name: &str,
    region: &str,
    ng: &NodeGroupConfig,
) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    vars.insert("name".to_string(), machine.to_string());
    vars.insert("cluster_name".to_string(), cluster_name.to_string());
    vars.insert("region".to_string(), region.to_string());
    vars.insert("min_size".to_string(), ng.scaling.min_size.to_string());
    vars.insert("max_size".to_string(), ng.scaling.max_size.to_string());
    vars.insert("desired_size".to_string(), ng.scaling.desired_size.to_string());
    vars.insert(
        "instance_types".to_string(),
        serde_json::to_string(&[&ng.instance_type])?,
    );
    vars.insert("labels".to_string(), serde_json::to_string(&ng.labels)?);
    vars.insert("tags".to_string(), serde_json::to_string(&ng.tags)?);
    if let Some(policy) = &ng.update_policy {
        if let Some(n) = policy.max_unavailable {
            vars.insert("max_unavailable".to_string(), n.to_string());
        }
        if let Some(p) = policy.max_unavailable_percentage {
            vars.insert("max_unavailable_percentage".to_string(), p.to_string());
        }
    }
    Ok(vars)
}

pub async fn reconcile_machine<S: Store>(ctx: &Context<S>, ns: &str, name: &str) -> Result<Action> {
    let Some(machine) = ctx.store.get::<EksMachine>(ns, name).await? else {
        debug!(%ns, %name, "machine already gone");
        return Ok(Action::await_change());
    };
    if is_deleting(&machine) {
        return cleanup(ctx, &machine).await;
    }
    let machine = finalizer::ensure(&ctx.store, &machine, FINALIZER).await?;
    let generation = machine.metadata.generation;
    let before = machine.status.clone().unwrap_or_default();
    let mut status = before.clone();

    let Some(parent) = resolve_parent(&ctx.store, &machine).await? else {
        info!(%ns, %name, "waiting for owning Cluster");
        status.template_status = None;
        status
            .provisioning
            .mark_waiting("WaitingForCluster", "waiting for the owning Cluster", generation);
        update_status(&ctx.store, &machine, status).await?;
        return Ok(ctx.requeue());
    };
    if parent.spec.paused {
        debug!(%ns, %name, "owning Cluster is paused");
        return Ok(ctx.requeue());
    }

    let cp_name = control_plane_name(&parent);
    let cp = ctx.store.get::<EksControlPlane>(ns, &cp_name).await?;
    let Some(cp) = cp.filter(|c| c.status.as_ref().is_some_and(|s| s.provisioning.ready)) else {
        info!(%ns, %name, control_plane = %cp_name, "waiting for control plane");
        status.template_status = None;
        status.provisioning.mark_waiting(
            "WaitingForControlPlane",
            &format!("waiting for EksControlPlane {cp_name} to be ready"),
            generation,
        );
        update_status(&ctx.store, &machine, status).await?;
        return Ok(ctx.requeue());
    };

    // Machines stamped out by a machine set keep that set as their only owner.
    let machine = if machine.owner_references().is_empty() {
        link_owner(&ctx.store, machine, &parent).await?
    } else {
        machine
    };

    if let Err(msg) = machine.spec.node_group.validate() {
        info!(%ns, %name, %msg, "invalid node group spec");
        status.provisioning.mark_failed("InvalidSpec", &msg, generation);
        update_status(&ctx.store, &machine, status).await?;
        return Ok(ctx.requeue());
    }

    let cp_status = cp.status.clone().unwrap_or_default();
    let cluster_name = cp_status
        .eks_cluster_name
        .clone()
        .unwrap_or_else(|| cp_name.clone());
    let region = cp_status.region.clone().unwrap_or_default();
    let request_name = nodegroup_request_name(name);
    let spec = ApplyRequestSpec {
        template_ref: machine.spec.template_ref.clone(),
        variables: node_group_variables(name, &cluster_name, &region, &machine.spec.node_group)?,
        output_binding: None,
        wait_for: WaitFor {
            workspaces: vec![NamespacedRef::local(eks_request_name(&cp_name))],
            secrets: vec![],
        },
        retain_on_delete: false,
    };
    let request =
        ensure_apply_request(&ctx.store, &machine, &request_name, spec, Some(&parent.name_any()))
            .await?;

    let readiness = derive_readiness(Some(&request));
    status.template_status = Some(TemplateStatus::from_request(&request));
    let action = if readiness.ready {
        let reported = match request.status.as_ref().and_then(|s| s.outputs.get("desired_size")) {
            None => machine.spec.node_group.scaling.desired_size,
            Some(v) => v.parse::<i32>().map_err(|_| {
                Error::Execution(format!(
                    "ApplyRequest {ns}/{request_name} output desired_size {v:?} is not an integer"
                ))
            })?,
        };
        if status.creation_time.is_none() {
            status.creation_time = Some(now());
        }
        if status.current_size != Some(reported) {
            status.current_size = Some(reported);
            status.last_update_time = Some(now());
        }
        status
            .provisioning
            .mark_ready(&format!("node group running with {reported} nodes"), generation);
        Action::await_change()
    } else {
        status.provisioning.apply_readiness(&readiness, generation);
        ctx.requeue()
    };

    announce_phase(
        &ctx.store,
        &machine,
        before.provisioning.phase.as_ref(),
        status.provisioning.phase.as_ref(),
        status.provisioning.failure_message.as_deref(),
    )
    .await;
    update_status(&ctx.store, &machine, status).await?;
    Ok(action)
}

// ── Cleanup (finalizer) ──────────────────────────────────────────────────────

async fn cleanup<S: Store>(ctx: &Context<S>, machine: &EksMachine) -> Result<Action> {
    let ns = machine.namespace().unwrap_or_default();
    let name = machine.name_any();
    if !finalizer::has(machine, FINALIZER) {
        return Ok(Action::await_change());
    }
    match release_apply_request(&ctx.store, machine, &nodegroup_request_name(&name)).await? {
        Release::Pending => {
            info!(%ns, %name, "waiting for node group apply request to be removed");
            Ok(ctx.requeue())
        }
        Release::Gone => {
            info!(%ns, %name, "cleanup complete, removing finalizer");
            finalizer::remove(&ctx.store, machine, FINALIZER).await?;
            Ok(Action::await_change())
        }
    }
}
