//! EksCluster controller.
//!
//! Waits for the owning CAPI Cluster, then either adopts an existing VPC id
//! or provisions one through the `<name>-vpc` ApplyRequest and copies its
//! `vpc_id` output into status.

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

use crate::crd::apply_request::{ApplyRequest, ApplyRequestSpec};
use crate::crd::cluster::{EksCluster, VpcSourceKind};
use crate::crd::shared::TemplateStatus;
use crate::error::Result;
use crate::helpers::vpc_request_name;
use crate::store::{KubeStore, Store};

use super::helpers::is_deleting;
use super::provisioning::{ensure_apply_request, release_apply_request, Release};
use super::status::derive_readiness;
use super::{
    announce_phase, error_policy, finalizer, link_owner, log_outcome, resolve_parent,
    update_status, Context,
};

pub const FINALIZER: &str = "eksforge.io/cluster-cleanup";

/// Start the EksCluster controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context<KubeStore>>) {
    let client = ctx.store.client().clone();
    let clusters: Api<EksCluster> = Api::all(client.clone());
    let requests: Api<ApplyRequest> = Api::all(client);

    Controller::new(clusters, WatcherConfig::default())
        .owns(requests, WatcherConfig::default())
        .run(reconcile::<KubeStore>, error_policy::<EksCluster, KubeStore>, ctx)
        .for_each(log_outcome)
        .await;
}

pub async fn reconcile<S: Store>(cluster: Arc<EksCluster>, ctx: Arc<Context<S>>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    reconcile_cluster(&ctx, &ns, &cluster.name_any()).await
}

pub async fn reconcile_cluster<S: Store>(ctx: &Context<S>, ns: &str, name: &str) -> Result<Action> {
    let Some(cluster) = ctx.store.get::<EksCluster>(ns, name).await? else {
        debug!(%ns, %name, "cluster already gone");
        return Ok(Action::await_change());
    };
    if is_deleting(&cluster) {
        return cleanup(ctx, &cluster).await;
    }
    let cluster = finalizer::ensure(&ctx.store, &cluster, FINALIZER).await?;
    let generation = cluster.metadata.generation;
    let before = cluster.status.clone().unwrap_or_default();
    let mut status = before.clone();

    let Some(parent) = resolve_parent(&ctx.store, &cluster).await? else {
        info!(%ns, %name, "waiting for owning Cluster");
        status.vpc_id = None;
        status.template_status = None;
        status
            .provisioning
            .mark_waiting("WaitingForCluster", "waiting for the owning Cluster", generation);
        update_status(&ctx.store, &cluster, status).await?;
        return Ok(ctx.requeue());
    };
    if parent.spec.paused {
        debug!(%ns, %name, "owning Cluster is paused");
        return Ok(ctx.requeue());
    }
    let cluster = link_owner(&ctx.store, cluster, &parent).await?;

    let action = match cluster.spec.vpc.resolve() {
        Err(msg) => {
            info!(%ns, %name, %msg, "invalid VPC source");
            status.template_status = None;
            status.provisioning.mark_failed("InvalidSpec", &msg, generation);
            ctx.requeue()
        }
        Ok(VpcSourceKind::Existing(id)) => {
            status.vpc_id = Some(id.to_string());
            status.template_status = None;
            status
                .provisioning
                .mark_ready(&format!("using existing VPC {id}"), generation);
            Action::await_change()
        }
        Ok(VpcSourceKind::Template(template_ref)) => {
            let request_name = vpc_request_name(name);
            let mut variables = BTreeMap::new();
            variables.insert("name".to_string(), request_name.clone());
            variables.insert("region".to_string(), cluster.spec.region.clone());
            variables.insert("cluster_name".to_string(), parent.name_any());
            variables.insert(
                "tags".to_string(),
                serde_json::to_string(&cluster.spec.additional_tags)?,
            );
            let spec = ApplyRequestSpec {
                template_ref: template_ref.clone(),
                variables,
                output_binding: None,
                wait_for: Default::default(),
                retain_on_delete: cluster.spec.vpc.retain_on_delete,
            };
            let request = ensure_apply_request(
                &ctx.store,
                &cluster,
                &request_name,
                spec,
                Some(&parent.name_any()),
            )
            .await?;

            let readiness = derive_readiness(Some(&request));
            status.template_status = Some(TemplateStatus::from_request(&request));
            if readiness.ready {
                let output = request
                    .status
                    .as_ref()
                    .and_then(|s| s.outputs.get("vpc_id"))
                    .filter(|v| !v.is_empty());
                match output {
                    Some(vpc_id) => {
                        status.vpc_id = Some(vpc_id.clone());
                        status
                            .provisioning
                            .mark_ready(&format!("VPC {vpc_id} provisioned"), generation);
                    }
                    None => {
                        status.provisioning.mark_failed(
                            "MissingOutput",
                            &format!("apply request {request_name} did not report output vpc_id"),
                            generation,
                        );
                    }
                }
            } else {
                status.provisioning.apply_readiness(&readiness, generation);
            }
            if status.provisioning.ready {
                Action::await_change()
            } else {
                ctx.requeue()
            }
        }
    };

    announce_phase(
        &ctx.store,
        &cluster,
        before.provisioning.phase.as_ref(),
        status.provisioning.phase.as_ref(),
        status.provisioning.failure_message.as_deref(),
    )
    .await;
    update_status(&ctx.store, &cluster, status).await?;
    Ok(action)
}

// ── Cleanup (finalizer) ──────────────────────────────────────────────────────

async fn cleanup<S: Store>(ctx: &Context<S>, cluster: &EksCluster) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    if !finalizer::has(cluster, FINALIZER) {
        return Ok(Action::await_change());
    }
    match release_apply_request(&ctx.store, cluster, &vpc_request_name(&name)).await? {
        Release::Pending => {
            info!(%ns, %name, "waiting for VPC apply request to be removed");
            Ok(ctx.requeue())
        }
        Release::Gone => {
            info!(%ns, %name, "cleanup complete, removing finalizer");
            finalizer::remove(&ctx.store, cluster, FINALIZER).await?;
            Ok(Action::await_change())
        }
    }
}
