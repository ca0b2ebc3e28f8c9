//! EksControlPlane controller.
//!
//! Two ApplyRequests in sequence: `<name>-eks` provisions the control plane
//! once the infrastructure cluster is Ready, then `<name>-kubeconfig`
//! derives the kubeconfig Secret from its outputs.  The control plane is
//! Ready only when both are.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
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
use crate::crd::cluster::{EksCluster, VpcSourceKind};
use crate::crd::control_plane::{ApiEndpoint, EksControlPlane, EksControlPlaneStatus};
use crate::crd::shared::{NamespacedRef, TemplateRef, TemplateStatus};
use crate::error::{Error, Result};
use crate::helpers::{
    eks_request_name, endpoint_host, kubeconfig_request_name, kubeconfig_secret_name,
    vpc_request_name,
};
use crate::store::{KubeStore, Store};

use super::helpers::is_deleting;
use super::provisioning::{ensure_apply_request, release_all, Release};
use super::status::{derive_readiness, upsert_condition, Readiness};
use super::{
    announce_phase, error_policy, finalizer, link_owner, log_outcome, resolve_parent,
    update_status, Context,
};

pub const FINALIZER: &str = "eksforge.io/controlplane-cleanup";

const PROVISIONED: &str = "ControlPlaneProvisioned";
const KUBECONFIG_AVAILABLE: &str = "KubeconfigAvailable";

/// Start the EksControlPlane controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context<KubeStore>>) {
    let client = ctx.store.client().clone();
    let control_planes: Api<EksControlPlane> = Api::all(client.clone());
    let requests: Api<ApplyRequest> = Api::all(client);

    Controller::new(control_planes, WatcherConfig::default())
        .owns(requests, WatcherConfig::default())
        .run(
            reconcile::<KubeStore>,
            error_policy::<EksControlPlane, KubeStore>,
            ctx,
        )
        .for_each(log_outcome)
        .await;
}

pub async fn reconcile<S: Store>(cp: Arc<EksControlPlane>, ctx: Arc<Context<S>>) -> Result<Action> {
    let ns = cp.namespace().unwrap_or_default();
    reconcile_control_plane(&ctx, &ns, &cp.name_any()).await
}

/// Name of the EksCluster backing `parent`: its infrastructureRef, or the
/// parent's own name when the reference is absent.
fn infrastructure_name(parent: &Cluster) -> String {
    parent
        .spec
        .infrastructure_ref
        .as_ref()
        .filter(|r| r.kind.as_deref().map_or(true, |k| k == "EksCluster"))
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| parent.name_any())
}

fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    r: &Readiness,
    generation: Option<i64>,
) {
    upsert_condition(conditions, type_, r.status(), &r.reason, &r.message, generation);
}

pub async fn reconcile_control_plane<S: Store>(
    ctx: &Context<S>,
    ns: &str,
    name: &str,
) -> Result<Action> {
    let Some(cp) = ctx.store.get::<EksControlPlane>(ns, name).await? else {
        debug!(%ns, %name, "control plane already gone");
        return Ok(Action::await_change());
    };
    if is_deleting(&cp) {
        return cleanup(ctx, &cp).await;
    }
    let cp = finalizer::ensure(&ctx.store, &cp, FINALIZER).await?;
    let generation = cp.metadata.generation;
    let before = cp.status.clone().unwrap_or_default();
    let mut status = before.clone();

    let Some(parent) = resolve_parent(&ctx.store, &cp).await? else {
        info!(%ns, %name, "waiting for owning Cluster");
        status.template_status = None;
        status.kubeconfig_status = None;
        status
            .provisioning
            .mark_waiting("WaitingForCluster", "waiting for the owning Cluster", generation);
        update_status(&ctx.store, &cp, status).await?;
        return Ok(ctx.requeue());
    };
    if parent.spec.paused {
        debug!(%ns, %name, "owning Cluster is paused");
        return Ok(ctx.requeue());
    }

    let infra_name = infrastructure_name(&parent);
    let infra = ctx.store.get::<EksCluster>(ns, &infra_name).await?;
    let Some(infra) = infra.filter(|c| c.status.as_ref().is_some_and(|s| s.provisioning.ready)) else {
        info!(%ns, %name, cluster = %infra_name, "waiting for infrastructure cluster");
        status.template_status = None;
        status.kubeconfig_status = None;
        status.provisioning.mark_waiting(
            "WaitingForClusterInfrastructure",
            &format!("waiting for EksCluster {infra_name} to be ready"),
            generation,
        );
        update_status(&ctx.store, &cp, status).await?;
        return Ok(ctx.requeue());
    };

    let mut cp = link_owner(&ctx.store, cp, &parent).await?;

    if let Err(msg) = cp.spec.validate() {
        info!(%ns, %name, %msg, "invalid control plane spec");
        status.provisioning.mark_failed("InvalidSpec", &msg, generation);
        update_status(&ctx.store, &cp, status).await?;
        return Ok(ctx.requeue());
    }

    let region = cp
        .spec
        .config
        .region
        .clone()
        .unwrap_or_else(|| infra.spec.region.clone());
    let Some(vpc_id) = infra
        .status
        .as_ref()
        .and_then(|s| s.vpc_id.clone())
        .filter(|id| !id.is_empty())
    else {
        return Err(Error::DependencyNotReady(format!(
            "EksCluster {ns}/{infra_name} is ready but reports no vpcId"
        )));
    };

    // ── Control plane provisioning ────────────────────────────────────────────

    let eks_name = eks_request_name(name);
    let access = &cp.spec.config.endpoint_access;
    let mut variables = BTreeMap::new();
    variables.insert("name".to_string(), name.to_string());
    variables.insert("cluster_name".to_string(), parent.name_any());
    variables.insert("version".to_string(), cp.spec.version.clone());
    variables.insert("region".to_string(), region.clone());
    variables.insert("vpc_id".to_string(), vpc_id);
    variables.insert("endpoint_public_access".to_string(), access.public.to_string());
    variables.insert("endpoint_private_access".to_string(), access.private.to_string());
    variables.insert(
        "public_access_cidrs".to_string(),
        serde_json::to_string(&access.public_cidrs)?,
    );
    variables.insert("addons".to_string(), serde_json::to_string(&cp.spec.config.addons)?);
    variables.insert(
        "node_pool_profiles".to_string(),
        serde_json::to_string(&cp.spec.node_pool_profiles)?,
    );
    variables.insert("tags".to_string(), serde_json::to_string(&cp.spec.additional_tags)?);

    let mut wait_for = WaitFor::default();
    if let Ok(VpcSourceKind::Template(_)) = infra.spec.vpc.resolve() {
        wait_for
            .workspaces
            .push(NamespacedRef::local(vpc_request_name(&infra_name)));
    }
    let eks_spec = ApplyRequestSpec {
        template_ref: cp.spec.template_ref.clone(),
        variables,
        output_binding: None,
        wait_for,
        retain_on_delete: false,
    };
    let eks_request =
        ensure_apply_request(&ctx.store, &cp, &eks_name, eks_spec, Some(&parent.name_any())).await?;
    let eks_ready = derive_readiness(Some(&eks_request));
    status.template_status = Some(TemplateStatus::from_request(&eks_request));
    set_condition(&mut status.provisioning.conditions, PROVISIONED, &eks_ready, generation);

    if !eks_ready.ready {
        status.provisioning.apply_readiness(&eks_ready, generation);
        finish(ctx, &cp, before, status).await?;
        return Ok(ctx.requeue());
    }

    let outputs = eks_request
        .status
        .as_ref()
        .map(|s| s.outputs.clone())
        .unwrap_or_default();
    let eks_cluster_name = outputs
        .get("cluster_name")
        .cloned()
        .unwrap_or_else(|| name.to_string());
    status.initialized = true;
    status.eks_cluster_name = Some(eks_cluster_name.clone());
    status.region = Some(region.clone());

    let endpoint_url = outputs.get("cluster_endpoint").cloned().unwrap_or_default();
    if cp.spec.endpoint.is_none() && !endpoint_url.is_empty() {
        info!(%ns, %name, endpoint = %endpoint_url, "recording control plane endpoint");
        let mut updated = cp.clone();
        updated.spec.endpoint = Some(ApiEndpoint {
            host: endpoint_host(&endpoint_url),
            port: 443,
        });
        cp = ctx.store.replace(&updated).await?;
    }

    // ── Kubeconfig derivation ─────────────────────────────────────────────────

    let kubeconfig_name = kubeconfig_request_name(name);
    let secret_name = kubeconfig_secret_name(&parent.name_any());
    let template_ref = cp
        .spec
        .kubeconfig_template_ref
        .clone()
        .unwrap_or_else(|| TemplateRef::new(ctx.config.kubeconfig_template.clone()));
    let mut variables = BTreeMap::new();
    variables.insert("cluster_name".to_string(), eks_cluster_name);
    variables.insert("region".to_string(), region);
    variables.insert("endpoint".to_string(), endpoint_url);
    variables.insert(
        "certificate_authority_data".to_string(),
        outputs
            .get("certificate_authority_data")
            .cloned()
            .unwrap_or_default(),
    );
    let kubeconfig_spec = ApplyRequestSpec {
        template_ref,
        variables,
        output_binding: Some(NamespacedRef::local(secret_name.clone())),
        wait_for: WaitFor {
            workspaces: vec![NamespacedRef::local(eks_name)],
            secrets: vec![],
        },
        retain_on_delete: false,
    };
    let kubeconfig_request = ensure_apply_request(
        &ctx.store,
        &cp,
        &kubeconfig_name,
        kubeconfig_spec,
        Some(&parent.name_any()),
    )
    .await?;
    let kubeconfig_ready = derive_readiness(Some(&kubeconfig_request));
    status.kubeconfig_status = Some(TemplateStatus::from_request(&kubeconfig_request));
    set_condition(
        &mut status.provisioning.conditions,
        KUBECONFIG_AVAILABLE,
        &kubeconfig_ready,
        generation,
    );

    let action = if kubeconfig_ready.ready {
        status.kubeconfig_secret = Some(secret_name.clone());
        status.provisioning.mark_ready(
            &format!("control plane provisioned, kubeconfig in Secret {secret_name}"),
            generation,
        );
        Action::await_change()
    } else {
        status.provisioning.apply_readiness(&kubeconfig_ready, generation);
        ctx.requeue()
    };
    finish(ctx, &cp, before, status).await?;
    Ok(action)
}

async fn finish<S: Store>(
    ctx: &Context<S>,
    cp: &EksControlPlane,
    before: EksControlPlaneStatus,
    status: EksControlPlaneStatus,
) -> Result<()> {
    announce_phase(
        &ctx.store,
        cp,
        before.provisioning.phase.as_ref(),
        status.provisioning.phase.as_ref(),
        status.provisioning.failure_message.as_deref(),
    )
    .await;
    update_status(&ctx.store, cp, status).await?;
    Ok(())
}

// ── Cleanup (finalizer) ──────────────────────────────────────────────────────

async fn cleanup<S: Store>(ctx: &Context<S>, cp: &EksControlPlane) -> Result<Action> {
    let ns = cp.namespace().unwrap_or_default();
    let name = cp.name_any();
    if !finalizer::has(cp, FINALIZER) {
        return Ok(Action::await_change());
    }
    let owned = [kubeconfig_request_name(&name), eks_request_name(&name)];
    match release_all(&ctx.store, cp, &owned).await? {
        Release::Pending => {
            info!(%ns, %name, "waiting for apply requests to be removed");
            Ok(ctx.requeue())
        }
        Release::Gone => {
            info!(%ns, %name, "cleanup complete, removing finalizer");
            finalizer::remove(&ctx.store, cp, FINALIZER).await?;
            Ok(Action::await_change())
        }
    }
}
