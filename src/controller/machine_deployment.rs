//! EksMachineDeployment controller.
//!
//! Each template revision gets its own EksMachineSet, named and labelled by
//! the template hash.  Status is summed over the owned sets; the configured
//! strategy in [`super::rollout`] decides how sets are created, scaled and
//! deleted.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
};
use tracing::{debug, info, warn};

use crate::crd::machine_deployment::{EksMachineDeployment, EksMachineDeploymentStatus};
use crate::crd::machine_set::{EksMachineSet, EksMachineSetSpec};
use crate::error::{Error, Result};
use crate::helpers::{machine_set_name, short_hash};
use crate::store::{selector, KubeStore, ObjectEvent, Store};

use super::helpers::{
    controller_owner_ref, is_deleting, is_owned_by, CLUSTER_NAME_LABEL, TEMPLATE_HASH_LABEL,
};
use super::rollout::{spec_replicas, strategy_for, RolloutState, SetOperation};
use super::status::{find_condition, upsert_condition, FALSE, TRUE};
use super::{error_policy, finalizer, log_outcome, update_status, Context};

pub const FINALIZER: &str = "eksforge.io/machinedeployment-cleanup";

pub const AVAILABLE: &str = "Available";
pub const PROGRESSING: &str = "Progressing";

const UPDATING: &str = "MachineSetUpdating";
const COMPLETE: &str = "NewMachineSetAvailable";
const DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

/// Start the EksMachineDeployment controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context<KubeStore>>) {
    let client = ctx.store.client().clone();
    let deployments: Api<EksMachineDeployment> = Api::all(client.clone());
    let sets: Api<EksMachineSet> = Api::all(client);

    Controller::new(deployments, WatcherConfig::default())
        .owns(sets, WatcherConfig::default())
        .run(
            reconcile::<KubeStore>,
            error_policy::<EksMachineDeployment, KubeStore>,
            ctx,
        )
        .for_each(log_outcome)
        .await;
}

pub async fn reconcile<S: Store>(
    deployment: Arc<EksMachineDeployment>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let ns = deployment.namespace().unwrap_or_default();
    reconcile_machine_deployment(&ctx, &ns, &deployment.name_any()).await
}

pub fn template_hash(deployment: &EksMachineDeployment) -> String {
    short_hash(&deployment.spec.template)
}

fn template_hash_of(set: &EksMachineSet) -> Option<&str> {
    set.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(TEMPLATE_HASH_LABEL))
        .map(String::as_str)
}

/// The machine set for the current template revision of `deployment`.
pub fn machine_set_for(deployment: &EksMachineDeployment, hash: &str, replicas: i32) -> EksMachineSet {
    let mut template = deployment.spec.template.clone();
    template
        .metadata
        .labels
        .insert(TEMPLATE_HASH_LABEL.to_string(), hash.to_string());

    let mut set_selector = deployment.spec.selector.clone();
    set_selector
        .match_labels
        .get_or_insert_with(Default::default)
        .insert(TEMPLATE_HASH_LABEL.to_string(), hash.to_string());

    let mut labels = template.metadata.labels.clone();
    if let Some(cluster) = deployment.labels().get(CLUSTER_NAME_LABEL) {
        labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster.clone());
    }

    EksMachineSet {
        metadata: ObjectMeta {
            name: Some(machine_set_name(&deployment.name_any(), hash)),
            namespace: deployment.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![controller_owner_ref(deployment)]),
            ..Default::default()
        },
        spec: EksMachineSetSpec {
            replicas: Some(replicas),
            selector: set_selector,
            template,
            min_ready_seconds: deployment.spec.min_ready_seconds,
        },
        status: None,
    }
}

/// Machine sets matching the selector and owned by `deployment`.
async fn owned_sets<S: Store>(store: &S, deployment: &EksMachineDeployment) -> Result<Vec<EksMachineSet>> {
    let ns = deployment.namespace().unwrap_or_default();
    let uid = deployment.metadata.uid.clone().unwrap_or_default();
    let sets = store
        .list::<EksMachineSet>(&ns, Some(&deployment.spec.selector))
        .await?;
    Ok(sets
        .into_iter()
        .filter(|s| is_owned_by(&s.metadata, &uid))
        .collect())
}

/// Sum replica counts over `state`'s sets.
fn aggregate(state: &RolloutState<'_>, desired: i32) -> EksMachineDeploymentStatus {
    let mut status = EksMachineDeploymentStatus::default();
    for set in state.all_sets() {
        let s = set.status.clone().unwrap_or_default();
        status.replicas += s.replicas;
        status.ready_replicas += s.ready_replicas;
        status.available_replicas += s.available_replicas;
    }
    status.updated_replicas = state
        .new_set
        .and_then(|s| s.status.as_ref())
        .map_or(0, |s| s.replicas);
    status.unavailable_replicas = (desired - status.available_replicas).max(0);
    status
}

/// Set Progressing, restarting its clock whenever the reason or the
/// observed generation changes.  A new template revision always moves the
/// generation.
fn set_progressing(
    conditions: &mut Vec<Condition>,
    status: &str,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) {
    if find_condition(conditions, PROGRESSING)
        .is_some_and(|c| c.reason != reason || c.observed_generation != generation)
    {
        conditions.retain(|c| c.type_ != PROGRESSING);
    }
    upsert_condition(conditions, PROGRESSING, status, reason, message, generation);
}

/// True once the rollout of `generation` has gone `deadline_secs` without
/// finishing.
fn deadline_exceeded(conditions: &[Condition], deadline_secs: i32, generation: Option<i64>) -> bool {
    let Some(c) = find_condition(conditions, PROGRESSING).filter(|c| c.observed_generation == generation) else {
        return false;
    };
    match c.reason.as_str() {
        DEADLINE_EXCEEDED => true,
        UPDATING => Utc::now() - c.last_transition_time.0 > chrono::Duration::seconds(deadline_secs.into()),
        _ => false,
    }
}

pub async fn reconcile_machine_deployment<S: Store>(
    ctx: &Context<S>,
    ns: &str,
    name: &str,
) -> Result<Action> {
    let Some(deployment) = ctx.store.get::<EksMachineDeployment>(ns, name).await? else {
        debug!(%ns, %name, "machine deployment already gone");
        return Ok(Action::await_change());
    };
    if is_deleting(&deployment) {
        return cleanup(ctx, &deployment).await;
    }
    let deployment = finalizer::ensure(&ctx.store, &deployment, FINALIZER).await?;
    let generation = deployment.metadata.generation;
    let previous = deployment.status.clone().unwrap_or_default();
    let desired = deployment.spec.desired_replicas();

    if selector::is_empty(&deployment.spec.selector)
        || !selector::matches(&deployment.spec.selector, &deployment.spec.template.metadata.labels)
    {
        let msg = "selector must be non-empty and match the template labels";
        info!(%ns, %name, "invalid machine deployment spec");
        let mut status = previous;
        status.observed_generation = generation;
        upsert_condition(&mut status.conditions, AVAILABLE, FALSE, "InvalidSpec", msg, generation);
        update_status(&ctx.store, &deployment, status).await?;
        return Ok(ctx.requeue());
    }

    // ── Observe ───────────────────────────────────────────────────────────────

    let hash = template_hash(&deployment);
    let sets = owned_sets(&ctx.store, &deployment).await?;
    let (terminating, mut live): (Vec<&EksMachineSet>, Vec<&EksMachineSet>) =
        sets.iter().partition(|s| is_deleting(*s));
    live.sort_by_key(|s| (s.metadata.creation_timestamp.as_ref().map(|t| t.0), s.name_any()));
    let new_set = live
        .iter()
        .copied()
        .find(|s| template_hash_of(s) == Some(hash.as_str()));
    let old_sets: Vec<&EksMachineSet> = live
        .iter()
        .copied()
        .filter(|s| template_hash_of(s) != Some(hash.as_str()))
        .collect();
    let state = RolloutState {
        new_set,
        old_sets,
        terminating: terminating.len(),
    };

    let planned = if live.is_empty() && state.terminating == 0 {
        Ok(vec![SetOperation::Create { replicas: desired }])
    } else {
        strategy_for(&deployment.spec.strategy).plan(&deployment, &state)
    };
    let operations = match planned {
        Ok(ops) => ops,
        Err(Error::Validation(msg)) => {
            info!(%ns, %name, %msg, "invalid rollout parameters");
            let mut status = previous;
            status.observed_generation = generation;
            upsert_condition(&mut status.conditions, AVAILABLE, FALSE, "InvalidSpec", &msg, generation);
            update_status(&ctx.store, &deployment, status).await?;
            return Ok(ctx.requeue());
        }
        Err(e) => return Err(e),
    };

    // ── Status ────────────────────────────────────────────────────────────────

    let mut status = aggregate(&state, desired);
    status.observed_generation = generation;
    status.conditions = previous.conditions.clone();
    if status.available_replicas >= desired {
        let msg = format!("{} of {desired} machines available", status.available_replicas);
        upsert_condition(&mut status.conditions, AVAILABLE, TRUE, "MinimumReplicasAvailable", &msg, generation);
    } else {
        let msg = format!("{} of {desired} machines available", status.available_replicas);
        upsert_condition(&mut status.conditions, AVAILABLE, FALSE, "MinimumReplicasUnavailable", &msg, generation);
    }

    // Drained old sets are kept as revision history and do not hold the
    // rollout open.
    let draining = state
        .old_sets
        .iter()
        .any(|s| spec_replicas(s) > 0 || s.status.as_ref().is_some_and(|st| st.replicas > 0));
    let complete = !draining
        && state.terminating == 0
        && status.updated_replicas == desired
        && status.available_replicas >= desired;
    if complete {
        let msg = format!("machine set for revision {hash} is available");
        set_progressing(&mut status.conditions, TRUE, COMPLETE, &msg, generation);
    } else {
        let overdue = deployment
            .spec
            .progress_deadline_seconds
            .is_some_and(|secs| status.updated_replicas < desired && deadline_exceeded(&status.conditions, secs, generation));
        if overdue {
            let msg = format!("rollout of revision {hash} has not progressed within the deadline");
            let already_reported = find_condition(&status.conditions, PROGRESSING)
                .is_some_and(|c| c.reason == DEADLINE_EXCEEDED && c.observed_generation == generation);
            if !already_reported {
                warn!(%ns, %name, "progress deadline exceeded");
                ctx.store
                    .publish_event(&deployment, ObjectEvent::warning(DEADLINE_EXCEEDED, "Rollout", msg.clone()))
                    .await;
            }
            set_progressing(&mut status.conditions, FALSE, DEADLINE_EXCEEDED, &msg, generation);
        } else {
            let msg = format!("rolling out revision {hash}");
            set_progressing(&mut status.conditions, TRUE, UPDATING, &msg, generation);
        }
    }
    update_status(&ctx.store, &deployment, status).await?;

    if deployment.spec.paused {
        debug!(%ns, %name, "deployment paused");
        return Ok(Action::await_change());
    }

    // ── Mutate ────────────────────────────────────────────────────────────────

    for op in &operations {
        apply(ctx, &deployment, &state, &hash, op).await?;
    }

    Ok(if operations.is_empty() && complete {
        Action::await_change()
    } else {
        ctx.requeue()
    })
}

async fn apply<S: Store>(
    ctx: &Context<S>,
    deployment: &EksMachineDeployment,
    state: &RolloutState<'_>,
    hash: &str,
    op: &SetOperation,
) -> Result<()> {
    let ns = deployment.namespace().unwrap_or_default();
    match op {
        SetOperation::Create { replicas } => {
            let set = machine_set_for(deployment, hash, *replicas);
            info!(%ns, set = %set.name_any(), replicas, "creating machine set");
            ctx.store.create(&ns, &set).await?;
            ctx.store
                .publish_event(
                    deployment,
                    ObjectEvent::normal(
                        "MachineSetCreated",
                        "Rollout",
                        format!("created machine set {} with {replicas} replicas", set.name_any()),
                    ),
                )
                .await;
        }
        SetOperation::Scale { name, replicas } => {
            let Some(current) = state.all_sets().find(|s| s.name_any() == *name) else {
                return Err(Error::reconcile(format!("machine set {name} is not owned by this deployment")));
            };
            info!(%ns, set = %name, replicas, "scaling machine set");
            let mut scaled = current.clone();
            scaled.spec.replicas = Some(*replicas);
            ctx.store.replace(&scaled).await?;
            ctx.store
                .publish_event(
                    deployment,
                    ObjectEvent::normal(
                        "MachineSetScaled",
                        "Rollout",
                        format!("scaled machine set {name} to {replicas}"),
                    ),
                )
                .await;
        }
        SetOperation::Delete { name } => {
            info!(%ns, set = %name, "deleting machine set");
            ctx.store.delete::<EksMachineSet>(&ns, name).await?;
            ctx.store
                .publish_event(
                    deployment,
                    ObjectEvent::normal("MachineSetDeleted", "Rollout", format!("deleted machine set {name}")),
                )
                .await;
        }
    }
    Ok(())
}

// ── Cleanup (finalizer) ──────────────────────────────────────────────────────

async fn cleanup<S: Store>(ctx: &Context<S>, deployment: &EksMachineDeployment) -> Result<Action> {
    let ns = deployment.namespace().unwrap_or_default();
    let name = deployment.name_any();
    if !finalizer::has(deployment, FINALIZER) {
        return Ok(Action::await_change());
    }
    let sets = owned_sets(&ctx.store, deployment).await?;
    for set in sets.iter().filter(|s| !is_deleting(*s)) {
        ctx.store.delete::<EksMachineSet>(&ns, &set.name_any()).await?;
    }
    if owned_sets(&ctx.store, deployment).await?.is_empty() {
        info!(%ns, %name, "cleanup complete, removing finalizer");
        finalizer::remove(&ctx.store, deployment, FINALIZER).await?;
        Ok(Action::await_change())
    } else {
        info!(%ns, %name, "waiting for machine sets to be removed");
        Ok(ctx.requeue())
    }
}
