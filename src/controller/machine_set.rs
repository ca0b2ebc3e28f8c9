//! EksMachineSet controller: keeps `spec.replicas` EksMachines matching the
//! set's selector and owned by it.

use std::cmp::Reverse;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
};
use tracing::{debug, info};

use crate::crd::machine::EksMachine;
use crate::crd::machine_set::{EksMachineSet, EksMachineSetSpec, EksMachineSetStatus};
use crate::error::Result;
use crate::store::{selector, KubeStore, ObjectEvent, Store};

use super::helpers::{controller_owner_ref, is_deleting, is_owned_by, CLUSTER_NAME_LABEL};
use super::status::{find_condition, upsert_condition, FALSE, READY, TRUE};
use super::{error_policy, finalizer, log_outcome, update_status, Context};

pub const FINALIZER: &str = "eksforge.io/machineset-cleanup";

/// Start the EksMachineSet controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context<KubeStore>>) {
    let client = ctx.store.client().clone();
    let sets: Api<EksMachineSet> = Api::all(client.clone());
    let machines: Api<EksMachine> = Api::all(client);

    Controller::new(sets, WatcherConfig::default())
        .owns(machines, WatcherConfig::default())
        .run(reconcile::<KubeStore>, error_policy::<EksMachineSet, KubeStore>, ctx)
        .for_each(log_outcome)
        .await;
}

pub async fn reconcile<S: Store>(set: Arc<EksMachineSet>, ctx: Arc<Context<S>>) -> Result<Action> {
    let ns = set.namespace().unwrap_or_default();
    reconcile_machine_set(&ctx, &ns, &set.name_any()).await
}

fn is_ready(machine: &EksMachine) -> bool {
    machine.status.as_ref().is_some_and(|s| s.provisioning.ready)
}

/// Ready for at least `min_ready_seconds` as of `now`.
fn is_available(machine: &EksMachine, min_ready_seconds: i32, now: DateTime<Utc>) -> bool {
    if !is_ready(machine) {
        return false;
    }
    if min_ready_seconds <= 0 {
        return true;
    }
    let since = machine
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.provisioning.conditions, READY))
        .map(|c| c.last_transition_time.0);
    since.map_or(true, |t| now - t >= chrono::Duration::seconds(min_ready_seconds.into()))
}

/// Replica counts observed from the machines a set owns.
pub fn observe(spec: &EksMachineSetSpec, machines: &[EksMachine], now: DateTime<Utc>) -> EksMachineSetStatus {
    let template_labels = &spec.template.metadata.labels;
    let min_ready = spec.min_ready_seconds.unwrap_or(0);
    let count = |f: &dyn Fn(&EksMachine) -> bool| machines.iter().filter(|&m| f(m)).count() as i32;
    EksMachineSetStatus {
        replicas: machines.len() as i32,
        ready_replicas: count(&is_ready),
        fully_labeled_replicas: count(&|m| {
            let labels = m.labels();
            template_labels.iter().all(|(k, v)| labels.get(k) == Some(v))
        }),
        available_replicas: count(&|m| is_available(m, min_ready, now)),
        observed_generation: None,
        conditions: vec![],
    }
}

/// Pick `count` machines to remove: not-ready first, then the newest, then
/// by name.
pub fn select_victims(machines: &[EksMachine], count: usize) -> Vec<&EksMachine> {
    let mut ranked: Vec<&EksMachine> = machines.iter().collect();
    ranked.sort_by_key(|m| {
        (
            is_ready(m),
            Reverse(m.metadata.creation_timestamp.as_ref().map(|t| t.0)),
            m.name_any(),
        )
    });
    ranked.truncate(count);
    ranked
}

fn machine_from_template(set: &EksMachineSet) -> EksMachine {
    let template = &set.spec.template;
    let mut labels = template.metadata.labels.clone();
    if let Some(cluster) = set.labels().get(CLUSTER_NAME_LABEL) {
        labels
            .entry(CLUSTER_NAME_LABEL.to_string())
            .or_insert_with(|| cluster.clone());
    }
    let annotations = &template.metadata.annotations;
    EksMachine {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", set.name_any())),
            namespace: set.namespace(),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then(|| annotations.clone()),
            owner_references: Some(vec![controller_owner_ref(set)]),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    }
}

/// Machines matching the selector and owned by `set`, including those
/// already being deleted.
async fn owned_machines<S: Store>(store: &S, set: &EksMachineSet) -> Result<Vec<EksMachine>> {
    let ns = set.namespace().unwrap_or_default();
    let uid = set.metadata.uid.clone().unwrap_or_default();
    let machines = store.list::<EksMachine>(&ns, Some(&set.spec.selector)).await?;
    Ok(machines
        .into_iter()
        .filter(|m| is_owned_by(&m.metadata, &uid))
        .collect())
}

pub async fn reconcile_machine_set<S: Store>(
    ctx: &Context<S>,
    ns: &str,
    name: &str,
) -> Result<Action> {
    let Some(set) = ctx.store.get::<EksMachineSet>(ns, name).await? else {
        debug!(%ns, %name, "machine set already gone");
        return Ok(Action::await_change());
    };
    if is_deleting(&set) {
        return cleanup(ctx, &set).await;
    }
    let set = finalizer::ensure(&ctx.store, &set, FINALIZER).await?;
    let generation = set.metadata.generation;
    let previous = set.status.clone().unwrap_or_default();
    let desired = set.spec.desired_replicas();

    if selector::is_empty(&set.spec.selector)
        || !selector::matches(&set.spec.selector, &set.spec.template.metadata.labels)
    {
        let msg = "selector must be non-empty and match the template labels";
        info!(%ns, %name, "invalid machine set spec");
        let mut status = previous;
        status.observed_generation = generation;
        upsert_condition(&mut status.conditions, READY, FALSE, "InvalidSpec", msg, generation);
        update_status(&ctx.store, &set, status).await?;
        return Ok(ctx.requeue());
    }

    let machines: Vec<EksMachine> = owned_machines(&ctx.store, &set)
        .await?
        .into_iter()
        .filter(|m| !is_deleting(m))
        .collect();
    let mut status = observe(&set.spec, &machines, Utc::now());
    status.observed_generation = generation;
    status.conditions = previous.conditions.clone();
    if status.ready_replicas == desired && status.replicas == desired {
        let msg = format!("{desired} machines ready");
        upsert_condition(&mut status.conditions, READY, TRUE, "MachinesReady", &msg, generation);
    } else {
        let msg = format!("{} of {desired} machines ready", status.ready_replicas);
        upsert_condition(&mut status.conditions, READY, FALSE, "Scaling", &msg, generation);
    }
    let settled = status.replicas == desired && status.available_replicas == desired;
    update_status(&ctx.store, &set, status).await?;

    let diff = machines.len() as i32 - desired;
    if diff < 0 {
        let missing = -diff;
        info!(%ns, %name, count = missing, "creating machines");
        for _ in 0..missing {
            let machine = ctx.store.create(ns, &machine_from_template(&set)).await?;
            debug!(%ns, set = %name, machine = %machine.name_any(), "created machine");
        }
        ctx.store
            .publish_event(
                &set,
                ObjectEvent::normal("ScaledUp", "Scale", format!("created {missing} machines")),
            )
            .await;
    } else if diff > 0 {
        let victims = select_victims(&machines, diff as usize);
        info!(%ns, %name, count = victims.len(), "deleting surplus machines");
        for victim in &victims {
            ctx.store.delete::<EksMachine>(ns, &victim.name_any()).await?;
        }
        ctx.store
            .publish_event(
                &set,
                ObjectEvent::normal("ScaledDown", "Scale", format!("deleted {diff} machines")),
            )
            .await;
    }

    Ok(if diff == 0 && settled {
        Action::await_change()
    } else {
        ctx.requeue()
    })
}

// ── Cleanup (finalizer) ──────────────────────────────────────────────────────

async fn cleanup<S: Store>(ctx: &Context<S>, set: &EksMachineSet) -> Result<Action> {
    let ns = set.namespace().unwrap_or_default();
    let name = set.name_any();
    if !finalizer::has(set, FINALIZER) {
        return Ok(Action::await_change());
    }
    let machines = owned_machines(&ctx.store, set).await?;
    for machine in machines.iter().filter(|m| !is_deleting(*m)) {
        ctx.store.delete::<EksMachine>(&ns, &machine.name_any()).await?;
    }
    if owned_machines(&ctx.store, set).await?.is_empty() {
        info!(%ns, %name, "cleanup complete, removing finalizer");
        finalizer::remove(&ctx.store, set, FINALIZER).await?;
        Ok(Action::await_change())
    } else {
        info!(%ns, %name, "waiting for machines to be removed");
        Ok(ctx.requeue())
    }
}
