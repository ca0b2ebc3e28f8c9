use chrono::{Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::runtime::controller::Action;
use kube::ResourceExt;

use super::common::*;
use eksforge_operator::controller::helpers::{controller_owner_ref, TEMPLATE_HASH_LABEL};
use eksforge_operator::controller::machine_deployment::{
    reconcile_machine_deployment, template_hash,
};
use eksforge_operator::controller::machine_set::{self, reconcile_machine_set};
use eksforge_operator::crd::machine_deployment::{
    DeploymentStrategy, DeploymentStrategyType, EksMachineDeployment, EksMachineDeploymentSpec,
    EksMachineDeploymentStatus,
};
use eksforge_operator::crd::machine_set::{EksMachineSet, EksMachineSetSpec, EksMachineSetStatus};
use eksforge_operator::store::Store;

fn pool_selector() -> LabelSelector {
    LabelSelector {
        match_labels: Some([("pool".to_string(), "a".to_string())].into()),
        match_expressions: None,
    }
}

fn workers(replicas: i32, strategy_type: DeploymentStrategyType) -> EksMachineDeployment {
    EksMachineDeployment::new(
        "workers",
        EksMachineDeploymentSpec {
            replicas: Some(replicas),
            selector: pool_selector(),
            template: node_group_template(&[("pool", "a")]),
            strategy: DeploymentStrategy {
                strategy_type,
                rolling_update: None,
            },
            min_ready_seconds: None,
            revision_history_limit: None,
            progress_deadline_seconds: None,
            paused: false,
        },
    )
}

/// A machine set from an earlier template revision, fully available.
fn old_set(owner: &EksMachineDeployment, replicas: i32) -> EksMachineSet {
    let mut set = EksMachineSet::new(
        "workers-old",
        EksMachineSetSpec {
            replicas: Some(replicas),
            selector: pool_selector(),
            template: node_group_template(&[("pool", "a")]),
            min_ready_seconds: None,
        },
    );
    set.labels_mut().insert("pool".into(), "a".into());
    set.labels_mut()
        .insert(TEMPLATE_HASH_LABEL.into(), "0ld0ld0ld0".into());
    set.owner_references_mut().push(controller_owner_ref(owner));
    set.status = Some(EksMachineSetStatus {
        replicas,
        ready_replicas: replicas,
        available_replicas: replicas,
        ..Default::default()
    });
    set
}

async fn sets(ctx: &TestContext) -> Vec<EksMachineSet> {
    ctx.store.list::<EksMachineSet>(NS, None).await.unwrap()
}

async fn deployment_status(ctx: &TestContext) -> EksMachineDeploymentStatus {
    ctx.store
        .get::<EksMachineDeployment>(NS, "workers")
        .await
        .unwrap()
        .and_then(|d| d.status)
        .unwrap_or_default()
}

#[tokio::test]
async fn first_reconcile_creates_the_current_revision() {
    let ctx = test_context();
    let d = ctx.store.seed(&workers(3, DeploymentStrategyType::RollingUpdate)).unwrap();

    let action = reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert_eq!(action, ctx.requeue());

    let all = sets(&ctx).await;
    assert_eq!(all.len(), 1);
    let set = &all[0];
    assert_eq!(set.name_any(), format!("workers-{}", template_hash(&d)));
    assert_eq!(set.spec.replicas, Some(3));
    assert!(is_owned_by(set, &d));
    assert_eq!(event_reasons(&ctx, "workers"), vec!["MachineSetCreated".to_string()]);

    let status = deployment_status(&ctx).await;
    assert_eq!(
        condition_reason(&status.conditions, "Available").as_deref(),
        Some("MinimumReplicasUnavailable")
    );
    assert_eq!(
        condition_reason(&status.conditions, "Progressing").as_deref(),
        Some("MachineSetUpdating")
    );
}

#[tokio::test]
async fn recreate_deletes_old_revision_first() {
    let ctx = test_context();
    let d = ctx.store.seed(&workers(3, DeploymentStrategyType::Recreate)).unwrap();
    ctx.store.seed(&old_set(&d, 3)).unwrap();

    reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert!(sets(&ctx).await.is_empty());

    reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    let all = sets(&ctx).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name_any(), format!("workers-{}", template_hash(&d)));
    assert_eq!(all[0].spec.replicas, Some(3));
    assert_eq!(
        event_reasons(&ctx, "workers"),
        vec!["MachineSetDeleted".to_string(), "MachineSetCreated".to_string()]
    );
}

#[tokio::test]
async fn rolling_update_surges_before_draining() {
    let ctx = test_context();
    let d = ctx.store.seed(&workers(3, DeploymentStrategyType::RollingUpdate)).unwrap();
    ctx.store.seed(&old_set(&d, 3)).unwrap();

    reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();

    let new_name = format!("workers-{}", template_hash(&d));
    let all = sets(&ctx).await;
    assert_eq!(all.len(), 2);
    let new = all.iter().find(|s| s.name_any() == new_name).unwrap();
    let old = all.iter().find(|s| s.name_any() == "workers-old").unwrap();
    // 25% surge of 3 rounds up to one extra machine; nothing may go unavailable.
    assert_eq!(new.spec.replicas, Some(1));
    assert_eq!(old.spec.replicas, Some(3));

    let status = deployment_status(&ctx).await;
    assert_eq!(status.available_replicas, 3);
    assert_eq!(
        condition_reason(&status.conditions, "Available").as_deref(),
        Some("MinimumReplicasAvailable")
    );
}

#[tokio::test]
async fn paused_deployment_only_reports_status() {
    let ctx = test_context();
    let mut d = workers(2, DeploymentStrategyType::RollingUpdate);
    d.spec.paused = true;
    ctx.store.seed(&d).unwrap();

    let action = reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(sets(&ctx).await.is_empty());
    assert!(deployment_status(&ctx).await.observed_generation.is_some());
}

#[tokio::test]
async fn completed_rollout_settles() {
    let ctx = test_context();
    let d = ctx.store.seed(&workers(2, DeploymentStrategyType::RollingUpdate)).unwrap();
    reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();

    let name = format!("workers-{}", template_hash(&d));
    ctx.store
        .mutate::<EksMachineSet>(NS, &name, |s| {
            s.status = Some(EksMachineSetStatus {
                replicas: 2,
                ready_replicas: 2,
                available_replicas: 2,
                fully_labeled_replicas: 2,
                ..Default::default()
            });
        })
        .unwrap();

    let action = reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert_eq!(action, Action::await_change());
    let status = deployment_status(&ctx).await;
    assert_eq!(status.updated_replicas, 2);
    assert_eq!(status.unavailable_replicas, 0);
    assert_eq!(
        condition_reason(&status.conditions, "Available").as_deref(),
        Some("MinimumReplicasAvailable")
    );
    assert_eq!(
        condition_reason(&status.conditions, "Progressing").as_deref(),
        Some("NewMachineSetAvailable")
    );

    ctx.store.clear_writes();
    reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert_eq!(ctx.store.write_count(), 0, "unexpected writes: {:?}", ctx.store.writes());
}

#[tokio::test]
async fn stalled_rollout_reports_deadline_exceeded() {
    let ctx = test_context();
    let mut d = workers(3, DeploymentStrategyType::RollingUpdate);
    d.spec.progress_deadline_seconds = Some(60);
    let mut progressing = condition("Progressing", "True", "MachineSetUpdating");
    progressing.last_transition_time = Time(Utc::now() - Duration::minutes(10));
    progressing.observed_generation = Some(1);
    d.status = Some(EksMachineDeploymentStatus {
        conditions: vec![progressing],
        ..Default::default()
    });
    ctx.store.seed(&d).unwrap();

    let action = reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert_eq!(action, ctx.requeue());

    let status = deployment_status(&ctx).await;
    let c = status
        .conditions
        .iter()
        .find(|c| c.type_ == "Progressing")
        .unwrap();
    assert_eq!(c.status, "False");
    assert_eq!(c.reason, "ProgressDeadlineExceeded");
    assert!(event_reasons(&ctx, "workers").contains(&"ProgressDeadlineExceeded".to_string()));

    // The warning fires once, on the transition.
    reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    let warnings = event_reasons(&ctx, "workers")
        .into_iter()
        .filter(|r| r == "ProgressDeadlineExceeded")
        .count();
    assert_eq!(warnings, 1);
}

#[tokio::test]
async fn deletion_removes_owned_sets() {
    let ctx = test_context();
    ctx.store.seed(&workers(2, DeploymentStrategyType::RollingUpdate)).unwrap();
    reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert_eq!(sets(&ctx).await.len(), 1);

    ctx.store.delete::<EksMachineDeployment>(NS, "workers").await.unwrap();
    let action = reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(sets(&ctx).await.is_empty());
    assert!(!ctx.store.contains::<EksMachineDeployment>(NS, "workers"));
}

#[tokio::test]
async fn drained_history_does_not_hold_the_rollout_open() {
    let ctx = test_context();
    let d = ctx.store.seed(&workers(2, DeploymentStrategyType::RollingUpdate)).unwrap();
    let mut drained = old_set(&d, 0);
    drained.status = Some(EksMachineSetStatus::default());
    ctx.store.seed(&drained).unwrap();
    let mut current = old_set(&d, 2);
    current.metadata.name = Some(format!("workers-{}", template_hash(&d)));
    current
        .labels_mut()
        .insert(TEMPLATE_HASH_LABEL.into(), template_hash(&d));
    ctx.store.seed(&current).unwrap();

    let action = reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(ctx.store.contains::<EksMachineSet>(NS, "workers-old"), "history is kept");

    let status = deployment_status(&ctx).await;
    assert_eq!(status.updated_replicas, 2);
    assert_eq!(status.available_replicas, 2);
    assert_eq!(
        condition_reason(&status.conditions, "Progressing").as_deref(),
        Some("NewMachineSetAvailable")
    );
}

#[tokio::test]
async fn new_revision_restarts_the_progress_deadline() {
    let ctx = test_context();
    let mut d = workers(3, DeploymentStrategyType::RollingUpdate);
    d.spec.progress_deadline_seconds = Some(60);
    let mut stalled = condition("Progressing", "False", "ProgressDeadlineExceeded");
    stalled.last_transition_time = Time(Utc::now() - Duration::minutes(10));
    stalled.observed_generation = Some(1);
    d.status = Some(EksMachineDeploymentStatus {
        conditions: vec![stalled],
        ..Default::default()
    });
    ctx.store.seed(&d).unwrap();

    // A template edit is a new generation.
    ctx.store
        .mutate::<EksMachineDeployment>(NS, "workers", |d| {
            d.spec.template.spec.node_group.instance_type = "m7i.large".into();
            d.metadata.generation = Some(2);
        })
        .unwrap();
    reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();

    let status = deployment_status(&ctx).await;
    let c = status
        .conditions
        .iter()
        .find(|c| c.type_ == "Progressing")
        .unwrap();
    assert_eq!(c.status, "True");
    assert_eq!(c.reason, "MachineSetUpdating");
    assert_eq!(c.observed_generation, Some(2));
    assert!(!event_reasons(&ctx, "workers").contains(&"ProgressDeadlineExceeded".to_string()));
}

#[tokio::test]
async fn deletion_waits_for_machine_set_finalizers() {
    let ctx = test_context();
    let d = ctx.store.seed(&workers(1, DeploymentStrategyType::RollingUpdate)).unwrap();
    reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    let set_name = format!("workers-{}", template_hash(&d));
    // The set controller adds its finalizer on first sight.
    reconcile_machine_set(&ctx, NS, &set_name).await.unwrap();
    let set = ctx.store.get::<EksMachineSet>(NS, &set_name).await.unwrap().unwrap();
    assert!(set.finalizers().iter().any(|f| f == machine_set::FINALIZER));

    ctx.store.delete::<EksMachineDeployment>(NS, "workers").await.unwrap();
    let action = reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert_eq!(action, ctx.requeue());
    assert!(ctx.store.contains::<EksMachineDeployment>(NS, "workers"));
    let set = ctx.store.get::<EksMachineSet>(NS, &set_name).await.unwrap().unwrap();
    assert!(set.metadata.deletion_timestamp.is_some());

    reconcile_machine_set(&ctx, NS, &set_name).await.unwrap();
    assert!(!ctx.store.contains::<EksMachineSet>(NS, &set_name));

    let action = reconcile_machine_deployment(&ctx, NS, "workers").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(!ctx.store.contains::<EksMachineDeployment>(NS, "workers"));
}
