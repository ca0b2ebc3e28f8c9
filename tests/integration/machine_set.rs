use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::controller::Action;
use kube::ResourceExt;

use super::common::*;
use eksforge_operator::controller::helpers::{controller_owner_ref, CLUSTER_NAME_LABEL};
use eksforge_operator::controller::machine::{self, reconcile_machine};
use eksforge_operator::controller::machine_set::reconcile_machine_set;
use eksforge_operator::crd::machine::{EksMachine, EksMachineStatus};
use eksforge_operator::crd::machine_set::{EksMachineSet, EksMachineSetSpec};
use eksforge_operator::crd::shared::ProvisioningStatus;
use eksforge_operator::store::Store;

fn pool_selector(pool: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some([("pool".to_string(), pool.to_string())].into()),
        match_expressions: None,
    }
}

fn machine_set(name: &str, replicas: i32) -> EksMachineSet {
    in_cluster(
        EksMachineSet::new(
            name,
            EksMachineSetSpec {
                replicas: Some(replicas),
                selector: pool_selector("a"),
                template: node_group_template(&[("pool", "a")]),
                min_ready_seconds: None,
            },
        ),
        "prod",
    )
}

/// A machine in pool `a`, optionally owned by `owner`.
fn pool_machine(name: &str, owner: Option<&EksMachineSet>, ready: bool) -> EksMachine {
    let mut m = EksMachine::new(name, node_group_template(&[]).spec);
    m.labels_mut().insert("pool".into(), "a".into());
    if let Some(owner) = owner {
        m.owner_references_mut().push(controller_owner_ref(owner));
    }
    m.status = Some(EksMachineStatus {
        provisioning: ProvisioningStatus {
            ready,
            ..Default::default()
        },
        ..Default::default()
    });
    m
}

async fn machines(ctx: &TestContext) -> Vec<EksMachine> {
    ctx.store.list::<EksMachine>(NS, None).await.unwrap()
}

async fn stored(ctx: &TestContext, name: &str) -> EksMachineSet {
    ctx.store
        .get::<EksMachineSet>(NS, name)
        .await
        .unwrap()
        .expect("machine set exists")
}

fn mark_ready(ctx: &TestContext, name: &str) {
    ctx.store
        .mutate::<EksMachine>(NS, name, |m| {
            m.status.get_or_insert_with(Default::default).provisioning.ready = true;
        })
        .unwrap();
}

#[tokio::test]
async fn scales_up_from_template() {
    let ctx = test_context();
    let set = ctx.store.seed(&machine_set("pool-a", 3)).unwrap();

    let action = reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();
    assert_eq!(action, ctx.requeue());

    let created = machines(&ctx).await;
    assert_eq!(created.len(), 3);
    for m in &created {
        assert!(m.name_any().starts_with("pool-a-"));
        assert!(is_owned_by(m, &set));
        assert_eq!(m.labels().get("pool").map(String::as_str), Some("a"));
        assert_eq!(m.labels().get(CLUSTER_NAME_LABEL).map(String::as_str), Some("prod"));
        assert_eq!(m.spec.node_group.instance_type, "m6i.large");
    }
    assert_eq!(event_reasons(&ctx, "pool-a"), vec!["ScaledUp".to_string()]);
}

#[tokio::test]
async fn reports_counts_and_settles() {
    let ctx = test_context();
    ctx.store.seed(&machine_set("pool-a", 2)).unwrap();
    reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();
    for m in machines(&ctx).await {
        mark_ready(&ctx, &m.name_any());
    }

    let action = reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();
    assert_eq!(action, Action::await_change());
    let status = stored(&ctx, "pool-a").await.status.unwrap();
    assert_eq!(status.replicas, 2);
    assert_eq!(status.ready_replicas, 2);
    assert_eq!(status.available_replicas, 2);
    assert_eq!(status.fully_labeled_replicas, 2);
    assert_eq!(condition_reason(&status.conditions, "Ready").as_deref(), Some("MachinesReady"));

    ctx.store.clear_writes();
    reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();
    assert_eq!(ctx.store.write_count(), 0, "unexpected writes: {:?}", ctx.store.writes());
}

#[tokio::test]
async fn scale_down_removes_the_not_ready_machine() {
    let ctx = test_context();
    let set = ctx.store.seed(&machine_set("pool-a", 1)).unwrap();
    ctx.store.seed(&pool_machine("m1", Some(&set), true)).unwrap();
    ctx.store.seed(&pool_machine("m2", Some(&set), false)).unwrap();

    reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();

    assert!(ctx.store.contains::<EksMachine>(NS, "m1"));
    assert!(!ctx.store.contains::<EksMachine>(NS, "m2"));
    assert_eq!(event_reasons(&ctx, "pool-a"), vec!["ScaledDown".to_string()]);
}

#[tokio::test]
async fn ignores_machines_it_does_not_own() {
    let ctx = test_context();
    ctx.store.seed(&machine_set("pool-a", 1)).unwrap();
    ctx.store.seed(&pool_machine("stray", None, true)).unwrap();

    reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();

    let all = machines(&ctx).await;
    assert_eq!(all.len(), 2);
    assert!(ctx.store.contains::<EksMachine>(NS, "stray"));
    let stray = all.iter().find(|m| m.name_any() == "stray").unwrap();
    assert!(stray.owner_references().is_empty());
}

#[tokio::test]
async fn selector_must_match_template() {
    let ctx = test_context();
    let mut set = machine_set("pool-a", 2);
    set.spec.selector = pool_selector("b");
    ctx.store.seed(&set).unwrap();

    let action = reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();
    assert_eq!(action, ctx.requeue());
    assert!(machines(&ctx).await.is_empty());
    let status = stored(&ctx, "pool-a").await.status.unwrap();
    assert_eq!(condition_reason(&status.conditions, "Ready").as_deref(), Some("InvalidSpec"));
}

#[tokio::test]
async fn deletion_removes_owned_machines() {
    let ctx = test_context();
    ctx.store.seed(&machine_set("pool-a", 2)).unwrap();
    ctx.store.seed(&pool_machine("stray", None, true)).unwrap();
    reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();
    assert_eq!(machines(&ctx).await.len(), 3);

    ctx.store.delete::<EksMachineSet>(NS, "pool-a").await.unwrap();
    let action = reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();
    assert_eq!(action, Action::await_change());

    assert!(!ctx.store.contains::<EksMachineSet>(NS, "pool-a"));
    let left: Vec<String> = machines(&ctx).await.iter().map(|m| m.name_any()).collect();
    assert_eq!(left, vec!["stray".to_string()]);
}

#[tokio::test]
async fn deletion_waits_for_machine_finalizers() {
    let ctx = test_context();
    ctx.store.seed(&machine_set("pool-a", 2)).unwrap();
    reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();
    let names: Vec<String> = machines(&ctx).await.iter().map(|m| m.name_any()).collect();
    assert_eq!(names.len(), 2);
    for name in &names {
        ctx.store
            .mutate::<EksMachine>(NS, name, |m| {
                m.finalizers_mut().push(machine::FINALIZER.to_string());
            })
            .unwrap();
    }

    ctx.store.delete::<EksMachineSet>(NS, "pool-a").await.unwrap();
    let action = reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();
    assert_eq!(action, ctx.requeue());
    assert!(ctx.store.contains::<EksMachineSet>(NS, "pool-a"));
    for m in machines(&ctx).await {
        assert!(m.metadata.deletion_timestamp.is_some());
    }

    // The machine controller releases each node group and its finalizer.
    for name in &names {
        reconcile_machine(&ctx, NS, name).await.unwrap();
    }
    assert!(machines(&ctx).await.is_empty());

    let action = reconcile_machine_set(&ctx, NS, "pool-a").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(!ctx.store.contains::<EksMachineSet>(NS, "pool-a"));
}
