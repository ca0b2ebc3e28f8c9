use kube::runtime::controller::Action;
use kube::ResourceExt;

use super::common::*;
use eksforge_operator::controller::apply_request::reconcile_apply_request;
use eksforge_operator::controller::helpers::APPLY_REQUEST_LABEL;
use eksforge_operator::crd::apply_request::{ApplyRequest, ApplyRequestSpec, WaitFor};
use eksforge_operator::crd::shared::{NamespacedRef, TemplateRef};
use eksforge_operator::crd::workspace::Workspace;
use eksforge_operator::error::Error;
use eksforge_operator::store::Store;

fn request(name: &str, variables: &[(&str, &str)]) -> ApplyRequest {
    ApplyRequest::new(
        name,
        ApplyRequestSpec {
            template_ref: TemplateRef::new("vpc"),
            variables: outputs(variables),
            output_binding: None,
            wait_for: WaitFor::default(),
            retain_on_delete: false,
        },
    )
}

fn seed_template(ctx: &TestContext) {
    ctx.store
        .seed(&module_template("vpc", &["region"], &["vpc_id"]))
        .unwrap();
}

async fn stored(ctx: &TestContext, name: &str) -> ApplyRequest {
    ctx.store
        .get::<ApplyRequest>(NS, name)
        .await
        .unwrap()
        .expect("ApplyRequest exists")
}

async fn workspace(ctx: &TestContext, name: &str) -> Workspace {
    ctx.store
        .get::<Workspace>(NS, name)
        .await
        .unwrap()
        .expect("Workspace exists")
}

#[tokio::test]
async fn missing_template_is_a_retryable_error() {
    let ctx = test_context();
    ctx.store.seed(&request("net", &[("region", "eu-west-1")])).unwrap();

    let err = reconcile_apply_request(&ctx, NS, "net").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(err.is_transient());

    let status = stored(&ctx, "net").await.status.unwrap();
    assert_eq!(
        condition_reason(&status.conditions, "Synced").as_deref(),
        Some("TemplateNotFound")
    );
    assert!(!ctx.store.contains::<Workspace>(NS, "net"));
}

#[tokio::test]
async fn missing_variables_block_submission() {
    let ctx = test_context();
    seed_template(&ctx);
    ctx.store.seed(&request("net", &[])).unwrap();

    let action = reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    assert_eq!(action, ctx.requeue());

    let status = stored(&ctx, "net").await.status.unwrap();
    assert!(!status.applied);
    assert_eq!(
        condition_reason(&status.conditions, "Synced").as_deref(),
        Some("MissingVariables")
    );
    assert!(!ctx.store.contains::<Workspace>(NS, "net"));
}

#[tokio::test]
async fn submits_one_workspace_and_mirrors_its_status() {
    let ctx = test_context();
    seed_template(&ctx);
    let mut ar = request("net", &[("region", "eu-west-1")]);
    ar.spec.output_binding = Some(NamespacedRef::local("net-outputs"));
    let ar = ctx.store.seed(&ar).unwrap();

    let action = reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    assert_eq!(action, ctx.requeue());

    let ws = workspace(&ctx, "net").await;
    assert!(is_owned_by(&ws, &ar));
    assert_eq!(ws.labels().get(APPLY_REQUEST_LABEL).map(String::as_str), Some("net"));
    assert_eq!(ws.spec.variables["region"], "eu-west-1");
    assert!(ws.spec.module.contains("example.com/modules/vpc.git"));
    assert_eq!(
        ws.spec.write_outputs_to_ref.as_ref().map(|r| r.name.as_str()),
        Some("net-outputs")
    );

    let status = stored(&ctx, "net").await.status.unwrap();
    assert!(status.applied);
    assert_eq!(status.execution_name.as_deref(), Some("net"));
    assert!(status.last_applied_time.is_some());
    assert!(status.applied_hash.is_some());
    assert_eq!(event_reasons(&ctx, "net"), vec!["Applied".to_string()]);

    complete_workspace(&ctx, "net", &[("vpc_id", "vpc-12345")]);
    let action = reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    assert_eq!(action, Action::await_change());

    let status = stored(&ctx, "net").await.status.unwrap();
    assert_eq!(status.outputs.get("vpc_id").map(String::as_str), Some("vpc-12345"));
    assert_eq!(condition_reason(&status.conditions, "Ready").as_deref(), Some("Available"));

    ctx.store.clear_writes();
    reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    assert_eq!(ctx.store.write_count(), 0, "unexpected writes: {:?}", ctx.store.writes());
}

#[tokio::test]
async fn dependency_gate_holds_submission() {
    let ctx = test_context();
    seed_template(&ctx);
    let mut ar = request("nodes", &[("region", "eu-west-1")]);
    ar.spec.wait_for = WaitFor {
        workspaces: vec![NamespacedRef::local("net")],
        secrets: vec![NamespacedRef::local("net-outputs")],
    };
    ctx.store.seed(&ar).unwrap();

    let action = reconcile_apply_request(&ctx, NS, "nodes").await.unwrap();
    assert_eq!(action, ctx.requeue());
    let status = stored(&ctx, "nodes").await.status.unwrap();
    assert!(!status.applied);
    assert_eq!(
        condition_reason(&status.conditions, "DependenciesReady").as_deref(),
        Some("WaitingForDependencies")
    );
    assert!(!ctx.store.contains::<Workspace>(NS, "nodes"));

    // The prerequisite applies and publishes its outputs Secret.
    ctx.store.seed(&request("net", &[("region", "eu-west-1")])).unwrap();
    reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    complete_workspace(&ctx, "net", &[]);
    reconcile_apply_request(&ctx, NS, "nodes").await.unwrap();
    assert!(!ctx.store.contains::<Workspace>(NS, "nodes"), "secret still missing");

    ctx.store
        .seed(&k8s_openapi::api::core::v1::Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("net-outputs".into()),
                namespace: Some(NS.into()),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
    reconcile_apply_request(&ctx, NS, "nodes").await.unwrap();

    assert!(ctx.store.contains::<Workspace>(NS, "nodes"));
    let status = stored(&ctx, "nodes").await.status.unwrap();
    assert!(status.applied);
    assert_eq!(
        condition_reason(&status.conditions, "DependenciesReady").as_deref(),
        Some("DependenciesSatisfied")
    );
}

#[tokio::test]
async fn changed_variables_resubmit_the_workspace() {
    let ctx = test_context();
    seed_template(&ctx);
    ctx.store.seed(&request("net", &[("region", "eu-west-1")])).unwrap();
    apply_and_complete(&ctx, "net", &[("vpc_id", "vpc-old")]).await;
    let first_hash = stored(&ctx, "net").await.status.unwrap().applied_hash;

    ctx.store
        .mutate::<ApplyRequest>(NS, "net", |ar| {
            ar.spec.variables.insert("region".into(), "us-east-1".into());
        })
        .unwrap();
    let action = reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    assert_eq!(action, ctx.requeue());

    let ws = workspace(&ctx, "net").await;
    assert_eq!(ws.spec.variables["region"], "us-east-1");
    let status = stored(&ctx, "net").await.status.unwrap();
    assert_ne!(status.applied_hash, first_hash);
    assert_eq!(
        event_reasons(&ctx, "net"),
        vec!["Applied".to_string(), "Resubmitted".to_string()]
    );

    // The executor has not applied the new inputs yet.
    assert_eq!(condition_reason(&status.conditions, "Ready").as_deref(), Some("Resubmitted"));
    assert!(status.outputs.is_empty());
    let action = reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    assert_eq!(action, ctx.requeue());
    let status = stored(&ctx, "net").await.status.unwrap();
    assert_eq!(condition_reason(&status.conditions, "Ready").as_deref(), Some("Resubmitted"));
    assert!(status.outputs.is_empty());

    complete_workspace(&ctx, "net", &[("vpc_id", "vpc-new")]);
    let action = reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    assert_eq!(action, Action::await_change());
    let status = stored(&ctx, "net").await.status.unwrap();
    assert_eq!(condition_reason(&status.conditions, "Ready").as_deref(), Some("Available"));
    assert_eq!(status.outputs.get("vpc_id").map(String::as_str), Some("vpc-new"));
}

#[tokio::test]
async fn changed_output_binding_resubmits_the_workspace() {
    let ctx = test_context();
    seed_template(&ctx);
    ctx.store.seed(&request("net", &[("region", "eu-west-1")])).unwrap();
    apply_and_complete(&ctx, "net", &[]).await;

    ctx.store
        .mutate::<ApplyRequest>(NS, "net", |ar| {
            ar.spec.output_binding = Some(NamespacedRef::local("net-outputs"));
        })
        .unwrap();
    reconcile_apply_request(&ctx, NS, "net").await.unwrap();

    let ws = workspace(&ctx, "net").await;
    assert_eq!(
        ws.spec.write_outputs_to_ref.as_ref().map(|r| r.name.as_str()),
        Some("net-outputs")
    );
    assert_eq!(
        event_reasons(&ctx, "net"),
        vec!["Applied".to_string(), "Resubmitted".to_string()]
    );
}

#[tokio::test]
async fn vanished_workspace_is_resubmitted() {
    let ctx = test_context();
    seed_template(&ctx);
    ctx.store.seed(&request("net", &[("region", "eu-west-1")])).unwrap();
    apply_and_complete(&ctx, "net", &[("vpc_id", "vpc-1")]).await;

    ctx.store.delete::<Workspace>(NS, "net").await.unwrap();
    let action = reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    assert_eq!(action, ctx.requeue());

    assert!(ctx.store.contains::<Workspace>(NS, "net"));
    let status = stored(&ctx, "net").await.status.unwrap();
    assert!(status.applied);
    assert!(status.outputs.is_empty());
    assert_eq!(condition_reason(&status.conditions, "Ready"), None);
}

#[tokio::test]
async fn deletion_waits_for_workspace_teardown() {
    let ctx = test_context();
    seed_template(&ctx);
    ctx.store.seed(&request("net", &[("region", "eu-west-1")])).unwrap();
    apply_and_complete(&ctx, "net", &[]).await;

    // The executor holds its own finalizer until the destroy has run.
    ctx.store
        .mutate::<Workspace>(NS, "net", |ws| {
            ws.finalizers_mut().push("executor.eksforge.io/destroy".into());
        })
        .unwrap();
    ctx.store.delete::<ApplyRequest>(NS, "net").await.unwrap();

    let action = reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    assert_eq!(action, ctx.requeue());
    assert!(ctx.store.contains::<ApplyRequest>(NS, "net"));
    let ws = workspace(&ctx, "net").await;
    assert!(ws.metadata.deletion_timestamp.is_some());

    let mut destroyed = ws.clone();
    destroyed.finalizers_mut().clear();
    ctx.store.replace(&destroyed).await.unwrap();
    assert!(!ctx.store.contains::<Workspace>(NS, "net"));

    let action = reconcile_apply_request(&ctx, NS, "net").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(!ctx.store.contains::<ApplyRequest>(NS, "net"));
}

#[tokio::test]
async fn retained_workspace_is_orphaned_not_destroyed() {
    let ctx = test_context();
    seed_template(&ctx);
    let mut ar = request("net", &[("region", "eu-west-1")]);
    ar.spec.retain_on_delete = true;
    ctx.store.seed(&ar).unwrap();
    apply_and_complete(&ctx, "net", &[]).await;

    ctx.store.delete::<ApplyRequest>(NS, "net").await.unwrap();
    reconcile_apply_request(&ctx, NS, "net").await.unwrap();

    assert!(!ctx.store.contains::<ApplyRequest>(NS, "net"));
    let ws = workspace(&ctx, "net").await;
    assert!(ws.metadata.deletion_timestamp.is_none());
    assert!(ws.owner_references().is_empty());
}

#[tokio::test]
async fn compile_errors_are_reported() {
    let ctx = test_context();
    let mut template = module_template("vpc", &["region"], &[]);
    template.spec.source = String::new();
    ctx.store.seed(&template).unwrap();
    ctx.store.seed(&request("net", &[("region", "eu-west-1")])).unwrap();

    let err = reconcile_apply_request(&ctx, NS, "net").await.unwrap_err();
    assert!(matches!(err, Error::Compile(_)));
    let status = stored(&ctx, "net").await.status.unwrap();
    assert_eq!(
        condition_reason(&status.conditions, "Synced").as_deref(),
        Some("CompileFailed")
    );
}
