//! Shared fixtures and helpers for the integration tests.
//!
//! Every test builds its own [`MemoryStore`], so tests are isolated and run
//! in parallel.  Objects are seeded into namespace `default`.

#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{Resource, ResourceExt};

use eksforge_operator::controller::helpers::CLUSTER_NAME_LABEL;
use eksforge_operator::controller::status::find_condition;
use eksforge_operator::controller::{apply_request, Context};
use eksforge_operator::crd::apply_request::{ApplyRequest, ApplyRequestStatus};
use eksforge_operator::crd::capi::{Cluster, ClusterSpec};
use eksforge_operator::crd::machine::{
    EksMachineSpec, MachineTemplateSpec, NodeGroupConfig, ScalingConfig, TemplateMetadata,
};
use eksforge_operator::crd::shared::TemplateRef;
use eksforge_operator::crd::template::{ModuleTemplate, ModuleTemplateSpec, TemplateVariable};
use eksforge_operator::crd::workspace::{Workspace, WorkspaceStatus};
use eksforge_operator::helpers::OperatorConfig;
use eksforge_operator::store::MemoryStore;

pub const NS: &str = "default";

pub type TestContext = Context<MemoryStore>;

pub fn test_context() -> TestContext {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn,eksforge_operator=debug")
        .with_test_writer()
        .try_init();
    Context::new(MemoryStore::new(), OperatorConfig::default())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════════════

/// A CAPI Cluster whose infrastructure and control plane share its name.
pub fn capi_cluster(name: &str) -> Cluster {
    Cluster::new(
        name,
        ClusterSpec {
            paused: false,
            infrastructure_ref: Some(ObjectReference {
                kind: Some("EksCluster".into()),
                name: Some(name.into()),
                ..Default::default()
            }),
            control_plane_ref: Some(ObjectReference {
                kind: Some("EksControlPlane".into()),
                name: Some(name.into()),
                ..Default::default()
            }),
        },
    )
}

/// Label `obj` as belonging to CAPI cluster `cluster`.
pub fn in_cluster<K: Resource>(mut obj: K, cluster: &str) -> K {
    obj.labels_mut()
        .insert(CLUSTER_NAME_LABEL.to_string(), cluster.to_string());
    obj
}

pub fn module_template(name: &str, variables: &[&str], outputs: &[&str]) -> ModuleTemplate {
    ModuleTemplate::new(
        name,
        ModuleTemplateSpec {
            source: format!("git::https://example.com/modules/{name}.git"),
            version: Some("v1.0.0".into()),
            variables: variables
                .iter()
                .map(|v| TemplateVariable {
                    name: v.to_string(),
                    description: None,
                    default: None,
                    sensitive: false,
                })
                .collect(),
            outputs: outputs.iter().map(|o| o.to_string()).collect(),
            providers: BTreeMap::new(),
            inputs: BTreeMap::new(),
        },
    )
}

pub fn node_group_template(labels: &[(&str, &str)]) -> MachineTemplateSpec {
    MachineTemplateSpec {
        metadata: TemplateMetadata {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: BTreeMap::new(),
        },
        spec: EksMachineSpec {
            template_ref: TemplateRef::new("nodegroup"),
            node_group: NodeGroupConfig {
                scaling: ScalingConfig {
                    min_size: 1,
                    max_size: 5,
                    desired_size: 2,
                },
                instance_type: "m6i.large".into(),
                labels: BTreeMap::new(),
                tags: BTreeMap::new(),
                update_policy: None,
            },
        },
    }
}

pub fn condition(type_: &str, status: &str, reason: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: String::new(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

pub fn outputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Faking the executor
// ═══════════════════════════════════════════════════════════════════════════════

/// The executor reports against the generation it applied.
fn stamp_generation(ws: &mut Workspace) {
    let generation = ws.metadata.generation;
    for c in ws.status.iter_mut().flat_map(|s| s.conditions.iter_mut()) {
        c.observed_generation = generation;
    }
}

/// Report a Workspace as applied, with the given outputs.
pub fn complete_workspace(ctx: &TestContext, name: &str, out: &[(&str, &str)]) {
    ctx.store
        .mutate::<Workspace>(NS, name, |ws| {
            ws.status = Some(WorkspaceStatus {
                conditions: vec![
                    condition("Synced", "True", "Applied"),
                    condition("Ready", "True", "Available"),
                ],
                outputs: outputs(out),
            });
            stamp_generation(ws);
        })
        .expect("workspace exists");
}

/// Report a Workspace apply as failed.
pub fn fail_workspace(ctx: &TestContext, name: &str, reason: &str) {
    ctx.store
        .mutate::<Workspace>(NS, name, |ws| {
            ws.status = Some(WorkspaceStatus {
                conditions: vec![
                    condition("Synced", "True", "Applied"),
                    condition("Ready", "False", reason),
                ],
                outputs: BTreeMap::new(),
            });
            stamp_generation(ws);
        })
        .expect("workspace exists");
}

/// Short-cut the apply binding: mark an ApplyRequest as applied and Ready.
pub fn mark_request_ready(ctx: &TestContext, name: &str, out: &[(&str, &str)]) {
    ctx.store
        .mutate::<ApplyRequest>(NS, name, |ar| {
            ar.status = Some(ApplyRequestStatus {
                execution_name: Some(name.to_string()),
                applied: true,
                outputs: outputs(out),
                conditions: vec![
                    condition("Synced", "True", "Applied"),
                    condition("Ready", "True", "Available"),
                ],
                ..Default::default()
            });
        })
        .expect("apply request exists");
}

/// Run the apply binding for `name` and fake the executor finishing it.
pub async fn apply_and_complete(ctx: &TestContext, name: &str, out: &[(&str, &str)]) {
    apply_request::reconcile_apply_request(ctx, NS, name)
        .await
        .expect("submit apply request");
    complete_workspace(ctx, name, out);
    apply_request::reconcile_apply_request(ctx, NS, name)
        .await
        .expect("mirror workspace status");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Assertions
// ═══════════════════════════════════════════════════════════════════════════════

pub fn condition_reason(conditions: &[Condition], type_: &str) -> Option<String> {
    find_condition(conditions, type_).map(|c| c.reason.clone())
}

pub fn event_reasons(ctx: &TestContext, name: &str) -> Vec<String> {
    ctx.store
        .events()
        .into_iter()
        .filter(|e| e.key.name == name)
        .map(|e| e.event.reason)
        .collect()
}

pub fn is_owned_by<K: Resource<DynamicType = ()>>(obj: &impl Resource, owner: &K) -> bool {
    let uid = owner.meta().uid.clone().unwrap_or_default();
    obj.owner_references().iter().any(|r| r.uid == uid)
}
