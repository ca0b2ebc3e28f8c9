//! ApplyRequest controller (the apply binding).
//!
//! Turns one ApplyRequest into exactly one Workspace of the same name:
//! resolves and compiles the template, waits on the dependency gate, submits
//! the Workspace, then mirrors the executor's conditions and outputs back.
//! A change to the compiled module or the variables resubmits the Workspace.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
};
use tracing::{debug, info};

use crate::compiler::{compile, missing_variables, submission_hash};
use crate::crd::apply_request::{ApplyRequest, ApplyRequestStatus};
use crate::crd::template::ModuleTemplate;
use crate::crd::workspace::{Workspace, WorkspaceSpec};
use crate::error::{Error, Result};
use crate::helpers::now;
use crate::store::{KubeStore, ObjectEvent, Store};

use super::dependency;
use super::helpers::{
    controller_owner_ref, ensure_owner_ref, is_deleting, remove_owner_ref, APPLY_REQUEST_LABEL,
};
use super::status::{
    find_condition, is_condition_true, mirror_condition, upsert_condition, DEPENDENCIES_READY,
    FALSE, READY, SYNCED, TRUE, UNKNOWN,
};
use super::{error_policy, finalizer, log_outcome, update_status, Context};

pub const FINALIZER: &str = "eksforge.io/apply-request-cleanup";

/// Start the ApplyRequest controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context<KubeStore>>) {
    let client = ctx.store.client().clone();
    let requests: Api<ApplyRequest> = Api::all(client.clone());
    let workspaces: Api<Workspace> = Api::all(client);

    Controller::new(requests, WatcherConfig::default())
        .owns(workspaces, WatcherConfig::default())
        .run(reconcile::<KubeStore>, error_policy::<ApplyRequest, KubeStore>, ctx)
        .for_each(log_outcome)
        .await;
}

pub async fn reconcile<S: Store>(request: Arc<ApplyRequest>, ctx: Arc<Context<S>>) -> Result<Action> {
    let ns = request.namespace().unwrap_or_default();
    reconcile_apply_request(&ctx, &ns, &request.name_any()).await
}

fn desired_workspace(request: &ApplyRequest, module: String) -> Workspace {
    let name = request.name_any();
    Workspace {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: request.namespace(),
            labels: Some([(APPLY_REQUEST_LABEL.to_string(), name)].into()),
            owner_references: Some(vec![controller_owner_ref(request)]),
            ..Default::default()
        },
        spec: WorkspaceSpec {
            module,
            variables: request.spec.variables.clone(),
            write_outputs_to_ref: request.spec.output_binding.clone(),
        },
        status: None,
    }
}

/// Create the Workspace, or take over an existing one of the same name.
async fn submit<S: Store>(
    store: &S,
    request: &ApplyRequest,
    existing: Option<Workspace>,
    module: String,
) -> Result<Workspace> {
    let desired = desired_workspace(request, module);
    let ns = request.namespace().unwrap_or_default();
    match existing {
        None => store.create(&ns, &desired).await,
        Some(current) => {
            let mut updated = current.clone();
            let owner_changed = ensure_owner_ref(&mut updated.metadata, controller_owner_ref(request));
            if !owner_changed && updated.spec == desired.spec {
                return Ok(current);
            }
            updated.spec = desired.spec;
            store.replace(&updated).await
        }
    }
}

/// True when a Workspace condition describes the spec last submitted.
/// Executors that stamp `observedGeneration` are judged by it; otherwise
/// the condition must not predate the submission.
fn reports_current_spec(c: &Condition, generation: Option<i64>, applied_at: Option<&Time>) -> bool {
    match (c.observed_generation, generation) {
        (Some(seen), Some(generation)) => seen >= generation,
        _ => applied_at.map_or(true, |t| c.last_transition_time.0 >= t.0),
    }
}

/// Persist `status` and requeue on the fixed interval.
async fn hold<S: Store>(
    ctx: &Context<S>,
    request: &ApplyRequest,
    status: ApplyRequestStatus,
) -> Result<Action> {
    update_status(&ctx.store, request, status).await?;
    Ok(ctx.requeue())
}

pub async fn reconcile_apply_request<S: Store>(
    ctx: &Context<S>,
    ns: &str,
    name: &str,
) -> Result<Action> {
    let Some(request) = ctx.store.get::<ApplyRequest>(ns, name).await? else {
        debug!(%ns, %name, "apply request already gone");
        return Ok(Action::await_change());
    };
    if is_deleting(&request) {
        return cleanup(ctx, &request).await;
    }
    let request = finalizer::ensure(&ctx.store, &request, FINALIZER).await?;
    let generation = request.metadata.generation;
    let mut status = request.status.clone().unwrap_or_default();
    status.observed_generation = generation;

    // ── Template resolution ───────────────────────────────────────────────────

    let template_name = &request.spec.template_ref.name;
    let Some(template) = ctx.store.get::<ModuleTemplate>(ns, template_name).await? else {
        let msg = format!("ModuleTemplate {ns}/{template_name} not found");
        upsert_condition(&mut status.conditions, SYNCED, FALSE, "TemplateNotFound", &msg, generation);
        update_status(&ctx.store, &request, status).await?;
        return Err(Error::NotFound(msg));
    };
    let module = match compile(&template.spec) {
        Ok(module) => module,
        Err(e) => {
            let msg = e.to_string();
            upsert_condition(&mut status.conditions, SYNCED, FALSE, "CompileFailed", &msg, generation);
            update_status(&ctx.store, &request, status).await?;
            return Err(e);
        }
    };

    let missing = missing_variables(&template.spec, &request.spec.variables);
    if !missing.is_empty() {
        let msg = format!("missing required variables: {}", missing.join(", "));
        info!(%ns, %name, %msg, "cannot submit apply request");
        upsert_condition(&mut status.conditions, SYNCED, FALSE, "MissingVariables", &msg, generation);
        return hold(ctx, &request, status).await;
    }

    // ── Dependency gate ───────────────────────────────────────────────────────

    let gate = dependency::evaluate(&ctx.store, ns, &request.spec.wait_for).await?;
    let (gate_status, gate_reason) = if gate.is_open() {
        (TRUE, "DependenciesSatisfied")
    } else {
        (FALSE, "WaitingForDependencies")
    };
    upsert_condition(
        &mut status.conditions,
        DEPENDENCIES_READY,
        gate_status,
        gate_reason,
        &gate.summary(),
        generation,
    );

    // ── Submission ────────────────────────────────────────────────────────────

    let hash = submission_hash(
        &module,
        &request.spec.variables,
        request.spec.output_binding.as_ref(),
    );
    let mut workspace = ctx.store.get::<Workspace>(ns, name).await?;

    if status.applied && workspace.is_none() {
        info!(%ns, %name, "workspace disappeared, will resubmit");
        status.applied = false;
        status.execution_name = None;
        status.outputs.clear();
        status.conditions.retain(|c| c.type_ != SYNCED && c.type_ != READY);
    }

    if !status.applied {
        if !gate.is_open() {
            debug!(%ns, %name, blockers = %gate.summary(), "waiting for dependencies");
            return hold(ctx, &request, status).await;
        }
        info!(%ns, %name, "submitting workspace");
        let submitted = submit(&ctx.store, &request, workspace.take(), module).await?;
        status.applied = true;
        status.execution_name = Some(submitted.name_any());
        status.last_applied_time = Some(now());
        status.applied_hash = Some(hash);
        ctx.store
            .publish_event(
                &request,
                ObjectEvent::normal("Applied", "Submit", format!("submitted workspace {name}")),
            )
            .await;
        workspace = Some(submitted);
    } else if status.applied_hash.as_deref() != Some(hash.as_str()) {
        if gate.is_open() {
            info!(%ns, %name, "inputs changed, resubmitting workspace");
            let submitted = submit(&ctx.store, &request, workspace.take(), module).await?;
            status.last_applied_time = Some(now());
            status.applied_hash = Some(hash);
            // What the Workspace reports now describes the previous inputs.
            for type_ in [SYNCED, READY] {
                upsert_condition(
                    &mut status.conditions,
                    type_,
                    UNKNOWN,
                    "Resubmitted",
                    "waiting for the executor to apply the changed inputs",
                    generation,
                );
            }
            status.outputs.clear();
            ctx.store
                .publish_event(
                    &request,
                    ObjectEvent::normal(
                        "Resubmitted",
                        "Submit",
                        format!("resubmitted workspace {name} with changed inputs"),
                    ),
                )
                .await;
            workspace = Some(submitted);
        } else {
            debug!(%ns, %name, blockers = %gate.summary(), "inputs changed, waiting for dependencies");
        }
    }

    // ── Status mirroring ──────────────────────────────────────────────────────

    if let Some(ws) = &workspace {
        let ws_status = ws.status.clone().unwrap_or_default();
        let applied_at = status.last_applied_time.clone();
        let mut current = false;
        for type_ in [SYNCED, READY] {
            let fresh = find_condition(&ws_status.conditions, type_)
                .filter(|c| reports_current_spec(c, ws.metadata.generation, applied_at.as_ref()));
            if let Some(c) = fresh {
                mirror_condition(&mut status.conditions, c);
                current = true;
            }
        }
        if current {
            status.outputs = ws_status.outputs;
        }
    }

    let ready = status.applied
        && is_condition_true(&status.conditions, SYNCED)
        && is_condition_true(&status.conditions, READY);
    update_status(&ctx.store, &request, status).await?;
    Ok(if ready {
        Action::await_change()
    } else {
        ctx.requeue()
    })
}

// ── Cleanup (finalizer) ──────────────────────────────────────────────────────

async fn cleanup<S: Store>(ctx: &Context<S>, request: &ApplyRequest) -> Result<Action> {
    let ns = request.namespace().unwrap_or_default();
    let name = request.name_any();
    if !finalizer::has(request, FINALIZER) {
        return Ok(Action::await_change());
    }

    if let Some(ws) = ctx.store.get::<Workspace>(&ns, &name).await? {
        if request.spec.retain_on_delete {
            let uid = request.metadata.uid.clone().unwrap_or_default();
            let mut orphaned = ws.clone();
            if remove_owner_ref(&mut orphaned.metadata, &uid) {
                info!(%ns, %name, "retaining workspace");
                ctx.store.replace(&orphaned).await?;
            }
        } else {
            if ws.metadata.deletion_timestamp.is_none() {
                info!(%ns, %name, "deleting workspace");
                ctx.store.delete::<Workspace>(&ns, &name).await?;
                ctx.store
                    .publish_event(
                        request,
                        ObjectEvent::normal("Destroying", "Delete", format!("deleting workspace {name}")),
                    )
                    .await;
            }
            if ctx.store.get::<Workspace>(&ns, &name).await?.is_some() {
                debug!(%ns, %name, "workspace still terminating");
                return Ok(ctx.requeue());
            }
        }
    }

    info!(%ns, %name, "cleanup complete, removing finalizer");
    finalizer::remove(&ctx.store, request, FINALIZER).await?;
    Ok(Action::await_change())
}
