//! Status and condition projection shared by every reconciler.
//!
//! The rule that ties the layers together: a resource is Ready exactly when
//! its ApplyRequest is applied and reports `Synced=True` and `Ready=True`.
//! The first `False` condition (Synced before Ready) becomes the resource's
//! failure, message copied verbatim.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::ResourceExt;

use crate::crd::apply_request::ApplyRequest;
use crate::crd::shared::{ProvisioningPhase, ProvisioningStatus, TemplateStatus};
use crate::helpers::now;

pub const READY: &str = "Ready";
pub const SYNCED: &str = "Synced";
pub const DEPENDENCIES_READY: &str = "DependenciesReady";

pub const TRUE: &str = "True";
pub const FALSE: &str = "False";
pub const UNKNOWN: &str = "Unknown";

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == TRUE)
}

/// Insert or update the condition of `type_`, keeping first-seen order.
/// `lastTransitionTime` only moves when the status value changes.  Returns
/// true when anything changed.
pub fn upsert_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status == status
                && existing.reason == reason
                && existing.message == message
                && existing.observed_generation == generation
            {
                return false;
            }
            if existing.status != status {
                existing.last_transition_time = now();
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = generation;
            true
        }
        None => {
            conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                observed_generation: generation,
                last_transition_time: now(),
            });
            true
        }
    }
}

/// Copy a condition from another object verbatim (timestamps included).
pub fn mirror_condition(conditions: &mut Vec<Condition>, source: &Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == source.type_) {
        Some(existing) if existing == source => false,
        Some(existing) => {
            *existing = source.clone();
            true
        }
        None => {
            conditions.push(source.clone());
            true
        }
    }
}

// ── Readiness derived from an ApplyRequest ────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub failed: bool,
    pub reason: String,
    pub message: String,
}

impl Readiness {
    fn pending(reason: &str, message: &str) -> Self {
        Self {
            ready: false,
            failed: false,
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    pub fn status(&self) -> &'static str {
        if self.ready {
            TRUE
        } else {
            FALSE
        }
    }
}

pub fn derive_readiness(request: Option<&ApplyRequest>) -> Readiness {
    let Some(request) = request else {
        return Readiness::pending("ApplyRequestPending", "apply request has not been created");
    };
    let status = request.status.clone().unwrap_or_default();

    for type_ in [SYNCED, READY] {
        if let Some(c) = find_condition(&status.conditions, type_).filter(|c| c.status == FALSE) {
            let reason = if c.reason.is_empty() {
                "ExecutionFailed".to_string()
            } else {
                c.reason.clone()
            };
            return Readiness {
                ready: false,
                failed: true,
                reason,
                message: c.message.clone(),
            };
        }
    }

    if !status.applied {
        return Readiness::pending(
            "Applying",
            &format!("waiting for apply request {} to be submitted", request.name_any()),
        );
    }
    if is_condition_true(&status.conditions, SYNCED) && is_condition_true(&status.conditions, READY) {
        return Readiness {
            ready: true,
            failed: false,
            reason: "Provisioned".to_string(),
            message: format!("apply request {} is ready", request.name_any()),
        };
    }
    Readiness::pending(
        "Provisioning",
        &format!("waiting for apply request {} to report Ready", request.name_any()),
    )
}

// ── Provisioning status transitions ───────────────────────────────────────────

impl ProvisioningStatus {
    /// Blocked on a prerequisite: not a failure, just not ready yet.
    pub fn mark_waiting(&mut self, reason: &str, message: &str, generation: Option<i64>) {
        self.phase = Some(ProvisioningPhase::Creating);
        self.ready = false;
        self.failure_reason = None;
        self.failure_message = None;
        upsert_condition(&mut self.conditions, READY, FALSE, reason, message, generation);
    }

    pub fn mark_failed(&mut self, reason: &str, message: &str, generation: Option<i64>) {
        self.phase = Some(ProvisioningPhase::Failed);
        self.ready = false;
        self.failure_reason = Some(reason.to_string());
        self.failure_message = Some(message.to_string());
        upsert_condition(&mut self.conditions, READY, FALSE, reason, message, generation);
    }

    pub fn mark_ready(&mut self, message: &str, generation: Option<i64>) {
        self.phase = Some(ProvisioningPhase::Ready);
        self.ready = true;
        self.failure_reason = None;
        self.failure_message = None;
        upsert_condition(&mut self.conditions, READY, TRUE, "Provisioned", message, generation);
    }

    pub fn apply_readiness(&mut self, readiness: &Readiness, generation: Option<i64>) {
        if readiness.ready {
            self.mark_ready(&readiness.message, generation);
        } else if readiness.failed {
            self.mark_failed(&readiness.reason, &readiness.message, generation);
        } else {
            self.mark_waiting(&readiness.reason, &readiness.message, generation);
        }
    }
}

impl TemplateStatus {
    /// Snapshot of an ApplyRequest's execution state.
    pub fn from_request(request: &ApplyRequest) -> Self {
        let status = request.status.clone().unwrap_or_default();
        let conditions = [SYNCED, READY]
            .iter()
            .filter_map(|t| find_condition(&status.conditions, t).cloned())
            .collect();
        Self {
            apply_request: request.name_any(),
            execution_name: status.execution_name,
            applied: status.applied,
            last_applied_time: status.last_applied_time,
            conditions,
        }
    }
}
