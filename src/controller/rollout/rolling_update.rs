//! RollingUpdate: surge the new revision up and drain old revisions while
//! keeping at least `replicas - maxUnavailable` machines available.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::machine_deployment::EksMachineDeployment;
use crate::error::Result;

use super::{
    available_replicas, resolve_int_or_percent, spec_replicas, RolloutState, RolloutStrategy,
    SetOperation,
};

const DEFAULT_LIMIT: &str = "25%";

pub struct RollingUpdate;

/// Resolved `(maxSurge, maxUnavailable)` for `replicas`.
pub fn limits(deployment: &EksMachineDeployment, replicas: i32) -> Result<(i32, i32)> {
    let default = IntOrString::String(DEFAULT_LIMIT.to_string());
    let params = deployment.spec.strategy.rolling_update.clone().unwrap_or_default();
    let surge = resolve_int_or_percent(params.max_surge.as_ref().unwrap_or(&default), replicas, true)?;
    let unavailable = resolve_int_or_percent(
        params.max_unavailable.as_ref().unwrap_or(&default),
        replicas,
        false,
    )?;
    if surge == 0 && unavailable == 0 {
        return Ok((0, 1));
    }
    Ok((surge, unavailable))
}

impl RollingUpdate {
    fn scale_up(replicas: i32, surge: i32, state: &RolloutState<'_>) -> Option<SetOperation> {
        let total: i32 = state.all_sets().map(spec_replicas).sum();
        let current = state.new_set.map_or(0, spec_replicas);
        let room = (replicas + surge - total).max(0);
        let target = (current + room).min(replicas);
        match state.new_set {
            None => Some(SetOperation::Create { replicas: target }),
            Some(set) if target != current => Some(SetOperation::Scale {
                name: set.name_any(),
                replicas: target,
            }),
            Some(_) => None,
        }
    }

    fn scale_down(replicas: i32, unavailable: i32, state: &RolloutState<'_>) -> Vec<SetOperation> {
        let available: i32 = state.all_sets().map(available_replicas).sum();
        let mut budget = (available - (replicas - unavailable)).max(0);
        let mut ops = Vec::new();
        for set in &state.old_sets {
            if budget == 0 {
                break;
            }
            let current = spec_replicas(set);
            let cut = budget.min(current);
            if cut > 0 {
                ops.push(SetOperation::Scale {
                    name: set.name_any(),
                    replicas: current - cut,
                });
                budget -= cut;
            }
        }
        ops
    }

    /// Drained old sets beyond the history limit, oldest first.
    fn prune(history_limit: usize, state: &RolloutState<'_>) -> Vec<SetOperation> {
        let drained: Vec<_> = state
            .old_sets
            .iter()
            .filter(|s| spec_replicas(s) == 0)
            .collect();
        let excess = drained.len().saturating_sub(history_limit);
        drained
            .into_iter()
            .take(excess)
            .map(|s| SetOperation::Delete { name: s.name_any() })
            .collect()
    }
}

impl RolloutStrategy for RollingUpdate {
    fn plan(&self, deployment: &EksMachineDeployment, state: &RolloutState<'_>) -> Result<Vec<SetOperation>> {
        let replicas = deployment.spec.desired_replicas();
        let (surge, unavailable) = limits(deployment, replicas)?;
        let mut ops: Vec<SetOperation> = Self::scale_up(replicas, surge, state).into_iter().collect();
        ops.extend(Self::scale_down(replicas, unavailable, state));
        ops.extend(Self::prune(deployment.spec.history_limit(), state));
        Ok(ops)
    }
}
