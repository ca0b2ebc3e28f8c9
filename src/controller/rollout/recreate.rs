//! Recreate: tear every old revision down, then bring the new one up.

use kube::ResourceExt;

use crate::crd::machine_deployment::EksMachineDeployment;
use crate::error::Result;

use super::{spec_replicas, RolloutState, RolloutStrategy, SetOperation};

pub struct Recreate;

impl RolloutStrategy for Recreate {
    fn plan(&self, deployment: &EksMachineDeployment, state: &RolloutState<'_>) -> Result<Vec<SetOperation>> {
        if !state.old_sets.is_empty() {
            return Ok(state
                .old_sets
                .iter()
                .map(|s| SetOperation::Delete { name: s.name_any() })
                .collect());
        }
        // Old sets still draining their machines.
        if state.terminating > 0 {
            return Ok(vec![]);
        }
        let replicas = deployment.spec.desired_replicas();
        Ok(match state.new_set {
            None => vec![SetOperation::Create { replicas }],
            Some(set) if spec_replicas(set) != replicas => vec![SetOperation::Scale {
                name: set.name_any(),
                replicas,
            }],
            Some(_) => vec![],
        })
    }
}
