//! Rollout planning for EksMachineDeployments.
//!
//! A planner looks at the deployment and the machine sets it owns and
//! returns the set operations to perform this pass.  Planners are pure: the
//! controller applies the operations and re-plans on the next pass, so a
//! rollout advances one observed step at a time.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::machine_deployment::{
    DeploymentStrategy, DeploymentStrategyType, EksMachineDeployment,
};
use crate::crd::machine_set::EksMachineSet;
use crate::error::{Error, Result};

mod recreate;
mod rolling_update;

pub use recreate::Recreate;
pub use rolling_update::RollingUpdate;

/// One change to a machine set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetOperation {
    /// Create the machine set for the current template revision.
    Create { replicas: i32 },
    Scale { name: String, replicas: i32 },
    Delete { name: String },
}

/// The machine sets a deployment owns, split by template revision.
#[derive(Debug, Default)]
pub struct RolloutState<'a> {
    /// The set carrying the current template hash, if it exists yet.
    pub new_set: Option<&'a EksMachineSet>,
    /// Sets for earlier revisions, oldest first.
    pub old_sets: Vec<&'a EksMachineSet>,
    /// Owned sets already marked for deletion.
    pub terminating: usize,
}

impl<'a> RolloutState<'a> {
    pub fn all_sets(&self) -> impl Iterator<Item = &'a EksMachineSet> + '_ {
        self.new_set.into_iter().chain(self.old_sets.iter().copied())
    }
}

pub trait RolloutStrategy: Send + Sync {
    fn plan(&self, deployment: &EksMachineDeployment, state: &RolloutState<'_>) -> Result<Vec<SetOperation>>;
}

pub fn strategy_for(strategy: &DeploymentStrategy) -> Box<dyn RolloutStrategy> {
    match strategy.strategy_type {
        DeploymentStrategyType::Recreate => Box::new(Recreate),
        DeploymentStrategyType::RollingUpdate => Box::new(RollingUpdate),
    }
}

/// Replica count a set has been asked for.
pub fn spec_replicas(set: &EksMachineSet) -> i32 {
    set.spec.desired_replicas()
}

pub fn available_replicas(set: &EksMachineSet) -> i32 {
    set.status.as_ref().map_or(0, |s| s.available_replicas)
}

/// Resolve an absolute-or-percentage value against `total`.  Percentages
/// round up when `round_up` is set and down otherwise.
pub fn resolve_int_or_percent(value: &IntOrString, total: i32, round_up: bool) -> Result<i32> {
    match value {
        IntOrString::Int(n) if *n >= 0 => Ok(*n),
        IntOrString::Int(n) => Err(Error::validation(format!("{n} must not be negative"))),
        IntOrString::String(s) => {
            let pct: i64 = s
                .strip_suffix('%')
                .and_then(|p| p.trim().parse().ok())
                .filter(|p| *p >= 0)
                .ok_or_else(|| Error::validation(format!("invalid value {s:?}: expected an integer or a percentage")))?;
            let scaled = pct * i64::from(total);
            let resolved = if round_up { (scaled + 99) / 100 } else { scaled / 100 };
            i32::try_from(resolved).map_err(|_| Error::validation(format!("{s} of {total} is out of range")))
        }
    }
}
