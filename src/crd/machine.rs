use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{ProvisioningStatus, TemplateRef, TemplateStatus};

// ── Spec sub-types ────────────────────────────────────────────────────────────

/// ScalingConfig bounds the node group's autoscaling range.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingConfig {
    #[serde(default = "default_one")]
    pub min_size: i32,
    #[serde(default = "default_one")]
    pub max_size: i32,
    #[serde(default = "default_one")]
    pub desired_size: i32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 1,
            desired_size: 1,
        }
    }
}

fn default_one() -> i32 {
    1
}

impl ScalingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_size < 0 {
            return Err(format!("scaling.minSize {} must be >= 0", self.min_size));
        }
        if self.max_size < 1 {
            return Err(format!("scaling.maxSize {} must be >= 1", self.max_size));
        }
        if self.min_size > self.max_size {
            return Err(format!(
                "scaling.minSize {} exceeds scaling.maxSize {}",
                self.min_size, self.max_size
            ));
        }
        if self.desired_size < self.min_size || self.desired_size > self.max_size {
            return Err(format!(
                "scaling.desiredSize {} is outside [{}, {}]",
                self.desired_size, self.min_size, self.max_size
            ));
        }
        Ok(())
    }
}

/// UpdatePolicy limits how many nodes may be unavailable during a node-group
/// version or launch-template update.  At most one field may be set.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable_percentage: Option<i32>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupConfig {
    #[serde(default)]
    pub scaling: ScalingConfig,

    pub instance_type: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<UpdatePolicy>,
}

impl NodeGroupConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.instance_type.trim().is_empty() {
            return Err("nodeGroup.instanceType must be set".to_string());
        }
        self.scaling.validate()?;
        if let Some(policy) = &self.update_policy {
            match (policy.max_unavailable, policy.max_unavailable_percentage) {
                (Some(_), Some(_)) => {
                    return Err("updatePolicy.maxUnavailable and updatePolicy.maxUnavailablePercentage are mutually exclusive".to_string());
                }
                (Some(n), None) if n < 1 => {
                    return Err(format!("updatePolicy.maxUnavailable {n} must be >= 1"));
                }
                (None, Some(p)) if !(1..=100).contains(&p) => {
                    return Err(format!(
                        "updatePolicy.maxUnavailablePercentage {p} must be within 1..=100"
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// EksMachine is one managed node group.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "eksforge.io",
    version = "v1alpha1",
    kind = "EksMachine",
    shortname = "eksm",
    namespaced,
    status = "EksMachineStatus",
    printcolumn = r#"{"name": "Instance", "type": "string", "jsonPath": ".spec.nodeGroup.instanceType"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".status.currentSize"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EksMachineSpec {
    pub template_ref: TemplateRef,
    pub node_group: NodeGroupConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EksMachineStatus {
    #[serde(flatten)]
    pub provisioning: ProvisioningStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_size: Option<i32>,

    /// First time the node group was observed Ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Time>,

    /// Last time the observed node-group size changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_status: Option<TemplateStatus>,
}

// ── Machine templates (shared by machine sets and deployments) ───────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// MachineTemplateSpec describes the EksMachines a replica controller stamps out.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MachineTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    pub spec: EksMachineSpec,
}
