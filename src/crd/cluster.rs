use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{ProvisioningStatus, TemplateRef, TemplateStatus};

/// VpcSource selects how the cluster network is obtained: provisioned from a
/// module template, or adopted from an existing VPC id.  Exactly one of the
/// two must be set.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VpcSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Keep the provisioned VPC when the EksCluster is deleted.
    #[serde(default)]
    pub retain_on_delete: bool,
}

/// The resolved, validated form of a [`VpcSource`].
#[derive(Debug, PartialEq, Eq)]
pub enum VpcSourceKind<'a> {
    Template(&'a TemplateRef),
    Existing(&'a str),
}

impl VpcSource {
    pub fn resolve(&self) -> Result<VpcSourceKind<'_>, String> {
        let id = self.id.as_deref().filter(|id| !id.is_empty());
        let template = self.template_ref.as_ref().filter(|t| !t.name.is_empty());
        match (template, id) {
            (Some(t), None) => Ok(VpcSourceKind::Template(t)),
            (None, Some(id)) => Ok(VpcSourceKind::Existing(id)),
            (Some(_), Some(_)) => {
                Err("spec.vpc.templateRef and spec.vpc.id are mutually exclusive".to_string())
            }
            (None, None) => {
                Err("exactly one of spec.vpc.templateRef or spec.vpc.id must be set".to_string())
            }
        }
    }
}

/// EksCluster is the infrastructure cluster: region and network for an EKS
/// control plane.  It is owned by a cluster.x-k8s.io Cluster.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "eksforge.io",
    version = "v1alpha1",
    kind = "EksCluster",
    shortname = "ekscl",
    namespaced,
    status = "EksClusterStatus",
    printcolumn = r#"{"name": "Region", "type": "string", "jsonPath": ".spec.region"}"#,
    printcolumn = r#"{"name": "VPC", "type": "string", "jsonPath": ".status.vpcId"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EksClusterSpec {
    pub region: String,

    pub vpc: VpcSource,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EksClusterStatus {
    #[serde(flatten)]
    pub provisioning: ProvisioningStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_status: Option<TemplateStatus>,
}
