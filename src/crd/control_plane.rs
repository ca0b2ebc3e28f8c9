use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{ProvisioningStatus, TemplateRef, TemplateStatus};

// ── Spec sub-types ────────────────────────────────────────────────────────────

/// EndpointAccess controls public/private reachability of the API server.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAccess {
    #[serde(default = "default_true")]
    pub public: bool,
    #[serde(default)]
    pub private: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_cidrs: Vec<String>,
}

impl Default for EndpointAccess {
    fn default() -> Self {
        Self {
            public: true,
            private: false,
            public_cidrs: vec![],
        }
    }
}

fn default_true() -> bool {
    true
}

/// Addon is an EKS managed addon installed alongside the control plane.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Addon {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub endpoint_access: EndpointAccess,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<Addon>,
    /// Overrides the region of the infrastructure cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// ApiEndpoint is the address of the Kubernetes API server.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProfileSelector {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// NodePoolProfile is an extra serverless node-pool profile (Fargate-style).
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<ProfileSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<String>,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// EksControlPlane provisions the managed Kubernetes control plane and the
/// kubeconfig Secret for a cluster.x-k8s.io Cluster.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "eksforge.io",
    version = "v1alpha1",
    kind = "EksControlPlane",
    shortname = "ekscp",
    namespaced,
    status = "EksControlPlaneStatus",
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.version"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Endpoint", "type": "string", "jsonPath": ".spec.endpoint.host"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EksControlPlaneSpec {
    pub version: String,

    pub template_ref: TemplateRef,

    #[serde(default)]
    pub config: ControlPlaneConfig,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_tags: BTreeMap<String, String>,

    /// Filled in by the operator from the provisioning outputs when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<ApiEndpoint>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_pool_profiles: Vec<NodePoolProfile>,

    /// Template used to derive the kubeconfig Secret.  Defaults to the
    /// operator's `--kubeconfig-template`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_template_ref: Option<TemplateRef>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EksControlPlaneStatus {
    #[serde(flatten)]
    pub provisioning: ProvisioningStatus,

    /// True once the control plane itself has been provisioned, even if the
    /// kubeconfig is not yet available.
    #[serde(default)]
    pub initialized: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eks_cluster_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_status: Option<TemplateStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_status: Option<TemplateStatus>,
}

impl EksControlPlaneSpec {
    /// Validate the fields the provisioning module cannot default.
    pub fn validate(&self) -> Result<(), String> {
        let mut parts = self.version.split('.');
        let major = parts.next().and_then(|p| p.parse::<u32>().ok());
        let minor = parts.next().and_then(|p| p.parse::<u32>().ok());
        if major.is_none() || minor.is_none() {
            return Err(format!(
                "spec.version {:?} must look like <major>.<minor>",
                self.version
            ));
        }
        if self.template_ref.name.is_empty() {
            return Err("spec.templateRef.name must be set".to_string());
        }
        if let Some(profile) = self.node_pool_profiles.iter().find(|p| p.selectors.is_empty()) {
            return Err(format!(
                "node pool profile {:?} needs at least one selector",
                profile.name
            ));
        }
        Ok(())
    }
}
