use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{NamespacedRef, TemplateRef};

/// WaitFor lists the prerequisites that must be satisfied before the request
/// is submitted: Workspaces must report Ready=True, Secrets must exist.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct WaitFor {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<NamespacedRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<NamespacedRef>,
}

impl WaitFor {
    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty() && self.secrets.is_empty()
    }
}

/// ApplyRequest asks for one module execution: a template rendered with the
/// given variables, applied by the executor as exactly one Workspace.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "eksforge.io",
    version = "v1alpha1",
    kind = "ApplyRequest",
    shortname = "ar",
    namespaced,
    status = "ApplyRequestStatus",
    printcolumn = r#"{"name": "Template", "type": "string", "jsonPath": ".spec.templateRef.name"}"#,
    printcolumn = r#"{"name": "Applied", "type": "boolean", "jsonPath": ".status.applied"}"#,
    printcolumn = r#"{"name": "Execution", "type": "string", "jsonPath": ".status.executionName"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequestSpec {
    pub template_ref: TemplateRef,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,

    /// Secret the executor writes module outputs into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_binding: Option<NamespacedRef>,

    #[serde(default, skip_serializing_if = "WaitFor::is_empty")]
    pub wait_for: WaitFor,

    /// Keep the request (and its infrastructure) when the owner is deleted.
    #[serde(default)]
    pub retain_on_delete: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequestStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_name: Option<String>,

    #[serde(default)]
    pub applied: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_time: Option<Time>,

    /// Hash of the module text and variables last submitted to the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
