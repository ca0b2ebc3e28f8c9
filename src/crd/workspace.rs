use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::NamespacedRef;

/// Workspace is the execution unit consumed by the module executor.  The
/// operator writes the spec; the executor owns the status and reports
/// `Synced` and `Ready` conditions plus module outputs.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "executor.eksforge.io",
    version = "v1alpha1",
    kind = "Workspace",
    shortname = "ws",
    namespaced,
    status = "WorkspaceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Compiled module source text.
    pub module: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_outputs_to_ref: Option<NamespacedRef>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WorkspaceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}
