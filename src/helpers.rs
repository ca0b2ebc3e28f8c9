use std::time::Duration;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// ── Operator configuration (injected via CLI flags / env) ─────────────────────

/// Process-wide settings gathered from CLI flags at startup and shared with
/// every controller through the `Context`.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Fixed retry interval for waiting and domain-failure states.
    pub requeue_interval: Duration,
    /// Backoff applied by the error policy to unexpected errors.
    pub error_backoff: Duration,
    /// ModuleTemplate used for kubeconfig derivation when a control plane
    /// does not name one.
    pub kubeconfig_template: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            requeue_interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(30),
            kubeconfig_template: "eks-kubeconfig".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Reject settings that would make every controller spin or stall.
    pub fn validate(&self) -> Result<()> {
        if self.requeue_interval.is_zero() {
            return Err(Error::config("requeue interval must be greater than zero"));
        }
        if self.error_backoff.is_zero() {
            return Err(Error::config("error backoff must be greater than zero"));
        }
        if self.kubeconfig_template.trim().is_empty() {
            return Err(Error::config("kubeconfig template name must not be empty"));
        }
        Ok(())
    }
}

// ── Time / hashing ────────────────────────────────────────────────────────────

pub fn now() -> Time {
    Time(Utc::now())
}

/// SHA-256 hash of a string, returned as hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short, label-safe hash of any serialisable value.  Serialisation goes
/// through `serde_json::Value`, whose maps are ordered, so the result does
/// not depend on field or map insertion order.
pub fn short_hash<T: Serialize>(value: &T) -> String {
    let canonical = serde_json::to_value(value)
        .map(|v| v.to_string())
        .unwrap_or_default();
    sha256_hex(&canonical)[..10].to_string()
}

// ── Naming helpers ────────────────────────────────────────────────────────────

pub fn vpc_request_name(cluster: &str) -> String {
    format!("{cluster}-vpc")
}

pub fn eks_request_name(control_plane: &str) -> String {
    format!("{control_plane}-eks")
}

pub fn kubeconfig_request_name(control_plane: &str) -> String {
    format!("{control_plane}-kubeconfig")
}

/// Secret the kubeconfig request writes into, keyed by the CAPI cluster.
pub fn kubeconfig_secret_name(capi_cluster: &str) -> String {
    format!("{capi_cluster}-kubeconfig")
}

pub fn nodegroup_request_name(machine: &str) -> String {
    format!("{machine}-nodegroup")
}

/// Name of the machine set a deployment creates for one template revision.
pub fn machine_set_name(deployment: &str, template_hash: &str) -> String {
    format!("{deployment}-{template_hash}")
}

/// Strip any URL scheme and trailing slash from an API endpoint.
pub fn endpoint_host(endpoint: &str) -> String {
    let host = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    host.trim_end_matches('/').to_string()
}
