//! Dependency gate for ApplyRequests.
//!
//! An AND-join over the wait-list: every named Workspace must exist and
//! report `Ready=True`, every named Secret must exist.  Anything else keeps
//! the gate closed and the caller retries on its fixed interval.  There is
//! no cycle detection; a cycle simply never opens.

use std::fmt;

use k8s_openapi::api::core::v1::Secret;

use crate::crd::apply_request::WaitFor;
use crate::crd::workspace::Workspace;
use crate::error::Result;
use crate::store::Store;

use super::status::{find_condition, READY, TRUE};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockReason {
    Missing,
    NotReady(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blocker {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
    pub reason: BlockReason,
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            BlockReason::Missing => write!(f, "{} {}/{} not found", self.kind, self.namespace, self.name),
            BlockReason::NotReady(msg) if msg.is_empty() => {
                write!(f, "{} {}/{} not ready", self.kind, self.namespace, self.name)
            }
            BlockReason::NotReady(msg) => {
                write!(f, "{} {}/{} not ready: {msg}", self.kind, self.namespace, self.name)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Gate {
    Open,
    Blocked(Vec<Blocker>),
}

impl Gate {
    pub fn is_open(&self) -> bool {
        matches!(self, Gate::Open)
    }

    /// One line listing every blocker, for condition messages.
    pub fn summary(&self) -> String {
        match self {
            Gate::Open => "all dependencies are ready".to_string(),
            Gate::Blocked(blockers) => blockers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// Judge a single prerequisite Workspace.
pub fn assess_workspace(workspace: Option<&Workspace>) -> Option<BlockReason> {
    let Some(ws) = workspace else {
        return Some(BlockReason::Missing);
    };
    let conditions = ws
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    match find_condition(conditions, READY) {
        Some(c) if c.status == TRUE => None,
        Some(c) => Some(BlockReason::NotReady(c.message.clone())),
        None => Some(BlockReason::NotReady(String::new())),
    }
}

/// Evaluate the whole wait-list.  Namespaces default to `namespace`.
pub async fn evaluate<S: Store>(store: &S, namespace: &str, wait_for: &WaitFor) -> Result<Gate> {
    let mut blockers = Vec::new();

    for dep in &wait_for.workspaces {
        let ns = dep.namespace_or(namespace);
        let ws = store.get::<Workspace>(ns, &dep.name).await?;
        if let Some(reason) = assess_workspace(ws.as_ref()) {
            blockers.push(Blocker {
                kind: "Workspace",
                namespace: ns.to_string(),
                name: dep.name.clone(),
                reason,
            });
        }
    }

    for dep in &wait_for.secrets {
        let ns = dep.namespace_or(namespace);
        if store.get::<Secret>(ns, &dep.name).await?.is_none() {
            blockers.push(Blocker {
                kind: "Secret",
                namespace: ns.to_string(),
                name: dep.name.clone(),
                reason: BlockReason::Missing,
            });
        }
    }

    Ok(if blockers.is_empty() {
        Gate::Open
    } else {
        Gate::Blocked(blockers)
    })
}
