//! Label-selector evaluation shared by the stores and the replica
//! controllers, on top of kube's own `Selector`.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};

use crate::error::{Error, Result};

/// Convert an API `LabelSelector` into kube's evaluable form.
pub fn parse(selector: &LabelSelector) -> Result<Selector> {
    Selector::try_from(selector.clone())
        .map_err(|e| Error::validation(format!("invalid label selector: {e}")))
}

/// True when `labels` satisfy `selector`.  An empty selector matches
/// everything; a selector that does not parse matches nothing.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    parse(selector).is_ok_and(|s| s.matches(labels))
}

/// True when the selector carries no requirements.
pub fn is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().map_or(true, |m| m.is_empty())
        && selector
            .match_expressions
            .as_ref()
            .map_or(true, |e| e.is_empty())
}
