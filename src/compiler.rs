//! Module compiler: turns a `ModuleTemplateSpec` into Terraform JSON.
//!
//! The output is a pure function of the template.  `serde_json::Map` keeps
//! keys sorted, so the same template always yields byte-identical text and
//! the submission hash is stable.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};

use crate::crd::shared::NamespacedRef;
use crate::crd::template::ModuleTemplateSpec;
use crate::error::{Error, Result};
use crate::helpers::sha256_hex;

const MODULE_NAME: &str = "main";

fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate(spec: &ModuleTemplateSpec) -> Result<()> {
    if spec.source.trim().is_empty() {
        return Err(Error::compile("template source must not be empty"));
    }
    let mut seen = BTreeSet::new();
    for var in &spec.variables {
        if !valid_identifier(&var.name) {
            return Err(Error::compile(format!("invalid variable name {:?}", var.name)));
        }
        if !seen.insert(var.name.as_str()) {
            return Err(Error::compile(format!("variable {:?} declared twice", var.name)));
        }
        if spec.inputs.contains_key(&var.name) {
            return Err(Error::compile(format!(
                "{:?} is declared both as a variable and a static input",
                var.name
            )));
        }
    }
    let mut outputs = BTreeSet::new();
    for out in &spec.outputs {
        if !valid_identifier(out) {
            return Err(Error::compile(format!("invalid output name {out:?}")));
        }
        if !outputs.insert(out.as_str()) {
            return Err(Error::compile(format!("output {out:?} declared twice")));
        }
    }
    for (name, provider) in &spec.providers {
        if !valid_identifier(name) || provider.source.trim().is_empty() {
            return Err(Error::compile(format!("provider {name:?} needs a name and a source")));
        }
    }
    Ok(())
}

/// Render the module text for `spec`.
pub fn compile(spec: &ModuleTemplateSpec) -> Result<String> {
    validate(spec)?;
    let mut root = Map::new();

    if !spec.providers.is_empty() {
        let mut required = Map::new();
        let mut configs = Map::new();
        for (name, provider) in &spec.providers {
            let mut req = Map::new();
            req.insert("source".into(), json!(provider.source));
            if let Some(v) = &provider.version {
                req.insert("version".into(), json!(v));
            }
            required.insert(name.clone(), Value::Object(req));
            configs.insert(name.clone(), json!(provider.config));
        }
        root.insert("terraform".into(), json!({ "required_providers": required }));
        root.insert("provider".into(), Value::Object(configs));
    }

    if !spec.variables.is_empty() {
        let mut vars = Map::new();
        for var in &spec.variables {
            let mut decl = Map::new();
            decl.insert("type".into(), json!("string"));
            if let Some(d) = &var.description {
                decl.insert("description".into(), json!(d));
            }
            if let Some(d) = &var.default {
                decl.insert("default".into(), json!(d));
            }
            if var.sensitive {
                decl.insert("sensitive".into(), json!(true));
            }
            vars.insert(var.name.clone(), Value::Object(decl));
        }
        root.insert("variable".into(), Value::Object(vars));
    }

    let mut module = Map::new();
    module.insert("source".into(), json!(spec.source));
    if let Some(v) = &spec.version {
        module.insert("version".into(), json!(v));
    }
    for (k, v) in &spec.inputs {
        module.insert(k.clone(), json!(v));
    }
    for var in &spec.variables {
        module.insert(var.name.clone(), json!(format!("${{var.{}}}", var.name)));
    }
    root.insert("module".into(), json!({ MODULE_NAME: module }));

    if !spec.outputs.is_empty() {
        let mut outputs = Map::new();
        for out in &spec.outputs {
            outputs.insert(
                out.clone(),
                json!({ "value": format!("${{module.{MODULE_NAME}.{out}}}") }),
            );
        }
        root.insert("output".into(), Value::Object(outputs));
    }

    Ok(serde_json::to_string_pretty(&Value::Object(root))?)
}

/// Declared variables with no default that `variables` does not supply.
pub fn missing_variables(spec: &ModuleTemplateSpec, variables: &BTreeMap<String, String>) -> Vec<String> {
    spec.variables
        .iter()
        .filter(|v| v.default.is_none() && !variables.contains_key(&v.name))
        .map(|v| v.name.clone())
        .collect()
}

/// Hash identifying one submission: module text, the variable map and
/// where the outputs are written.
pub fn submission_hash(
    module: &str,
    variables: &BTreeMap<String, String>,
    output_binding: Option<&NamespacedRef>,
) -> String {
    let vars = serde_json::to_string(variables).unwrap_or_default();
    let binding = serde_json::to_string(&output_binding).unwrap_or_default();
    sha256_hex(&format!("{module}\n{vars}\n{binding}"))
}
