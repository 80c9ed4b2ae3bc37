//! Loading policies and resources from disk.
//!
//! Files may be JSON or YAML; a YAML file may hold several `---` separated
//! documents. Directories are walked recursively in name order and only
//! `.json`, `.yaml` and `.yml` files are read.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::PolicyError;
use crate::policy::{ImageVerificationPolicy, POLICY_KIND};

const EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Load every policy under `path`.
///
/// Only the document shape and kind are checked here; rule configuration
/// is validated per rule when the rule is evaluated, or explicitly with
/// [`ImageVerificationPolicy::validate`].
pub fn load_policies(path: &Path) -> Result<Vec<ImageVerificationPolicy>, PolicyError> {
    let mut policies = Vec::new();
    for file in collect_files(path)? {
        for document in read_documents(&file)? {
            let policy = parse_policy(document, &file)?;
            debug!(
                path = %file.display(),
                policy = policy.name(),
                rules = policy.spec.rules.len(),
                "loaded policy"
            );
            policies.push(policy);
        }
    }
    Ok(policies)
}

/// Load every document under `path` as an untyped resource.
pub fn load_resources(path: &Path) -> Result<Vec<Value>, PolicyError> {
    let mut resources = Vec::new();
    for file in collect_files(path)? {
        resources.extend(read_documents(&file)?);
    }
    Ok(resources)
}

/// Parse policies from in-memory YAML or JSON text.
pub fn parse_policies(text: &str) -> Result<Vec<ImageVerificationPolicy>, PolicyError> {
    split_documents(text)?
        .into_iter()
        .map(|doc| parse_policy(doc, Path::new("<inline>")))
        .collect()
}

fn parse_policy(document: Value, source: &Path) -> Result<ImageVerificationPolicy, PolicyError> {
    let kind = document
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if kind != POLICY_KIND {
        return Err(PolicyError::UnsupportedKind {
            kind: kind.to_owned(),
            path: source.display().to_string(),
        });
    }
    Ok(serde_json::from_value(document)?)
}

fn read_documents(file: &Path) -> Result<Vec<Value>, PolicyError> {
    let text = std::fs::read_to_string(file)?;
    if file.extension().is_some_and(|e| e == "json") {
        return Ok(vec![serde_json::from_str(&text)?]);
    }
    split_documents(&text)
}

/// YAML is a superset of JSON, so this also accepts a single JSON document.
fn split_documents(text: &str) -> Result<Vec<Value>, PolicyError> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(document)?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

fn collect_files(path: &Path) -> Result<Vec<PathBuf>, PolicyError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    let mut entries = std::fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    for entry in entries {
        if entry.is_dir() {
            files.extend(collect_files(&entry)?);
        } else if entry
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| EXTENSIONS.contains(&e))
        {
            files.push(entry);
        }
    }
    Ok(files)
}
