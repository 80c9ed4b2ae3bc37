//! The `imprimatur verify` subcommand.
//!
//! Applies image verification policies to one or more resources and exits
//! non-zero when any rule fails or errors.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use imprimatur_policy::loader::{load_policies, load_resources};
use imprimatur_verify::report::render_text;
use imprimatur_verify::{Capabilities, EngineConfig, HttpApiCaller, PolicyEngine, SignatureStore};
use serde_json::Value;
use tracing::info;

/// Arguments for `imprimatur verify`.
#[derive(Args)]
pub struct VerifyArgs {
    /// Policy file or directory (JSON or YAML). Repeatable.
    #[arg(long, short, value_name = "PATH", required = true)]
    pub policy: Vec<PathBuf>,

    /// Resource file or directory (JSON or YAML).
    #[arg(long, short, value_name = "PATH")]
    pub resource: PathBuf,

    /// Offline signature store (JSON). Overrides the configured store.
    #[arg(long, value_name = "PATH")]
    pub signatures: Option<PathBuf>,

    /// Output results as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Execute the verify command.
pub async fn execute(args: VerifyArgs, config_path: Option<&Path>) -> Result<()> {
    let config = EngineConfig::resolve(config_path).wrap_err("failed to load configuration")?;

    let mut policies = Vec::new();
    for path in &args.policy {
        let loaded = load_policies(path)
            .wrap_err_with(|| format!("failed to load policies from {}", path.display()))?;
        policies.extend(loaded);
    }
    let resources = load_resources(&args.resource)
        .wrap_err_with(|| format!("failed to load resources from {}", args.resource.display()))?;
    info!(policies = policies.len(), resources = resources.len(), "loaded inputs");

    let store = match args.signatures.as_deref().or(config.signature_store.as_deref()) {
        Some(path) => SignatureStore::from_file(path)
            .wrap_err_with(|| format!("failed to load signature store {}", path.display()))?,
        None => SignatureStore::default(),
    };
    let store = Arc::new(store);
    let capabilities = Capabilities {
        cosign: store.clone(),
        notary: store,
        api: Arc::new(HttpApiCaller::new(config.call_timeout())?),
    };
    let engine = PolicyEngine::new(capabilities, config);

    let mut passed = true;
    let mut reports = Vec::with_capacity(resources.len());
    for resource in &resources {
        let response = engine.apply(&policies, resource).await;
        passed &= response.is_success();
        if args.json {
            reports.push(serde_json::to_value(&response)?);
        } else {
            println!("Resource: {}", describe(resource));
            print!("{}", render_text(&response));
            println!();
        }
    }

    if args.json {
        let output = serde_json::json!({ "passed": passed, "resources": reports });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if passed {
        println!("Verification PASSED");
    } else {
        println!("Verification FAILED");
    }

    if !passed {
        process::exit(1);
    }

    Ok(())
}

/// `Kind/name` of a resource, for report headers.
fn describe(resource: &Value) -> String {
    let kind = resource["kind"].as_str().unwrap_or("Resource");
    let name = resource["metadata"]["name"].as_str().unwrap_or("<unnamed>");
    format!("{kind}/{name}")
}

