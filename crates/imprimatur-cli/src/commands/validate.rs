//! The `imprimatur validate` subcommand.

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use imprimatur_policy::loader::load_policies;

/// Arguments for `imprimatur validate`.
#[derive(Args)]
pub struct ValidateArgs {
    /// Policy file or directory (JSON or YAML). Repeatable.
    #[arg(long, short, value_name = "PATH", required = true)]
    pub policy: Vec<PathBuf>,
}

/// Execute the validate command.
pub fn execute(args: &ValidateArgs) -> Result<()> {
    for path in &args.policy {
        let policies = load_policies(path)
            .wrap_err_with(|| format!("invalid policy {}", path.display()))?;
        for policy in &policies {
            policy.validate().wrap_err_with(|| {
                format!("invalid policy {} in {}", policy.name(), path.display())
            })?;
            println!(
                "[OK] {} ({} rules) in {}",
                policy.name(),
                policy.spec.rules.len(),
                path.display()
            );
        }
    }
    Ok(())
}
