//! imprimatur CLI: verify container images against signing policies.
//!
//! Loads image verification policies, extracts image references from
//! resources and checks their signatures, attestations and external
//! approvals.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Result;

/// imprimatur: verify container images against signing policies.
#[derive(Parser)]
#[command(name = "imprimatur", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (repeat for more detail: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output logs as JSON (for machine consumption).
    #[arg(long, global = true)]
    json_logs: bool,

    /// Engine configuration file (TOML).
    #[arg(long, value_name = "PATH", env = "IMPRIMATUR_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Apply policies to resources and verify every image they reference.
    Verify(commands::verify::VerifyArgs),
    /// Load and validate policies without verifying anything.
    Validate(commands::validate::ValidateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbosity
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Verify(args) => commands::verify::execute(args, cli.config.as_deref()).await,
        Commands::Validate(args) => commands::validate::execute(&args),
    }
}
