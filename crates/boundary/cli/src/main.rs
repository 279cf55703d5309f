//! boundaryctl - operator tool for the boundary kernel
//!
//! - `scenarios`: walk the reference pipeline through the canonical crossings
//! - `digest`: print the idempotency key of a JSON payload
//! - `config`: print the effective kernel configuration

use boundary_kernel::KernelConfig;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "boundaryctl")]
#[command(about = "Boundary kernel operator tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "BOUNDARY_CONFIG", global = true)]
    config: Option<String>,

    /// Log level (overrides the configured level)
    #[arg(long, env = "BOUNDARY_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "BOUNDARY_LOG_JSON", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reference crossing scenarios
    Scenarios {
        /// Run a single scenario (A-E)
        #[arg(long)]
        only: Option<char>,
    },

    /// Print the idempotency key of a JSON payload file
    Digest {
        /// JSON file holding the payload
        file: String,

        /// Operation name (defaults to the file stem)
        #[arg(short, long)]
        operation: Option<String>,
    },

    /// Print the effective configuration as JSON
    Config {
        /// Configuration file to load instead of --config
        #[arg(short, long)]
        file: Option<String>,
    },
}

fn init_logging(config: &KernelConfig, cli: &Cli) {
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Config { file: Some(file) } => Some(file.clone()),
        _ => cli.config.clone(),
    };
    let config = KernelConfig::load(config_path.as_deref())?;
    init_logging(&config, &cli);

    match cli.command {
        Commands::Scenarios { only } => commands::scenarios::execute(&config, only).await,
        Commands::Digest { file, operation } => commands::digest::execute(&file, operation),
        Commands::Config { .. } => commands::config::execute(&config),
    }
}
