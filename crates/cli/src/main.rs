//! Keyward CLI
//!
//! Acquire and force-release named locks against the configured backend.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use keyward_cli::{KeywardConfig, create_lock_manager};

/// Keyward CLI: acquire and release named locks.
#[derive(Parser, Debug)]
#[command(name = "keyward", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        env = "KEYWARD_CONFIG",
        default_value = "keyward.toml",
        global = true
    )]
    config: PathBuf,

    /// Output format.
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Try once to acquire a lock.
    Acquire(commands::acquire::AcquireArgs),
    /// Force-release a lock regardless of its issuer.
    Release(commands::release::ReleaseArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = KeywardConfig::load(&cli.config)?;
    let locks = create_lock_manager(&config.lock)?;

    match cli.command {
        Command::Acquire(args) => commands::acquire::run(&locks, &args, &cli.format).await,
        Command::Release(args) => commands::release::run(&locks, &args, &cli.format).await,
    }
}
