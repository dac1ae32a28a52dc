//! slicepull entry point.
//!
//! Usage: `slicepull <file> [--config <path>] [--output <dir>]`
//!
//! `--config` falls back to `SLICEPULL_CONFIG`, then the platform
//! config directory.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser, PartialEq)]
#[command(name = "slicepull", version, about = "Ingest a file through the slicepull pull protocol")]
struct Args {
    /// File to ingest.
    file: PathBuf,

    /// Configuration file (TOML). Written with defaults if missing.
    #[arg(long, env = "SLICEPULL_CONFIG")]
    config: Option<PathBuf>,

    /// Output directory, overriding `output_dir` from the configuration.
    #[arg(long)]
    output: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting slicepull");

    let config_path = config::config_path(args.config.as_deref());
    let mut config = config::Config::load(&config_path)?;
    if let Some(output) = args.output {
        config.output_dir = output;
    }
    tracing::info!(
        path = %config_path.display(),
        output = %config.output_dir,
        chunk_size = config.chunk_size,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(app::run(config, &args.file))?;

    if !outcome.success {
        anyhow::bail!(
            "server rejected {} (session {})",
            args.file.display(),
            outcome.session_id
        );
    }
    tracing::info!(
        session = %outcome.session_id,
        bytes = outcome.bytes_sent,
        "ingest complete"
    );
    Ok(())
}
