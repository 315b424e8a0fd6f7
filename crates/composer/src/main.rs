//! MCP composer - one logical MCP server over many.
//!
//! Main entry point for the `composer` CLI.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;

mod commands;

use commands::{bridge, check, expose, serve};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// MCP composer - supervise MCP servers and serve them as one
#[derive(Parser, Debug)]
#[command(name = "composer")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Debug-level console logging and extra detail from `check`
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Use this composer.toml instead of searching for one
    #[arg(short, long, global = true, env = "COMPOSER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start every configured server and serve the aggregate
    Serve(serve::ServeArgs),

    /// Validate the configuration and print what it describes
    Check(check::CheckArgs),

    /// Relay this process's stdio to a remote streaming MCP server
    Bridge(bridge::BridgeArgs),

    /// Serve a stdio MCP server over a streaming endpoint
    Expose(expose::ExposeArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = composer_config::load_config(cli.config.as_deref()).context("failed to load configuration")?;
    let _guard = init_tracing(&loaded.config.logging, cli.verbose)?;

    for warning in &loaded.warnings {
        tracing::warn!("{}", warning);
    }

    let ctx = commands::Context {
        config: loaded.config,
        source: loaded.source,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Serve(args) => serve::run(args, &ctx).await,
        Commands::Check(args) => check::run(args, &ctx).await,
        Commands::Bridge(args) => bridge::run(args, &ctx).await,
        Commands::Expose(args) => expose::run(args, &ctx).await,
    }
}

/// Console layer on stderr (stdout may carry JSON-RPC) plus an optional
/// daily-rolling JSON file layer.
fn init_tracing(logging: &composer_config::LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let console_filter = if verbose {
        EnvFilter::new("composer=debug,composer_core=debug,composer_config=debug,info")
    } else {
        EnvFilter::try_new(&logging.level)
            .with_context(|| format!("invalid log level '{}'", logging.level))?
    };
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(console_filter);

    let (file, guard) = match logging.log_dir().filter(|_| logging.json_file) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, "composer.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new(
                    "composer=trace,composer_core=trace,composer_config=trace,info",
                ));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(console).with(file).init();
    Ok(guard)
}
