//! Bridge command - relay this process's stdio to a remote streaming server.
//!
//! Lets a stdio-only MCP client (an editor, a desktop app) talk to a server
//! that is only reachable over SSE.

use anyhow::{Context as _, Result};
use clap::Args;
use composer_core::{StdioToStreamConfig, TranslatorConfig};
use tracing::info;

use super::{Context, parse_pairs, wait_for_translator};

/// Arguments for the bridge command.
#[derive(Args, Debug)]
pub struct BridgeArgs {
    /// SSE feed URL of the remote server
    #[arg(long)]
    pub url: String,

    /// Extra HTTP header as KEY=VALUE (repeatable)
    #[arg(long = "header", value_name = "KEY=VALUE")]
    pub headers: Vec<String>,

    /// Per-request timeout in milliseconds (overrides config)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Translator name used in logs
    #[arg(long, default_value = "bridge")]
    pub name: String,
}

/// Run the bridge command.
pub async fn run(args: BridgeArgs, ctx: &Context) -> Result<()> {
    let composer = ctx.composer(false)?;
    let config = TranslatorConfig::StdioToStream(StdioToStreamConfig {
        name: args.name,
        url: args.url.clone(),
        headers: parse_pairs(&args.headers)?,
        request_timeout_ms: args.timeout_ms,
        connect_timeout_ms: None,
    });

    let id = composer
        .create_translator(config)
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    info!(url = %args.url, "Bridging stdio to remote server");

    let outcome = wait_for_translator(&composer, id).await;
    composer.shutdown().await;
    let state = outcome?;
    info!(state = %state, "Bridge finished");
    Ok(())
}
