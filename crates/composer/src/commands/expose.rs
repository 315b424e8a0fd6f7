//! Expose command - serve a stdio MCP server over a streaming endpoint.

use std::net::SocketAddr;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use composer_core::{LifecycleState, StreamToStdioConfig, TranslatorConfig};
use tracing::info;

use super::{Context, parse_pairs, wait_for_translator};

/// Arguments for the expose command.
#[derive(Args, Debug)]
pub struct ExposeArgs {
    /// Address to bind the streaming endpoint to (overrides config)
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Translator name used in logs
    #[arg(long, default_value = "exposed")]
    pub name: String,

    /// Environment variable for the server as KEY=VALUE (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Per-request timeout in milliseconds (overrides config)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Server command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

/// Run the expose command.
pub async fn run(args: ExposeArgs, ctx: &Context) -> Result<()> {
    let Some((command, command_args)) = args.command.split_first() else {
        bail!("no server command given");
    };

    let mut streaming = ctx.config.streaming.clone();
    if let Some(bind) = args.bind {
        streaming.bind = bind;
    }

    let composer = ctx.composer(false)?;
    let config = TranslatorConfig::StreamToStdio(StreamToStdioConfig {
        name: args.name.clone(),
        command: command.clone(),
        args: command_args.to_vec(),
        env: parse_pairs(&args.env)?,
        cwd: None,
        streaming,
        request_timeout_ms: args.timeout_ms,
    });

    let id = composer
        .create_translator(config)
        .await
        .with_context(|| format!("failed to expose '{}'", command))?;
    if let Some(endpoint) = composer.translators().info(id)?.endpoint {
        println!("Serving '{}' at {}", command, endpoint);
    }

    let outcome = wait_for_translator(&composer, id).await;
    composer.shutdown().await;
    match outcome? {
        LifecycleState::Crashed => bail!("'{}' exited unexpectedly", command),
        state => {
            info!(state = %state, "Expose finished");
            Ok(())
        }
    }
}
