//! Serve command - supervise every configured server and serve the aggregate.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use composer_core::{EventSink, StdioTransport, StreamingTransport, TranslatorConfig, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Context;

/// Arguments for the serve command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Serve the aggregate on this process's stdin/stdout instead of SSE
    #[arg(long)]
    pub stdio: bool,

    /// Address to bind the streaming endpoint to (overrides config)
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,
}

/// Run the serve command.
pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.config;
    if args.stdio
        && config
            .translators
            .iter()
            .any(|t| matches!(t, TranslatorConfig::StdioToStream(_)))
    {
        bail!("--stdio cannot be combined with a stdio-to-stream translator");
    }

    let composer = ctx.composer(true)?;

    // ── Servers ─────────────────────────────────────────────────────────

    match composer.start_all().await {
        Ok(failures) => {
            for (server, error) in failures {
                warn!(server = %server, error = %error, "Server did not start");
            }
        }
        Err(e) => warn!(error = %e, "Namespace refused; serving what was merged before"),
    }
    info!(
        servers = composer.list_servers().len(),
        tools = composer.list_tools().len(),
        "Servers started"
    );

    // ── Translators ─────────────────────────────────────────────────────

    for translator in &config.translators {
        let name = translator.name().to_string();
        match composer.create_translator(translator.clone()).await {
            Ok(id) => info!(translator = %name, id = %id, "Translator started"),
            Err(e) => warn!(translator = %name, error = %e, "Translator failed to start"),
        }
    }

    // ── Aggregate endpoint ──────────────────────────────────────────────

    let transport: Arc<dyn Transport> = if args.stdio {
        Arc::new(StdioTransport::from_host_stdio("aggregate", EventSink::detached()))
    } else {
        let mut streaming = config.streaming.clone();
        if let Some(bind) = args.bind {
            streaming.bind = bind;
        }
        Arc::new(StreamingTransport::new("aggregate", streaming, EventSink::detached()))
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted; shutting down");
                cancel.cancel();
            }
        }
    });

    let outcome = composer.serve(transport, cancel).await;
    composer.shutdown().await;
    outcome.context("serving the aggregate failed")
}
