//! CLI command handlers.

pub mod bridge;
pub mod check;
pub mod expose;
pub mod serve;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use composer_config::ComposerConfig;
use composer_core::{Composer, LifecycleState, TracingObserver, TranslatorId};
use tracing::info;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Loaded and validated configuration.
    pub config: ComposerConfig,
    /// File the configuration came from.
    pub source: Option<PathBuf>,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Build a composer with the configured settings and policy, plus the
    /// configured servers when `with_servers` is set.
    pub fn composer(&self, with_servers: bool) -> Result<Arc<Composer>> {
        let mut builder = Composer::builder()
            .settings(self.config.composer.clone())
            .policy(self.config.registry.clone())
            .observer(Arc::new(TracingObserver));
        if with_servers {
            builder = builder.servers(self.config.servers.clone());
        }
        builder.build().context("failed to build composer")
    }
}

/// Parse repeated `KEY=VALUE` arguments.
pub fn parse_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => bail!("expected KEY=VALUE, got '{}'", pair),
        })
        .collect()
}

/// Run until Ctrl-C or until the translator finishes on its own.
pub async fn wait_for_translator(composer: &Composer, id: TranslatorId) -> Result<LifecycleState> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Interrupted; shutting down");
            Ok(LifecycleState::Stopped)
        }
        outcome = composer.translators().wait_finished(id) => {
            Ok(outcome?)
        }
    }
}
