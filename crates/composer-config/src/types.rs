//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [composer]               # name, version, timeouts
//! [logging]                # level, JSON file output
//! [streaming]              # where `composer serve` listens
//! [[servers]]              # one entry per managed server
//! [registry]               # conflict strategy, overrides, versioning
//! [[registry.overrides]]
//! [[registry.aliases]]
//! [[translators]]          # translators created at startup
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use composer_core::{CoreSettings, RegistryPolicy, ServerSpec, StreamingConfig, TranslatorConfig};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Overrides `[streaming].bind`.
pub const BIND_ENV: &str = "COMPOSER_BIND";

/// Overrides `[logging].level`.
pub const LOG_ENV: &str = "COMPOSER_LOG";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    /// Core settings (`[composer]`).
    pub composer: CoreSettings,
    pub logging: LoggingConfig,
    /// Endpoint for serving the aggregate.
    pub streaming: StreamingConfig,
    pub servers: Vec<ServerSpec>,
    pub registry: RegistryPolicy,
    pub translators: Vec<TranslatorConfig>,
}

impl ComposerConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Look up a server entry by name.
    pub fn server(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Apply `COMPOSER_BIND` and `COMPOSER_LOG` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides read through `lookup`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(bind) = lookup(BIND_ENV).filter(|v| !v.trim().is_empty()) {
            self.streaming.bind = bind
                .trim()
                .parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidOverride {
                    var: BIND_ENV.to_string(),
                    value: bind.clone(),
                    message: e.to_string(),
                })?;
        }
        if let Some(level) = lookup(LOG_ENV).filter(|v| !v.trim().is_empty()) {
            self.logging.level = level.trim().to_string();
        }
        Ok(())
    }

    /// Check the whole config. Returns non-fatal warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        let mut names = HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::DuplicateServer(server.name.clone()));
            }
            server
                .validate()
                .map_err(|e| ConfigError::invalid(format!("server '{}'", server.name), e))?;
            if server.health.enabled && !server.health.probe.is_idempotent() {
                warnings.push(format!(
                    "server '{}': health probe invokes a tool and may have side effects",
                    server.name
                ));
            }
        }

        self.registry
            .validate()
            .map_err(|e| ConfigError::invalid("[registry]", e))?;

        for path in [&self.streaming.sse_path, &self.streaming.message_path] {
            if !path.starts_with('/') {
                return Err(ConfigError::invalid(
                    "[streaming]",
                    format!("path '{}' must start with '/'", path),
                ));
            }
        }
        if self.streaming.sse_path == self.streaming.message_path {
            return Err(ConfigError::invalid(
                "[streaming]",
                "sse_path and message_path must differ",
            ));
        }

        let mut translator_names = HashSet::new();
        for translator in &self.translators {
            if !translator_names.insert(translator.name()) {
                return Err(ConfigError::DuplicateTranslator(translator.name().to_string()));
            }
            translator
                .validate()
                .map_err(|e| ConfigError::invalid(format!("translator '{}'", translator.name()), e))?;
        }

        if self.servers.iter().all(|s| !s.enabled) && !self.servers.is_empty() {
            warnings.push("every server is disabled".to_string());
        }

        Ok(warnings)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive for the console layer.
    pub level: String,
    /// Also write daily-rolling JSON logs.
    pub json_file: bool,
    /// Directory for JSON log files. Defaults to the platform data dir.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: true,
            directory: None,
        }
    }
}

impl LoggingConfig {
    /// Where JSON log files go.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.directory
            .clone()
            .or_else(|| dirs::data_local_dir().map(|d| d.join(crate::APP_NAME).join("logs")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use composer_core::{ConflictStrategy, ProbeStrategy, RestartPolicy, TransportKind};

    const FULL: &str = r#"
[composer]
name = "workbench"
request_timeout_ms = 10000

[logging]
level = "debug"
json_file = false

[streaming]
bind = "0.0.0.0:9000"

[[servers]]
name = "files"
command = "mcp-server-files"
args = ["/srv"]

[servers.restart]
policy = "always"
max_restarts = 5

[servers.health]
interval_ms = 1000
probe = { kind = "tool", name = "list_dir" }

[[servers]]
name = "search"
transport = "streaming"
url = "http://127.0.0.1:7000/sse"
enabled = false

[registry]
strategy = "suffix"

[[registry.overrides]]
pattern = "git_*"
strategy = "error"

[[registry.aliases]]
alias = "ls"
target = "list_dir"

[[translators]]
kind = "stream-to-stdio"
name = "weather"
command = "mcp-weather"
"#;

    #[test]
    fn test_empty_config() {
        let config = ComposerConfig::from_toml("").unwrap();
        assert_eq!(config, ComposerConfig::new());
        assert!(config.servers.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = ComposerConfig::from_toml(FULL).unwrap();
        assert_eq!(config.composer.name, "workbench");
        assert_eq!(config.composer.request_timeout_ms, 10_000);
        assert_eq!(config.composer.stop_grace_ms, CoreSettings::default().stop_grace_ms);
        assert_eq!(config.streaming.bind.port(), 9000);
        assert_eq!(config.streaming.sse_path, "/sse");

        let files = config.server("files").unwrap();
        assert_eq!(files.transport, TransportKind::Stdio);
        assert_eq!(files.restart.policy, RestartPolicy::Always);
        assert_eq!(files.restart.max_restarts, 5);
        assert!(matches!(files.health.probe, ProbeStrategy::Tool { .. }));

        let search = config.server("search").unwrap();
        assert_eq!(search.transport, TransportKind::Streaming);
        assert!(!search.enabled);

        assert_eq!(config.registry.strategy, ConflictStrategy::Suffix);
        assert_eq!(config.registry.overrides.len(), 1);
        assert_eq!(config.registry.aliases[0].target, "list_dir");
        assert_eq!(config.translators[0].name(), "weather");

        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("side effects"));
    }

    #[test]
    fn test_duplicate_server_names() {
        let config = ComposerConfig::from_toml(
            r#"
[[servers]]
name = "a"
command = "one"

[[servers]]
name = "a"
command = "two"
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateServer(name)) if name == "a"));
    }

    #[test]
    fn test_missing_command_rejected() {
        let config = ComposerConfig::from_toml("[[servers]]\nname = \"a\"\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_custom_strategy_needs_template() {
        let config = ComposerConfig::from_toml(
            r#"
[registry]
strategy = { custom = { template = "" } }
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_override_pattern() {
        let config = ComposerConfig::from_toml(
            r#"
[[registry.overrides]]
pattern = "[unclosed"
strategy = "ignore"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_strategy_is_a_parse_error() {
        let err = ComposerConfig::from_toml("[registry]\nstrategy = \"merge\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ComposerConfig::new();
        config
            .apply_overrides(|var| match var {
                BIND_ENV => Some("127.0.0.1:4444".to_string()),
                LOG_ENV => Some("trace".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.streaming.bind.port(), 4444);
        assert_eq!(config.logging.level, "trace");

        let err = config
            .apply_overrides(|var| (var == BIND_ENV).then(|| "not-an-address".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn test_streaming_paths_validated() {
        let config = ComposerConfig::from_toml("[streaming]\nsse_path = \"sse\"\n").unwrap();
        assert!(config.validate().is_err());

        let config =
            ComposerConfig::from_toml("[streaming]\nsse_path = \"/x\"\nmessage_path = \"/x\"\n").unwrap();
        assert!(config.validate().is_err());
    }
}
