//! Configuration for the MCP composer.
//!
//! Provides TOML-based configuration with:
//! - Core settings, logging and the aggregate's streaming endpoint
//! - `[[servers]]` entries deserializing straight into core server specs
//! - The registry conflict policy (strategy, overrides, versioning, aliases)
//! - Translators created at startup
//! - Discovery (`--config`, `./composer.toml`, user config dir) and
//!   environment overrides (`COMPOSER_BIND`, `COMPOSER_LOG`)

pub mod discovery;
pub mod error;
pub mod types;

/// Application name for config and data directory resolution.
pub const APP_NAME: &str = "mcp-composer";

pub use discovery::{
    CONFIG_FILE, LoadedConfig, load_config, load_config_file, load_config_with_options,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::{BIND_ENV, ComposerConfig, LOG_ENV, LoggingConfig};
