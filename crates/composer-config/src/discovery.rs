//! Config file discovery.
//!
//! The first existing file wins:
//! 1. an explicit path (`--config`), which must exist
//! 2. `./composer.toml` (project-local)
//! 3. `composer.toml` in the user config dir (`COMPOSER_CONFIG_DIR`, else the
//!    platform default such as `~/.config/mcp-composer/`)
//!
//! With no file at all the defaults apply. Environment overrides are applied
//! last, then the result is validated.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{APP_NAME, ComposerConfig, ConfigError, Result};

/// Config filename, both project-local and in the user config dir.
pub const CONFIG_FILE: &str = "composer.toml";

/// Environment variable to override the user config directory.
const CONFIG_DIR_ENV: &str = "COMPOSER_CONFIG_DIR";

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The validated configuration.
    pub config: ComposerConfig,
    /// File the config was read from, if any.
    pub source: Option<PathBuf>,
    /// Every path that was checked, in order.
    pub searched: Vec<PathBuf>,
    /// Non-fatal problems found during validation.
    pub warnings: Vec<String>,
}

/// Discover, load, override and validate the configuration.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(explicit, None, None)
}

/// Like [`load_config`] with explicit project and user config directories.
pub fn load_config_with_options(
    explicit: Option<&Path>,
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut searched = Vec::new();
    let source = match explicit {
        Some(path) => {
            searched.push(path.to_path_buf());
            if !path.is_file() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Some(path.to_path_buf())
        }
        None => {
            let project = project_dir
                .map(|d| d.join(CONFIG_FILE))
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
            let user = match config_dir {
                Some(dir) => Some(dir.join(CONFIG_FILE)),
                None => user_config_path(),
            };
            searched.push(project);
            searched.extend(user);
            searched.iter().find(|p| p.is_file()).cloned()
        }
    };

    let mut config = match &source {
        Some(path) => {
            debug!(path = %path.display(), "Loading config");
            load_config_file(path)?
        }
        None => {
            debug!(searched = ?searched, "No config file found; using defaults");
            ComposerConfig::new()
        }
    };
    config.apply_env_overrides()?;
    let warnings = config.validate()?;

    Ok(LoadedConfig {
        config,
        source,
        searched,
        warnings,
    })
}

/// Load config from a specific file path (no discovery, no overrides).
pub fn load_config_file(path: &Path) -> Result<ComposerConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    ComposerConfig::from_toml(&contents)
}

/// `composer.toml` in the user config directory.
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(CONFIG_FILE))
}

/// The user config directory: `COMPOSER_CONFIG_DIR`, else the platform default.
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|d| d.join(APP_NAME)),
    }
}
