//! Errors raised while loading `composer.toml`.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Why a configuration could not be turned into a usable `ComposerConfig`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// An explicitly requested config file does not exist.
    #[error("config file '{}' not found", .0.display())]
    NotFound(PathBuf),

    #[error("malformed TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Two `[[servers]]` entries share a name.
    #[error("duplicate server name '{0}'")]
    DuplicateServer(String),

    /// Two `[[translators]]` entries share a name.
    #[error("duplicate translator name '{0}'")]
    DuplicateTranslator(String),

    /// A section failed validation.
    #[error("invalid {context}: {message}")]
    Invalid { context: String, message: String },

    /// An environment override could not be applied.
    #[error("invalid value '{value}' for {var}: {message}")]
    InvalidOverride {
        var: String,
        value: String,
        message: String,
    },
}

impl ConfigError {
    pub fn invalid(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Invalid {
            context: context.into(),
            message: message.to_string(),
        }
    }
}
