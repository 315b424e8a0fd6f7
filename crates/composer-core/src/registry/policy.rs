//! Conflict policy: strategies, per-pattern overrides, versioning and aliases.

use std::fmt;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::{ComposerError, Result};

/// How colliding names are resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// `{server}_{local}` for every colliding entry.
    #[default]
    Prefix,
    /// `{local}_{server}` for every colliding entry.
    Suffix,
    /// First-registered wins; the rest are dropped.
    Ignore,
    /// Refuse the refresh.
    Error,
    /// Most recently registered wins.
    Override,
    /// Caller template with `{server}`, `{local}` and `{version}` placeholders.
    Custom { template: String },
}

impl ConflictStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            ConflictStrategy::Prefix => "prefix",
            ConflictStrategy::Suffix => "suffix",
            ConflictStrategy::Ignore => "ignore",
            ConflictStrategy::Error => "error",
            ConflictStrategy::Override => "override",
            ConflictStrategy::Custom { .. } => "custom",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::Custom { template } => write!(f, "custom({})", template),
            other => f.write_str(other.label()),
        }
    }
}

/// A strategy applied to names matching a shell wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyOverride {
    pub pattern: String,
    pub strategy: ConflictStrategy,
}

/// Version-aware exposure of colliding entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningSettings {
    pub enabled: bool,
    /// Appended to the local name; `{version}` is replaced by the tag.
    pub suffix_format: String,
}

impl Default for VersioningSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            suffix_format: "_v{version}".to_string(),
        }
    }
}

/// A friendly name for an exposed tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub alias: String,
    pub target: String,
}

/// The complete conflict policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryPolicy {
    pub strategy: ConflictStrategy,
    /// Checked in order; the first matching pattern wins.
    pub overrides: Vec<StrategyOverride>,
    pub versioning: VersioningSettings,
    pub aliases: Vec<AliasEntry>,
}

impl RegistryPolicy {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn with_override(mut self, pattern: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.overrides.push(StrategyOverride {
            pattern: pattern.into(),
            strategy,
        });
        self
    }

    pub fn with_versioning(mut self, enabled: bool) -> Self {
        self.versioning.enabled = enabled;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.aliases.push(AliasEntry {
            alias: alias.into(),
            target: target.into(),
        });
        self
    }

    /// Compile patterns and check templates.
    pub(crate) fn compile(&self) -> Result<CompiledPolicy> {
        check_strategy(&self.strategy)?;
        let overrides = self
            .overrides
            .iter()
            .map(|o| {
                check_strategy(&o.strategy)?;
                let pattern = Pattern::new(&o.pattern).map_err(|e| {
                    ComposerError::config(format!("invalid override pattern '{}': {}", o.pattern, e))
                })?;
                Ok((pattern, o.strategy.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        if self.versioning.enabled && !self.versioning.suffix_format.contains("{version}") {
            return Err(ComposerError::config(
                "versioning.suffix_format must contain {version}",
            ));
        }
        Ok(CompiledPolicy {
            strategy: self.strategy.clone(),
            overrides,
            versioning: self.versioning.clone(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.compile().map(|_| ())
    }
}

fn check_strategy(strategy: &ConflictStrategy) -> Result<()> {
    if let ConflictStrategy::Custom { template } = strategy {
        if template.trim().is_empty() {
            return Err(ComposerError::config("custom strategy requires a template"));
        }
        if !["{server}", "{server_name}"].iter().any(|p| template.contains(p)) {
            return Err(ComposerError::config(format!(
                "custom template '{}' must reference {{server}} to keep names distinct",
                template
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledPolicy {
    pub(crate) strategy: ConflictStrategy,
    pub(crate) overrides: Vec<(Pattern, ConflictStrategy)>,
    pub(crate) versioning: VersioningSettings,
}

impl CompiledPolicy {
    /// Strategy for `name`: first matching override, else the global one.
    pub(crate) fn strategy_for(&self, name: &str) -> &ConflictStrategy {
        self.overrides
            .iter()
            .find(|(pattern, _)| pattern.matches(name))
            .map(|(_, strategy)| strategy)
            .unwrap_or(&self.strategy)
    }
}
