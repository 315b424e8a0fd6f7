//! Server specifications handed to the core.
//!
//! These are plain serde types; `composer-config` deserializes them from
//! TOML and validates them before the core sees them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ComposerError, Result};
use crate::transport::TransportKind;

fn default_true() -> bool {
    true
}

/// How to launch (or reach) one tool server, and how to supervise it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Unique name within the composer.
    pub name: String,
    /// `stdio` spawns `command`; `streaming` connects to `url`.
    #[serde(default)]
    pub transport: TransportKind,
    /// Executable (stdio).
    #[serde(default)]
    pub command: String,
    /// Arguments (stdio).
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables (stdio).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory (stdio).
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// SSE feed URL (streaming).
    #[serde(default)]
    pub url: Option<String>,
    /// HTTP headers (streaming).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Version tag used by registry versioning. Falls back to the version
    /// reported in `initialize`.
    #[serde(default)]
    pub version: Option<String>,
    /// Whether `start_all` starts this server.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub readiness: Readiness,
    #[serde(default)]
    pub restart: RestartSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl ServerSpec {
    /// A stdio server spawned from `command`.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            version: None,
            enabled: true,
            readiness: Readiness::default(),
            restart: RestartSettings::default(),
            health: HealthSettings::default(),
            limits: ResourceLimits::default(),
        }
    }

    /// A remote server reached over the streaming transport.
    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Streaming,
            url: Some(url.into()),
            ..Self::new(name, "")
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_restart(mut self, restart: RestartSettings) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_health(mut self, health: HealthSettings) -> Self {
        self.health = health;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Structural checks the core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ComposerError::config("server name must not be empty"));
        }
        match self.transport {
            TransportKind::Stdio if self.command.trim().is_empty() => Err(ComposerError::config(
                format!("server '{}': stdio transport requires a command", self.name),
            )),
            TransportKind::Streaming if self.url.as_deref().is_none_or(|u| u.trim().is_empty()) => {
                Err(ComposerError::config(format!(
                    "server '{}': streaming transport requires a url",
                    self.name
                )))
            }
            _ => {
                if self.health.failure_threshold == 0 {
                    return Err(ComposerError::config(format!(
                        "server '{}': health.failure_threshold must be at least 1",
                        self.name
                    )));
                }
                if self.limits.sustained_samples == 0 {
                    return Err(ComposerError::config(format!(
                        "server '{}': limits.sustained_samples must be at least 1",
                        self.name
                    )));
                }
                Ok(())
            }
        }
    }
}

/// When a freshly launched server counts as running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// After a successful MCP `initialize` handshake.
    #[default]
    Initialize,
    /// As soon as the process is spawned.
    #[serde(rename = "none")]
    Immediate,
}

/// Restart policy after an unexpected exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    #[default]
    OnFailure,
    Always,
}

/// Restart policy plus its bound and back-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    pub policy: RestartPolicy,
    pub max_restarts: u32,
    /// Back-off before the first restart; doubles per attempt.
    pub delay_ms: u64,
    /// Cap on the back-off.
    pub max_delay_ms: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::OnFailure,
            max_restarts: 3,
            delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RestartSettings {
    pub fn new(policy: RestartPolicy, max_restarts: u32) -> Self {
        Self {
            policy,
            max_restarts,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration, max_delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    /// Back-off before restart attempt `attempt` (1-based):
    /// `delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether a crash with `cause` leads to another restart, given how many
    /// restarts have already happened.
    pub fn should_restart(&self, cause: &CrashCause, restarts_so_far: u32) -> bool {
        if restarts_so_far >= self.max_restarts {
            return false;
        }
        match self.policy {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => cause.is_failure(),
            RestartPolicy::Always => true,
        }
    }

    /// Whether the policy bounds the restart counter.
    pub fn is_bounded(&self) -> bool {
        self.policy != RestartPolicy::Never
    }
}

/// Why a server ended up crashed.
#[derive(Debug, Clone, PartialEq)]
pub enum CrashCause {
    /// The process exited on its own.
    Exited(Option<i32>),
    /// Consecutive health probes failed.
    Unhealthy(String),
    /// Resource ceilings were exceeded for too long.
    ResourceLimit(String),
    /// The remote connection went away.
    Disconnected,
    /// Launched, but the handshake failed.
    Handshake(String),
}

impl CrashCause {
    /// A clean exit (code 0) is the only non-failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, CrashCause::Exited(Some(0)))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CrashCause::Exited(code) => *code,
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CrashCause::Exited(Some(code)) => format!("exited with code {}", code),
            CrashCause::Exited(None) => "terminated by signal".to_string(),
            CrashCause::Unhealthy(reason) => format!("unhealthy: {}", reason),
            CrashCause::ResourceLimit(detail) => format!("resource limit: {}", detail),
            CrashCause::Disconnected => "connection lost".to_string(),
            CrashCause::Handshake(reason) => format!("handshake failed: {}", reason),
        }
    }
}

/// What a health probe sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeStrategy {
    /// JSON-RPC `ping`.
    #[default]
    Ping,
    /// Invoke a tool. May have side effects.
    Tool {
        name: String,
        #[serde(default)]
        arguments: Option<Value>,
    },
    /// Any method with any params.
    Custom {
        method: String,
        #[serde(default)]
        params: Option<Value>,
    },
}

impl ProbeStrategy {
    /// Tool invocations may not be idempotent.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, ProbeStrategy::Tool { .. })
    }
}

/// Health probing of a running server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive failures before the server is treated as crashed.
    pub failure_threshold: u32,
    pub probe: ProbeStrategy,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 5_000,
            failure_threshold: 3,
            probe: ProbeStrategy::Ping,
        }
    }
}

impl HealthSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Soft resource ceilings, sampled once per health interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<f32>,
    /// Consecutive violating samples before the server is treated as crashed.
    pub sustained_samples: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: None,
            max_cpu_percent: None,
            sustained_samples: 3,
        }
    }
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.max_memory_mb.is_none() && self.max_cpu_percent.is_none()
    }

    /// Describe the violation in `usage`, if any.
    pub fn check(&self, usage: &ResourceUsage) -> Option<String> {
        let mut violations = Vec::new();
        if let Some(max) = self.max_memory_mb {
            if usage.memory_mb > max {
                violations.push(format!("memory {} MB > {} MB", usage.memory_mb, max));
            }
        }
        if let Some(max) = self.max_cpu_percent {
            if usage.cpu_percent > max {
                violations.push(format!("cpu {:.1}% > {:.1}%", usage.cpu_percent, max));
            }
        }
        if violations.is_empty() {
            None
        } else {
            Some(violations.join(", "))
        }
    }
}

/// One resource sample of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub memory_mb: u64,
    pub cpu_percent: f32,
}
