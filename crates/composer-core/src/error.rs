//! Error types for composer operations.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::LifecycleState;
use crate::protocol::JsonRpcError;

/// Result type for composer operations.
pub type Result<T> = std::result::Result<T, ComposerError>;

/// Error type for composer operations.
#[derive(Debug, Error)]
pub enum ComposerError {
    /// The server process could not be launched or did not become ready.
    #[error("failed to start server '{name}': {reason}")]
    ProcessStart { name: String, reason: String },

    /// The server process exited without being asked to.
    #[error("server '{name}' exited unexpectedly (exit code {exit_code:?})")]
    ProcessCrash { name: String, exit_code: Option<i32> },

    /// Consecutive health probes failed.
    #[error("health check failed for server '{name}': {reason}")]
    HealthCheckFailure { name: String, reason: String },

    /// A soft resource ceiling was exceeded for too long.
    #[error("server '{name}' exceeded its resource limits: {detail}")]
    ResourceLimitExceeded { name: String, detail: String },

    /// A name collision the configured strategy refuses to resolve.
    #[error("conflict on '{name}' between {servers:?} (strategy: {strategy})")]
    ToolConflict {
        name: String,
        servers: Vec<String>,
        strategy: String,
    },

    /// The tool exists but its origin server is not running.
    #[error("tool '{tool}' is unavailable: server '{server}' is {state}")]
    ToolUnavailable {
        tool: String,
        server: String,
        state: LifecycleState,
    },

    /// No tool (or alias) with this name.
    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    /// Malformed message or timed-out correlation.
    #[error(transparent)]
    Translation(#[from] TranslationError),

    /// No server registered under this name.
    #[error("server '{0}' not found")]
    ServerNotFound(String),

    /// A server with this name is already registered.
    #[error("server '{0}' already exists")]
    ServerExists(String),

    /// No translator with this id.
    #[error("translator '{0}' not found")]
    TranslatorNotFound(String),

    /// A translator with this name already exists.
    #[error("translator '{0}' already exists")]
    TranslatorExists(String),

    /// The operation is not valid in the current lifecycle state.
    #[error("cannot {operation} '{name}' while it is {state}")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: LifecycleState,
    },

    /// A restart would push the counter past its bound.
    #[error("server '{name}' reached its restart limit of {max_restarts}")]
    RestartLimitExceeded { name: String, max_restarts: u32 },

    /// The origin server answered with a JSON-RPC error.
    #[error("server returned error: {0}")]
    Downstream(JsonRpcError),

    /// An operation did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// The operation was abandoned because its owner shut down.
    #[error("operation cancelled")]
    Cancelled,

    /// Failed to communicate over a transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid configuration handed to the core.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Translation failures: bad framing or a request that never got its answer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TranslationError {
    #[error("malformed message from '{origin}': {detail}")]
    Malformed { origin: String, detail: String },

    #[error("no response to request {id} within {after:?}")]
    Timeout { id: String, after: Duration },

    #[error("request id {0} is already in flight")]
    DuplicateId(String),

    #[error("unknown streaming session {0}")]
    UnknownSession(String),
}

impl ComposerError {
    /// Create a process start error.
    pub fn process_start(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::ProcessStart {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a malformed-message translation error.
    pub fn malformed(origin: impl Into<String>, detail: impl ToString) -> Self {
        Self::Translation(TranslationError::Malformed {
            origin: origin.into(),
            detail: detail.to_string(),
        })
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// JSON-RPC error object for answering a remote caller.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            ComposerError::Downstream(error) => error.clone(),
            ComposerError::ToolNotFound(_) => {
                JsonRpcError::new(JsonRpcError::INVALID_PARAMS, self.to_string())
            }
            ComposerError::ToolUnavailable { .. } => {
                JsonRpcError::new(JsonRpcError::SERVER_UNAVAILABLE, self.to_string())
            }
            ComposerError::Translation(TranslationError::Timeout { .. })
            | ComposerError::Timeout { .. } => {
                JsonRpcError::new(JsonRpcError::REQUEST_TIMEOUT, self.to_string())
            }
            ComposerError::Translation(TranslationError::DuplicateId(_)) => {
                JsonRpcError::new(JsonRpcError::INVALID_REQUEST, self.to_string())
            }
            ComposerError::Cancelled => {
                JsonRpcError::new(JsonRpcError::REQUEST_CANCELLED, self.to_string())
            }
            _ => JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, self.to_string()),
        }
    }
}

/// Why an invocation through the composer failed.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// Neither an exposed name nor an alias matched.
    #[error("tool '{0}' not found")]
    NotFound(String),

    /// The origin server is known but not running.
    #[error("tool '{tool}' is unavailable: server '{server}' is {state}")]
    Unavailable {
        tool: String,
        server: String,
        state: LifecycleState,
    },

    /// The origin server answered with an error; kept unmodified.
    #[error("tool failed downstream: {0}")]
    Downstream(JsonRpcError),

    /// The call never produced an answer (timeout, closed connection).
    #[error("invocation failed: {0}")]
    Failed(#[source] ComposerError),
}

impl InvokeError {
    /// JSON-RPC error object for answering a remote caller.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            InvokeError::NotFound(_) => {
                JsonRpcError::new(JsonRpcError::INVALID_PARAMS, self.to_string())
            }
            InvokeError::Unavailable { .. } => {
                JsonRpcError::new(JsonRpcError::SERVER_UNAVAILABLE, self.to_string())
            }
            InvokeError::Downstream(error) => error.clone(),
            InvokeError::Failed(error) => error.to_rpc_error(),
        }
    }
}

impl From<ComposerError> for InvokeError {
    fn from(error: ComposerError) -> Self {
        match error {
            ComposerError::ToolNotFound(name) => InvokeError::NotFound(name),
            ComposerError::ToolUnavailable {
                tool,
                server,
                state,
            } => InvokeError::Unavailable {
                tool,
                server,
                state,
            },
            ComposerError::Downstream(error) => InvokeError::Downstream(error),
            other => InvokeError::Failed(other),
        }
    }
}
