//! Composition engine for MCP (Model Context Protocol) tool servers.
//!
//! The composer runs a set of independently developed tool servers as one
//! logical server: it supervises their processes, merges what they advertise
//! into a single conflict-free namespace, and bridges stdio servers and
//! streaming (SSE + HTTP POST) clients in either direction.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Composer                                                   │
//! │  - invoke / get_prompt / read_resource routing              │
//! │  - serve(): the aggregate as an MCP server                  │
//! └─────────────────────────────────────────────────────────────┘
//!        │                     │                      │
//!        ▼                     ▼                      ▼
//! ┌──────────────┐   ┌───────────────────┐   ┌─────────────────┐
//! │  Supervisor  │   │  Registry         │   │  Translators    │
//! │  - lifecycle │──▶│  - conflict       │   │  - stdio ⇄ SSE  │
//! │  - restarts  │   │    strategies     │   │  - id rewriting │
//! │  - health    │   │  - aliases        │   │  - timeouts     │
//! └──────────────┘   └───────────────────┘   └─────────────────┘
//!        │                                            │
//!        ▼                                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  RpcClient / Transport                                      │
//! │  - JSON-RPC 2.0, newline-delimited over stdio               │
//! │  - SSE endpoint (axum) and SSE client (reqwest)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use composer_core::{Composer, ConflictStrategy, RegistryPolicy, ServerSpec};
//!
//! let composer = Composer::builder()
//!     .policy(RegistryPolicy::new(ConflictStrategy::Prefix))
//!     .server(ServerSpec::new("files", "mcp-server-files").with_arg("/srv"))
//!     .server(ServerSpec::new("git", "mcp-server-git"))
//!     .build()?;
//!
//! composer.start_all().await?;
//! for tool in composer.list_tools() {
//!     println!("{} <- {}", tool.exposed_name, tool.origin_server);
//! }
//! let result = composer.invoke("files_read", Some(json!({"path": "README.md"}))).await?;
//! ```

pub mod client;
pub mod composer;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod observer;
pub mod pending;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod supervisor;
pub mod translator;
pub mod transport;

pub use client::RpcClient;
pub use composer::{Composer, ComposerBuilder};
pub use config::{
    CrashCause, HealthSettings, ProbeStrategy, Readiness, ResourceLimits, ResourceUsage,
    RestartPolicy, RestartSettings, ServerSpec,
};
pub use context::{CoreContext, CoreSettings};
pub use error::{ComposerError, InvokeError, Result, TranslationError};
pub use lifecycle::LifecycleState;
pub use observer::{
    ComposerEvent, EventSink, InvocationOutcome, MemoryObserver, Observer, Subject, TracingObserver,
};
pub use process::ServerStatus;
pub use registry::{
    AliasEntry, CapabilityDescriptor, CapabilityKind, ConflictRecord, ConflictStrategy,
    RefreshSummary, Registry, RegistryPolicy, Route, RouteLookup, StrategyOverride,
    ToolDescriptor, VersioningSettings,
};
pub use supervisor::{Supervisor, SupervisorChange};
pub use translator::{
    Direction, StdioToStreamConfig, StreamToStdioConfig, TranslatorConfig, TranslatorId,
    TranslatorInfo, TranslatorManager,
};
pub use transport::{
    Envelope, RemoteTransport, SessionId, StdioTransport, StreamingConfig, StreamingTransport,
    Transport, TransportKind,
};
