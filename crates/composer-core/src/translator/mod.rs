//! Protocol translators bridging stdio and streaming transports.
//!
//! Each translator is one bridging task with its own pending-response
//! table. The [`TranslatorManager`] owns every translator, keyed by
//! [`TranslatorId`]; callers only ever hold the id.

mod stdio_to_stream;
mod stream_to_stdio;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::CoreContext;
use crate::error::{ComposerError, Result};
use crate::lifecycle::LifecycleState;
use crate::observer::{ComposerEvent, EventSink, Subject};
use crate::pending::PendingTable;
use crate::transport::{StdioTransport, StreamingConfig};

use stdio_to_stream::StdioToStream;
use stream_to_stdio::StreamToStdio;

/// Stable identifier of one translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TranslatorId(Uuid);

impl TranslatorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TranslatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TranslatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TranslatorId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TranslatorId)
    }
}

/// Which side originates the traffic a translator carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// A stdio server surfaced over a streaming endpoint.
    StdioOrigin,
    /// A stdio caller driving a remote streaming server.
    StreamOrigin,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::StdioOrigin => f.write_str("stdio-origin"),
            Direction::StreamOrigin => f.write_str("stream-origin"),
        }
    }
}

/// Spawn a stdio server and serve it over a streaming endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamToStdioConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Falls back to the core request timeout.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

/// Relay a stdio caller to a remote streaming server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioToStreamConfig {
    pub name: String,
    /// SSE feed URL of the remote server.
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

/// What a translator bridges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TranslatorConfig {
    StreamToStdio(StreamToStdioConfig),
    StdioToStream(StdioToStreamConfig),
}

impl TranslatorConfig {
    pub fn name(&self) -> &str {
        match self {
            TranslatorConfig::StreamToStdio(c) => &c.name,
            TranslatorConfig::StdioToStream(c) => &c.name,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            TranslatorConfig::StreamToStdio(_) => Direction::StdioOrigin,
            TranslatorConfig::StdioToStream(_) => Direction::StreamOrigin,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name().trim().is_empty() {
            return Err(ComposerError::config("translator name must not be empty"));
        }
        match self {
            TranslatorConfig::StreamToStdio(c) if c.command.trim().is_empty() => Err(ComposerError::config(format!(
                "translator '{}' needs a command",
                c.name
            ))),
            TranslatorConfig::StdioToStream(c) => url::Url::parse(&c.url)
                .map(|_| ())
                .map_err(|e| ComposerError::config(format!("translator '{}' has invalid url: {}", c.name, e))),
            _ => Ok(()),
        }
    }
}

/// Point-in-time view of a translator.
#[derive(Debug, Clone, Serialize)]
pub struct TranslatorInfo {
    pub id: TranslatorId,
    pub name: String,
    pub direction: Direction,
    pub state: LifecycleState,
    /// Requests awaiting a response.
    pub pending: usize,
    /// Streaming URL (stdio-origin) or remote URL (stream-origin).
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// State shared between a translator's bridging task and the manager.
pub(crate) struct TranslatorShared {
    pub(crate) id: TranslatorId,
    pub(crate) name: String,
    pub(crate) direction: Direction,
    pub(crate) pending: Arc<PendingTable>,
    pub(crate) events: EventSink,
    pub(crate) request_timeout: Duration,
    state: watch::Sender<LifecycleState>,
    endpoint: RwLock<Option<String>>,
    created_at: DateTime<Utc>,
}

impl TranslatorShared {
    fn new(name: &str, direction: Direction, events: EventSink, request_timeout: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(LifecycleState::Stopped);
        Arc::new(Self {
            id: TranslatorId::new(),
            name: name.to_string(),
            direction,
            pending: PendingTable::new(format!("translator:{}", name)),
            events,
            request_timeout,
            state,
            endpoint: RwLock::new(None),
            created_at: Utc::now(),
        })
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub(crate) fn transition(&self, to: LifecycleState) {
        let from = self.state();
        if !from.can_transition_to(to) {
            debug!(translator = %self.name, from = %from, to = %to, "Ignoring invalid transition");
            return;
        }
        self.state.send_replace(to);
        info!(translator = %self.name, id = %self.id, from = %from, to = %to, "Translator state changed");
        self.events.emit(ComposerEvent::Lifecycle {
            subject: Subject::Translator,
            name: self.name.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Leave `Running` for `outcome`, through `Stopping` when it is a stop.
    pub(crate) fn finish(&self, outcome: LifecycleState) {
        if outcome == LifecycleState::Stopped {
            self.transition(LifecycleState::Stopping);
        }
        self.transition(outcome);
    }

    pub(crate) fn set_endpoint(&self, endpoint: impl Into<String>) {
        *self.endpoint.write() = Some(endpoint.into());
    }

    fn info(&self) -> TranslatorInfo {
        TranslatorInfo {
            id: self.id,
            name: self.name.clone(),
            direction: self.direction,
            state: self.state(),
            pending: self.pending.len(),
            endpoint: self.endpoint.read().clone(),
            created_at: self.created_at,
        }
    }
}

/// A translator name held while its translator starts. Dropping it without
/// `commit` gives the name back.
struct NameReservation<'a> {
    names: &'a Mutex<HashSet<String>>,
    name: Option<String>,
}

impl NameReservation<'_> {
    fn commit(mut self) {
        self.name = None;
    }
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            self.names.lock().remove(&name);
        }
    }
}

struct TranslatorHandle {
    shared: Arc<TranslatorShared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    uses_host_stdio: bool,
}

/// Owns every translator.
pub struct TranslatorManager {
    ctx: CoreContext,
    translators: RwLock<HashMap<TranslatorId, Arc<TranslatorHandle>>>,
    /// Names of live translators and of those still starting.
    names: Mutex<HashSet<String>>,
    host_stdio_taken: AtomicBool,
}

impl TranslatorManager {
    pub fn new(ctx: CoreContext) -> Self {
        Self {
            ctx,
            translators: RwLock::new(HashMap::new()),
            names: Mutex::new(HashSet::new()),
            host_stdio_taken: AtomicBool::new(false),
        }
    }

    fn timeout_for(&self, configured: Option<u64>) -> Duration {
        configured
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.ctx.settings.request_timeout())
    }

    fn reserve_name(&self, name: &str) -> Result<NameReservation<'_>> {
        if !self.names.lock().insert(name.to_string()) {
            return Err(ComposerError::TranslatorExists(name.to_string()));
        }
        Ok(NameReservation {
            names: &self.names,
            name: Some(name.to_string()),
        })
    }

    /// Create and start a translator. A stdio-to-stream translator uses this
    /// process's own stdin and stdout, so at most one can exist at a time.
    pub async fn create(&self, config: TranslatorConfig) -> Result<TranslatorId> {
        config.validate()?;
        let reservation = self.reserve_name(config.name())?;
        let id = match config {
            TranslatorConfig::StreamToStdio(config) => self.create_stream_to_stdio(config).await?,
            TranslatorConfig::StdioToStream(config) => {
                if self.host_stdio_taken.swap(true, Ordering::SeqCst) {
                    return Err(ComposerError::config(
                        "another translator already owns this process's stdio",
                    ));
                }
                let caller = StdioTransport::from_host_stdio(
                    format!("{}:caller", config.name),
                    self.ctx.events.clone(),
                );
                let result = self.create_stdio_to_stream(config, caller, true).await;
                if result.is_err() {
                    self.host_stdio_taken.store(false, Ordering::SeqCst);
                }
                result?
            }
        };
        reservation.commit();
        Ok(id)
    }

    /// Create a stdio-to-stream translator whose caller is the given pipe pair.
    pub async fn create_with_pipes<R, W>(
        &self,
        config: StdioToStreamConfig,
        reader: R,
        writer: W,
    ) -> Result<TranslatorId>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let wrapped = TranslatorConfig::StdioToStream(config);
        wrapped.validate()?;
        let reservation = self.reserve_name(wrapped.name())?;
        let TranslatorConfig::StdioToStream(config) = wrapped else {
            return Err(ComposerError::config("expected a stdio-to-stream translator"));
        };
        let caller = StdioTransport::from_pipes(
            format!("{}:caller", config.name),
            reader,
            writer,
            self.ctx.events.clone(),
        );
        let id = self.create_stdio_to_stream(config, caller, false).await?;
        reservation.commit();
        Ok(id)
    }

    async fn create_stream_to_stdio(&self, config: StreamToStdioConfig) -> Result<TranslatorId> {
        let shared = TranslatorShared::new(
            &config.name,
            Direction::StdioOrigin,
            self.ctx.events.clone(),
            self.timeout_for(config.request_timeout_ms),
        );
        shared.transition(LifecycleState::Starting);
        let bridge = match StreamToStdio::start(Arc::clone(&shared), &config, self.ctx.settings.stop_grace()).await {
            Ok(bridge) => bridge,
            Err(e) => {
                warn!(translator = %config.name, error = %e, "Translator failed to start");
                shared.transition(LifecycleState::Crashed);
                return Err(e);
            }
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(cancel.clone()));
        Ok(self.insert(shared, cancel, task, false))
    }

    async fn create_stdio_to_stream(
        &self,
        config: StdioToStreamConfig,
        caller: StdioTransport,
        uses_host_stdio: bool,
    ) -> Result<TranslatorId> {
        let shared = TranslatorShared::new(
            &config.name,
            Direction::StreamOrigin,
            self.ctx.events.clone(),
            self.timeout_for(config.request_timeout_ms),
        );
        shared.transition(LifecycleState::Starting);
        let connect_timeout = config
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.ctx.settings.handshake_timeout());
        let bridge = match StdioToStream::start(Arc::clone(&shared), &config, caller, connect_timeout).await {
            Ok(bridge) => bridge,
            Err(e) => {
                warn!(translator = %config.name, error = %e, "Translator failed to start");
                shared.transition(LifecycleState::Crashed);
                return Err(e);
            }
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(cancel.clone()));
        Ok(self.insert(shared, cancel, task, uses_host_stdio))
    }

    fn insert(
        &self,
        shared: Arc<TranslatorShared>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
        uses_host_stdio: bool,
    ) -> TranslatorId {
        let id = shared.id;
        info!(translator = %shared.name, id = %id, direction = %shared.direction, "Translator created");
        self.translators.write().insert(
            id,
            Arc::new(TranslatorHandle {
                shared,
                cancel,
                task: Mutex::new(Some(task)),
                uses_host_stdio,
            }),
        );
        id
    }

    fn handle(&self, id: TranslatorId) -> Result<Arc<TranslatorHandle>> {
        self.translators
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ComposerError::TranslatorNotFound(id.to_string()))
    }

    /// Stop a translator, release what it owns, and forget it.
    pub async fn delete(&self, id: TranslatorId) -> Result<()> {
        let handle = self.handle(id)?;
        handle.cancel.cancel();
        let task = handle.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(translator = %handle.shared.name, error = %e, "Translator task failed");
            }
        }
        self.translators.write().remove(&id);
        self.names.lock().remove(&handle.shared.name);
        if handle.uses_host_stdio {
            self.host_stdio_taken.store(false, Ordering::SeqCst);
        }
        info!(translator = %handle.shared.name, id = %id, "Translator deleted");
        Ok(())
    }

    pub fn info(&self, id: TranslatorId) -> Result<TranslatorInfo> {
        Ok(self.handle(id)?.shared.info())
    }

    /// Every translator, oldest first.
    pub fn list(&self) -> Vec<TranslatorInfo> {
        let mut infos: Vec<_> = self
            .translators
            .read()
            .values()
            .map(|t| t.shared.info())
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    pub fn find(&self, name: &str) -> Option<TranslatorId> {
        self.translators
            .read()
            .values()
            .find(|t| t.shared.name == name)
            .map(|t| t.shared.id)
    }

    /// Wait until the translator is `Stopped` or `Crashed` and return which.
    pub async fn wait_finished(&self, id: TranslatorId) -> Result<LifecycleState> {
        let mut state = self.handle(id)?.shared.state.subscribe();
        let finished = state
            .wait_for(|s| s.is_down())
            .await
            .map(|s| *s)
            .unwrap_or(LifecycleState::Stopped);
        Ok(finished)
    }

    /// Delete every translator.
    pub async fn stop_all(&self) {
        let ids: Vec<_> = self.translators.read().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.delete(id).await {
                debug!(id = %id, error = %e, "Translator already gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoreSettings;

    fn manager() -> TranslatorManager {
        TranslatorManager::new(CoreContext::detached(CoreSettings::default()))
    }

    #[test]
    fn test_config_deserialization() {
        let config: TranslatorConfig = serde_json::from_str(
            r#"{"kind":"stream-to-stdio","name":"fs","command":"fs-server","args":["--root","/tmp"]}"#,
        )
        .unwrap();
        assert_eq!(config.name(), "fs");
        assert_eq!(config.direction(), Direction::StdioOrigin);

        let config: TranslatorConfig = serde_json::from_str(
            r#"{"kind":"stdio-to-stream","name":"remote","url":"http://127.0.0.1:9000/sse"}"#,
        )
        .unwrap();
        assert_eq!(config.direction(), Direction::StreamOrigin);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad_url = TranslatorConfig::StdioToStream(StdioToStreamConfig {
            name: "r".into(),
            url: "not a url".into(),
            headers: BTreeMap::new(),
            request_timeout_ms: None,
            connect_timeout_ms: None,
        });
        assert!(bad_url.validate().is_err());

        let no_command = TranslatorConfig::StreamToStdio(StreamToStdioConfig {
            name: "s".into(),
            command: " ".into(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            streaming: StreamingConfig::default(),
            request_timeout_ms: None,
        });
        assert!(no_command.validate().is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let manager = manager();
        let config = TranslatorConfig::StreamToStdio(StreamToStdioConfig {
            name: "ghost".into(),
            command: "/definitely/not/a/real/binary".into(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            streaming: StreamingConfig::default().with_bind("127.0.0.1:0".parse().unwrap()),
            request_timeout_ms: None,
        });
        let err = manager.create(config).await.unwrap_err();
        assert!(matches!(err, ComposerError::ProcessStart { .. }));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_cannot_share_a_name() {
        // Accepts connections but never answers, so the first create is
        // still connecting when the second one starts.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/sse", listener.local_addr().unwrap());
        let config = || StdioToStreamConfig {
            name: "dup".into(),
            url: url.clone(),
            headers: BTreeMap::new(),
            request_timeout_ms: None,
            connect_timeout_ms: Some(300),
        };

        let manager = manager();
        let (first_pipe, _first_peer) = tokio::io::duplex(64);
        let (second_pipe, _second_peer) = tokio::io::duplex(64);
        let (first_reader, first_writer) = tokio::io::split(first_pipe);
        let (second_reader, second_writer) = tokio::io::split(second_pipe);

        let (first, second) = tokio::join!(
            manager.create_with_pipes(config(), first_reader, first_writer),
            manager.create_with_pipes(config(), second_reader, second_writer),
        );

        let exists = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(ComposerError::TranslatorExists(name)) if name == "dup"))
            .count();
        assert_eq!(exists, 1);
        assert!(matches!(first, Err(ComposerError::Timeout { .. })));

        // The failed create gave the name back.
        assert!(manager.reserve_name("dup").is_ok());
        assert!(manager.list().is_empty());
    }

    #[test]
    fn test_reservation_released_unless_committed() {
        let manager = manager();
        manager.reserve_name("a").unwrap().commit();
        assert!(matches!(
            manager.reserve_name("a"),
            Err(ComposerError::TranslatorExists(_))
        ));

        drop(manager.reserve_name("b").unwrap());
        assert!(manager.reserve_name("b").is_ok());
    }

    #[tokio::test]
    async fn test_unknown_translator() {
        let manager = manager();
        let err = manager.delete(TranslatorId::new()).await.unwrap_err();
        assert!(matches!(err, ComposerError::TranslatorNotFound(_)));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::StdioOrigin.to_string(), "stdio-origin");
        assert_eq!(
            serde_json::to_value(Direction::StreamOrigin).unwrap(),
            serde_json::json!("stream-origin")
        );
    }
}
