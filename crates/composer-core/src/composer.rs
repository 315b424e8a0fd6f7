//! The composer: supervisor, registry and translators behind one API, plus
//! the MCP endpoint clients of the aggregate talk to.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::RpcClient;
use crate::config::ServerSpec;
use crate::context::{CoreContext, CoreSettings};
use crate::error::{ComposerError, InvokeError, Result};
use crate::lifecycle::LifecycleState;
use crate::observer::{ComposerEvent, InvocationOutcome, Observer, spawn_dispatcher};
use crate::process::ServerStatus;
use crate::protocol::{
    CallToolParams, GetPromptParams, InitializeResult, JsonRpcError, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListPromptsResult, ListResourcesResult,
    ListToolsResult, MCP_PROTOCOL_VERSION, ReadResourceParams, ServerCapabilities, ServerInfo,
    ToolsCapability, methods,
};
use crate::registry::{
    CapabilityDescriptor, CapabilityKind, ConflictRecord, RefreshSummary, Registry, RegistryPolicy, Route,
    RouteLookup, ToolDescriptor,
};
use crate::supervisor::{Supervisor, SupervisorChange};
use crate::transport::{Envelope, SessionId, Transport};
use crate::translator::{TranslatorConfig, TranslatorId, TranslatorInfo, TranslatorManager};

const LIST_CHANGED: [&str; 3] = [
    methods::TOOLS_LIST_CHANGED,
    methods::PROMPTS_LIST_CHANGED,
    methods::RESOURCES_LIST_CHANGED,
];

/// Assembles a [`Composer`].
#[derive(Default)]
pub struct ComposerBuilder {
    settings: CoreSettings,
    policy: RegistryPolicy,
    observers: Vec<Arc<dyn Observer>>,
    servers: Vec<ServerSpec>,
}

impl ComposerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(mut self, settings: CoreSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn policy(mut self, policy: RegistryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn server(mut self, spec: ServerSpec) -> Self {
        self.servers.push(spec);
        self
    }

    pub fn servers(mut self, specs: impl IntoIterator<Item = ServerSpec>) -> Self {
        self.servers.extend(specs);
        self
    }

    /// Build the composer. Servers are registered but not started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Arc<Composer>> {
        let (events, _dispatcher) = spawn_dispatcher(self.observers);
        let ctx = CoreContext::new(self.settings, events);
        let registry = Registry::new(&self.policy, ctx.events.clone())?;
        let supervisor = Supervisor::new(ctx.clone());
        for spec in self.servers {
            supervisor.add(spec)?;
        }

        let (namespace_changes, _) = broadcast::channel(16);
        let composer = Arc::new(Composer {
            translators: TranslatorManager::new(ctx.clone()),
            ctx,
            supervisor,
            registry,
            refresh_lock: tokio::sync::Mutex::new(()),
            namespace_changes,
            cancel: CancellationToken::new(),
            watcher: Mutex::new(None),
        });

        let task = tokio::spawn(watch_supervisor(
            Arc::downgrade(&composer),
            composer.supervisor.subscribe(),
            composer.cancel.child_token(),
        ));
        *composer.watcher.lock() = Some(task);
        Ok(composer)
    }
}

/// The composition engine.
pub struct Composer {
    ctx: CoreContext,
    supervisor: Arc<Supervisor>,
    registry: Registry,
    translators: TranslatorManager,
    refresh_lock: tokio::sync::Mutex<()>,
    namespace_changes: broadcast::Sender<()>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Composer {
    pub fn builder() -> ComposerBuilder {
        ComposerBuilder::new()
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.ctx.settings
    }

    /// Fires whenever the exposed namespace changes.
    pub fn namespace_changes(&self) -> broadcast::Receiver<()> {
        self.namespace_changes.subscribe()
    }

    // ── Servers ─────────────────────────────────────────────────────────

    /// Register a server. Its name is its id.
    pub fn add_server(&self, spec: ServerSpec) -> Result<String> {
        let name = spec.name.clone();
        self.supervisor.add(spec)?;
        Ok(name)
    }

    /// Unregister a stopped or crashed server and forget its entries.
    pub async fn remove_server(&self, name: &str) -> Result<()> {
        self.supervisor.remove(name).await?;
        self.refresh_logged().await;
        Ok(())
    }

    /// Start a server and merge its capabilities.
    ///
    /// A conflict refused by the `error` strategy is returned as
    /// [`ComposerError::ToolConflict`]; the server itself keeps running and
    /// the namespace is left as it was.
    pub async fn start(&self, name: &str) -> Result<()> {
        self.supervisor.start(name).await?;
        self.refresh().await.map(|_| ())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.supervisor.stop(name).await?;
        self.refresh_logged().await;
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        self.supervisor.restart(name).await?;
        self.refresh().await.map(|_| ())
    }

    /// Start every enabled server in registration order, then merge the
    /// namespace once. Returns the servers that failed to start; one failure
    /// does not stop the others. A refused conflict is returned as `Err`.
    pub async fn start_all(&self) -> Result<Vec<(String, ComposerError)>> {
        let mut failures = Vec::new();
        for name in self.supervisor.names() {
            let enabled = self.supervisor.spec(&name).map(|s| s.enabled).unwrap_or(false);
            if !enabled {
                debug!(server = %name, "Skipping disabled server");
                continue;
            }
            if let Err(e) = self.supervisor.start(&name).await {
                warn!(server = %name, error = %e, "Server failed to start");
                failures.push((name, e));
            }
        }
        self.refresh().await?;
        Ok(failures)
    }

    pub fn status(&self, name: &str) -> Result<ServerStatus> {
        self.supervisor.status(name)
    }

    pub fn list_servers(&self) -> Vec<ServerStatus> {
        self.supervisor.list()
    }

    // ── Registry ────────────────────────────────────────────────────────

    /// Re-derive the namespace from the running servers.
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        let _guard = self.refresh_lock.lock().await;
        let live = self.supervisor.live_capabilities();
        let registered: HashSet<String> = self.supervisor.names().into_iter().collect();
        let summary = self.registry.refresh(&live, &registered)?;
        if summary.changed {
            let _ = self.namespace_changes.send(());
        }
        Ok(summary)
    }

    async fn refresh_logged(&self) {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "Namespace refresh failed");
        }
    }

    /// Re-list one server's capabilities, then refresh the namespace.
    pub async fn refresh_server(&self, name: &str) -> Result<RefreshSummary> {
        self.supervisor.refresh_capabilities(name).await?;
        self.refresh().await
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.list_tools()
    }

    pub fn list_prompts(&self) -> Vec<CapabilityDescriptor> {
        self.registry.list(CapabilityKind::Prompt)
    }

    pub fn list_resources(&self) -> Vec<CapabilityDescriptor> {
        self.registry.list(CapabilityKind::Resource)
    }

    /// Look up a tool by exposed name or alias.
    pub fn get_tool(&self, name: &str) -> Result<ToolDescriptor> {
        self.registry
            .get_tool(name)
            .ok_or_else(|| ComposerError::ToolNotFound(name.to_string()))
    }

    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.registry.conflicts()
    }

    /// Register an alias; returns the alias actually registered.
    pub fn add_alias(&self, alias: &str, target: &str) -> Result<String> {
        let registered = self.registry.add_alias(alias, target)?;
        let _ = self.namespace_changes.send(());
        Ok(registered)
    }

    pub fn remove_alias(&self, alias: &str) -> bool {
        let removed = self.registry.remove_alias(alias);
        if removed {
            let _ = self.namespace_changes.send(());
        }
        removed
    }

    // ── Invocation ──────────────────────────────────────────────────────

    fn route(&self, lookup: Option<RouteLookup>, name: &str) -> std::result::Result<(Route, Arc<RpcClient>), InvokeError> {
        let unavailable = |route: Route| {
            let state = self
                .supervisor
                .status(&route.server)
                .map(|s| s.state)
                .unwrap_or(LifecycleState::Stopped);
            InvokeError::Unavailable {
                tool: name.to_string(),
                server: route.server,
                state,
            }
        };
        match lookup {
            None => Err(InvokeError::NotFound(name.to_string())),
            Some(RouteLookup::Retired(route)) => Err(unavailable(route)),
            Some(RouteLookup::Live(route)) => match self.supervisor.client(&route.server) {
                Some(client) => Ok((route, client)),
                None => Err(unavailable(route)),
            },
        }
    }

    /// Route a request to the origin of `name` and report the outcome.
    async fn dispatch(
        &self,
        name: &str,
        lookup: Option<RouteLookup>,
        method: &str,
        params: impl FnOnce(&Route) -> Value,
    ) -> std::result::Result<Value, InvokeError> {
        let started = Instant::now();
        let routed = self.route(lookup, name);
        let server = match &routed {
            Ok((route, _)) => Some(route.server.clone()),
            Err(InvokeError::Unavailable { server, .. }) => Some(server.clone()),
            Err(_) => None,
        };

        let result = match routed {
            Ok((route, client)) => client
                .request(method, Some(params(&route)))
                .await
                .map_err(InvokeError::from),
            Err(e) => Err(e),
        };

        let outcome = match &result {
            Ok(_) => InvocationOutcome::Success,
            Err(InvokeError::NotFound(_)) => InvocationOutcome::NotFound,
            Err(InvokeError::Unavailable { .. }) => InvocationOutcome::Unavailable,
            Err(InvokeError::Downstream(_)) => InvocationOutcome::Downstream,
            Err(InvokeError::Failed(_)) => InvocationOutcome::Failed,
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(name = %name, server = ?server, duration_ms, "Invocation complete"),
            Err(e) => info!(name = %name, server = ?server, duration_ms, error = %e, "Invocation failed"),
        }
        self.ctx.emit(ComposerEvent::Invocation {
            tool: name.to_string(),
            server,
            duration_ms,
            outcome,
        });
        result
    }

    /// Call a tool by exposed name or alias. The origin's result (including
    /// an `isError` result) is returned unmodified.
    pub async fn invoke(&self, name: &str, arguments: Option<Value>) -> std::result::Result<Value, InvokeError> {
        let lookup = self.registry.lookup(CapabilityKind::Tool, name);
        self.dispatch(name, lookup, methods::TOOLS_CALL, |route| {
            json!(CallToolParams {
                name: route.origin_name.clone(),
                arguments,
            })
        })
        .await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> std::result::Result<Value, InvokeError> {
        let lookup = self.registry.lookup(CapabilityKind::Prompt, name);
        self.dispatch(name, lookup, methods::PROMPTS_GET, |route| {
            json!(GetPromptParams {
                name: route.origin_name.clone(),
                arguments,
            })
        })
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> std::result::Result<Value, InvokeError> {
        let lookup = self.registry.lookup_resource(uri);
        self.dispatch(uri, lookup, methods::RESOURCES_READ, |_| {
            json!(ReadResourceParams { uri: uri.to_string() })
        })
        .await
    }

    // ── Translators ─────────────────────────────────────────────────────

    pub async fn create_translator(&self, config: TranslatorConfig) -> Result<TranslatorId> {
        self.translators.create(config).await
    }

    pub async fn delete_translator(&self, id: TranslatorId) -> Result<()> {
        self.translators.delete(id).await
    }

    pub fn list_translators(&self) -> Vec<TranslatorInfo> {
        self.translators.list()
    }

    pub fn translators(&self) -> &TranslatorManager {
        &self.translators
    }

    // ── Serving ─────────────────────────────────────────────────────────

    /// Answer MCP requests arriving on `transport` until `cancel` fires or
    /// the transport's feed ends. Each session gets its own worker; requests
    /// within a session run concurrently and reply as they finish.
    pub async fn serve(self: &Arc<Self>, transport: Arc<dyn Transport>, cancel: CancellationToken) -> Result<()> {
        transport.connect().await?;
        let mut inbound = transport.subscribe(cancel.child_token())?;
        let mut changes = self.namespace_changes.subscribe();
        let mut workers: HashMap<Option<SessionId>, mpsc::UnboundedSender<JsonRpcMessage>> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut announce_changes = true;
        info!(transport = %transport.name(), kind = %transport.kind(), "Serving aggregate");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv(), if announce_changes => {
                    if let Err(broadcast::error::RecvError::Closed) = change {
                        announce_changes = false;
                        continue;
                    }
                    for method in LIST_CHANGED {
                        let notification = JsonRpcNotification::new(method, None);
                        if let Err(e) = transport.send(Envelope::new(notification)).await {
                            debug!(error = %e, "Failed to announce namespace change");
                        }
                    }
                }
                envelope = inbound.next() => {
                    let Some(envelope) = envelope else {
                        debug!(transport = %transport.name(), "Inbound feed ended");
                        break;
                    };
                    workers.retain(|session, tx| {
                        !tx.is_closed() && session.as_ref().is_none_or(|s| transport.has_session(s))
                    });
                    let tx = workers.entry(envelope.session).or_insert_with(|| {
                        let (tx, rx) = mpsc::unbounded_channel();
                        tasks.spawn(session_worker(
                            Arc::clone(self),
                            Arc::clone(&transport),
                            envelope.session,
                            rx,
                        ));
                        tx
                    });
                    if tx.send(envelope.message).is_err() {
                        debug!(session = ?envelope.session, "Session worker already gone");
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(workers);
        if cancel.is_cancelled() {
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}
        transport.disconnect().await?;
        info!(transport = %transport.name(), "Stopped serving aggregate");
        Ok(())
    }

    /// Answer one MCP request from a client of the aggregate.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        let result = match request.method.as_str() {
            methods::INITIALIZE => self.initialize_result(),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => to_json(ListToolsResult {
                tools: self.list_tools().iter().map(|d| d.to_tool_info()).collect(),
                next_cursor: None,
            }),
            methods::TOOLS_CALL => match parse_params::<CallToolParams>(request.params) {
                Ok(params) => self
                    .invoke(&params.name, params.arguments)
                    .await
                    .map_err(|e| e.to_rpc_error()),
                Err(e) => Err(e),
            },
            methods::PROMPTS_LIST => to_json(ListPromptsResult {
                prompts: self.list_prompts().iter().map(|d| d.to_prompt_info()).collect(),
                next_cursor: None,
            }),
            methods::PROMPTS_GET => match parse_params::<GetPromptParams>(request.params) {
                Ok(params) => self
                    .get_prompt(&params.name, params.arguments)
                    .await
                    .map_err(|e| e.to_rpc_error()),
                Err(e) => Err(e),
            },
            methods::RESOURCES_LIST => to_json(ListResourcesResult {
                resources: self.list_resources().iter().map(|d| d.to_resource_info()).collect(),
                next_cursor: None,
            }),
            methods::RESOURCES_READ => match parse_params::<ReadResourceParams>(request.params) {
                Ok(params) => self.read_resource(&params.uri).await.map_err(|e| e.to_rpc_error()),
                Err(e) => Err(e),
            },
            other => Err(JsonRpcError::new(
                JsonRpcError::METHOD_NOT_FOUND,
                format!("method '{}' not found", other),
            )),
        };
        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::failure(Some(id), error),
        }
    }

    fn initialize_result(&self) -> std::result::Result<Value, JsonRpcError> {
        to_json(InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(true),
                }),
                prompts: Some(json!({ "listChanged": true })),
                resources: Some(json!({ "listChanged": true })),
                ..ServerCapabilities::default()
            },
            server_info: ServerInfo {
                name: self.ctx.settings.name.clone(),
                version: Some(self.ctx.settings.version.clone()),
            },
            instructions: None,
        })
    }

    /// Stop translators and servers, then background tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down composer");
        self.translators.stop_all().await;
        self.supervisor.shutdown().await;
        self.cancel.cancel();
        let task = self.watcher.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn to_json<T: Serialize>(value: T) -> std::result::Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()))
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| JsonRpcError::new(JsonRpcError::INVALID_PARAMS, format!("invalid params: {}", e)))
}

async fn session_worker(
    composer: Arc<Composer>,
    transport: Arc<dyn Transport>,
    session: Option<SessionId>,
    mut rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
) {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    break;
                };
                match message {
                    JsonRpcMessage::Request(request) => {
                        trace!(session = ?session, method = %request.method, "Request from client");
                        let composer = Arc::clone(&composer);
                        let transport = Arc::clone(&transport);
                        in_flight.spawn(async move {
                            let response = composer.handle_request(request).await;
                            if let Err(e) = transport.send(Envelope::for_session(session, response)).await {
                                debug!(session = ?session, error = %e, "Client went away");
                            }
                        });
                    }
                    JsonRpcMessage::Notification(notification) => {
                        trace!(session = ?session, method = %notification.method, "Notification from client");
                    }
                    JsonRpcMessage::Response(response) => {
                        trace!(session = ?session, id = ?response.id, "Ignoring response from client");
                    }
                }
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }
    while in_flight.join_next().await.is_some() {}
}

/// Keep the namespace in step with server state and capability changes.
async fn watch_supervisor(
    composer: Weak<Composer>,
    mut changes: broadcast::Receiver<SupervisorChange>,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => change,
        };
        match change {
            Ok(change) => trace!(change = ?change, "Supervisor change"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Supervisor change feed lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
        let Some(composer) = composer.upgrade() else {
            break;
        };
        composer.refresh_logged().await;
    }
    debug!("Supervisor watcher stopped");
}
