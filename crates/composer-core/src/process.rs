//! One supervised server: its launch spec, lifecycle state and the single
//! live incarnation (child process or remote connection) it owns.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RpcClient;
use crate::config::{CrashCause, Readiness, ServerSpec};
use crate::context::CoreContext;
use crate::error::{ComposerError, Result};
use crate::health::HealthMonitor;
use crate::lifecycle::LifecycleState;
use crate::observer::{ComposerEvent, Subject};
use crate::protocol::InitializeResult;
use crate::registry::CapabilitySet;
use crate::supervisor::SupervisorSignal;
use crate::transport::{RemoteTransport, StdioTransport, Transport, TransportKind};

/// Point-in-time view of a managed server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: LifecycleState,
    pub transport: TransportKind,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub version: Option<String>,
    pub tool_count: usize,
}

impl ServerStatus {
    /// Time since the current incarnation started, while running.
    pub fn uptime(&self) -> Option<Duration> {
        if self.state != LifecycleState::Running {
            return None;
        }
        self.started_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
    }
}

enum Control {
    /// Stdin is already closed: wait, then SIGTERM, then kill.
    Stop { grace: Duration },
    Kill,
}

/// Everything tied to one launch. Dropped exactly once, on stop or crash.
struct Incarnation {
    client: Arc<RpcClient>,
    capabilities: Arc<CapabilitySet>,
    cancel: CancellationToken,
    pid: Option<u32>,
    control: Option<mpsc::Sender<Control>>,
    watcher: Option<JoinHandle<Option<i32>>>,
    tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct ManagedProcess {
    pub(crate) spec: ServerSpec,
    ctx: CoreContext,
    state: LifecycleState,
    generation: u64,
    restart_count: u32,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    last_error: Option<String>,
    incarnation: Option<Incarnation>,
    /// Back-off timer of a scheduled restart.
    pub(crate) pending_restart: Option<CancellationToken>,
}

impl ManagedProcess {
    pub(crate) fn new(spec: ServerSpec, ctx: CoreContext) -> Self {
        Self {
            spec,
            ctx,
            state: LifecycleState::Stopped,
            generation: 0,
            restart_count: 0,
            started_at: None,
            stopped_at: None,
            exit_code: None,
            last_error: None,
            incarnation: None,
            pending_restart: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.spec.name
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub(crate) fn bump_restart_count(&mut self) -> u32 {
        self.restart_count += 1;
        self.restart_count
    }

    pub(crate) fn client(&self) -> Option<Arc<RpcClient>> {
        self.incarnation.as_ref().map(|i| Arc::clone(&i.client))
    }

    pub(crate) fn capabilities(&self) -> Option<Arc<CapabilitySet>> {
        self.incarnation
            .as_ref()
            .map(|i| Arc::clone(&i.capabilities))
    }

    pub(crate) fn cancel_pending_restart(&mut self) {
        if let Some(token) = self.pending_restart.take() {
            token.cancel();
            debug!(server = %self.spec.name, "Cancelled scheduled restart");
        }
    }

    pub(crate) fn status(&self) -> ServerStatus {
        let capabilities = self.capabilities();
        ServerStatus {
            name: self.spec.name.clone(),
            state: self.state,
            transport: self.spec.transport,
            pid: self.incarnation.as_ref().and_then(|i| i.pid),
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            exit_code: self.exit_code,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
            version: capabilities
                .as_ref()
                .and_then(|c| c.version.clone())
                .or_else(|| self.spec.version.clone()),
            tool_count: capabilities.map(|c| c.tools.len()).unwrap_or(0),
        }
    }

    fn transition(&mut self, to: LifecycleState) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(ComposerError::InvalidState {
                name: self.spec.name.clone(),
                operation: "transition",
                state: from,
            });
        }
        self.state = to;
        info!(server = %self.spec.name, from = %from, to = %to, "Server state changed");
        self.ctx.emit(ComposerEvent::Lifecycle {
            subject: Subject::Server,
            name: self.spec.name.clone(),
            from,
            to,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Launch a new incarnation and wait until it is ready.
    ///
    /// If the process cannot be spawned (or the remote cannot be reached)
    /// the state is left as it was. A failed handshake leaves it `Crashed`.
    pub(crate) async fn launch(&mut self, signals: &mpsc::UnboundedSender<SupervisorSignal>) -> Result<()> {
        if !self.state.is_down() {
            return Err(ComposerError::InvalidState {
                name: self.spec.name.clone(),
                operation: "start",
                state: self.state,
            });
        }
        self.generation += 1;
        let result = match self.spec.transport {
            TransportKind::Stdio => self.launch_stdio(signals).await,
            TransportKind::Streaming => self.launch_remote(signals).await,
        };
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    async fn launch_stdio(&mut self, signals: &mpsc::UnboundedSender<SupervisorSignal>) -> Result<()> {
        let name = self.spec.name.clone();
        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            warn!(server = %name, command = %self.spec.command, error = %e, "Failed to spawn server");
            ComposerError::process_start(&name, e)
        })?;
        let pid = child.id();
        info!(server = %name, pid = ?pid, command = %self.spec.command, "Spawned server process");

        self.transition(LifecycleState::Starting)?;
        self.stopped_at = None;
        self.exit_code = None;

        let transport = match StdioTransport::from_child(&name, &mut child, self.ctx.events.clone()) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                let _ = child.start_kill();
                return Err(self.fail_handshake(e));
            }
        };

        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(4);
        let watcher = tokio::spawn(watch_child(
            name.clone(),
            self.generation,
            child,
            control_rx,
            cancel.clone(),
            signals.clone(),
        ));

        let client = match RpcClient::connect(&name, transport, self.ctx.settings.request_timeout()).await {
            Ok(client) => client,
            Err(e) => {
                cancel.cancel();
                let _ = control_tx.send(Control::Kill).await;
                let _ = watcher.await;
                return Err(self.fail_handshake(e));
            }
        };

        match self.ready(&client).await {
            Ok(capabilities) => {
                let mut incarnation = Incarnation {
                    client,
                    capabilities: Arc::new(capabilities),
                    cancel,
                    pid,
                    control: Some(control_tx),
                    watcher: Some(watcher),
                    tasks: Vec::new(),
                };
                self.attach_tasks(&mut incarnation, signals);
                self.enter_running(incarnation, signals)
            }
            Err(e) => {
                cancel.cancel();
                client.shutdown().await;
                let _ = control_tx.send(Control::Kill).await;
                let _ = watcher.await;
                Err(self.fail_handshake(e))
            }
        }
    }

    async fn launch_remote(&mut self, signals: &mpsc::UnboundedSender<SupervisorSignal>) -> Result<()> {
        let name = self.spec.name.clone();
        let url = self
            .spec
            .url
            .clone()
            .ok_or_else(|| ComposerError::process_start(&name, "no url configured"))?;
        let transport = RemoteTransport::new(&name, &url, self.ctx.events.clone())?
            .with_headers(self.spec.headers.clone())
            .with_connect_timeout(self.ctx.settings.handshake_timeout());
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let client = RpcClient::connect(&name, transport, self.ctx.settings.request_timeout())
            .await
            .map_err(|e| {
                warn!(server = %name, url = %url, error = %e, "Failed to reach remote server");
                ComposerError::process_start(&name, e)
            })?;
        info!(server = %name, url = %url, "Connected to remote server");

        self.transition(LifecycleState::Starting)?;
        self.stopped_at = None;
        self.exit_code = None;

        match self.ready(&client).await {
            Ok(capabilities) => {
                let cancel = CancellationToken::new();
                let mut incarnation = Incarnation {
                    client: Arc::clone(&client),
                    capabilities: Arc::new(capabilities),
                    cancel: cancel.clone(),
                    pid: None,
                    control: None,
                    watcher: None,
                    tasks: Vec::new(),
                };
                incarnation.tasks.push(tokio::spawn(watch_remote(
                    name,
                    self.generation,
                    client.closed(),
                    cancel,
                    signals.clone(),
                )));
                self.attach_tasks(&mut incarnation, signals);
                self.enter_running(incarnation, signals)
            }
            Err(e) => {
                client.shutdown().await;
                Err(self.fail_handshake(e))
            }
        }
    }

    /// Run the readiness check and fetch capabilities.
    async fn ready(&self, client: &RpcClient) -> Result<CapabilitySet> {
        let timeout = self.ctx.settings.handshake_timeout();
        match self.spec.readiness {
            Readiness::Initialize => {
                let init = tokio::time::timeout(timeout, client.initialize())
                    .await
                    .map_err(|_| ComposerError::timeout("initialize", timeout))??;
                debug!(
                    server = %self.spec.name,
                    remote = %init.server_info.name,
                    protocol = %init.protocol_version,
                    "Handshake complete"
                );
                tokio::time::timeout(timeout, fetch_capabilities(client, Some(&init), self.spec.version.clone()))
                    .await
                    .map_err(|_| ComposerError::timeout("capability listing", timeout))?
            }
            // Listed later, once the server answers.
            Readiness::Immediate => Ok(CapabilitySet {
                version: self.spec.version.clone(),
                ..CapabilitySet::default()
            }),
        }
    }

    fn attach_tasks(&self, incarnation: &mut Incarnation, signals: &mpsc::UnboundedSender<SupervisorSignal>) {
        let monitor = HealthMonitor {
            server: self.spec.name.clone(),
            generation: self.generation,
            health: self.spec.health.clone(),
            limits: self.spec.limits.clone(),
            client: Arc::clone(&incarnation.client),
            pid: incarnation.pid,
            signals: signals.clone(),
            events: self.ctx.events.clone(),
        };
        if let Some(task) = monitor.spawn(incarnation.cancel.child_token()) {
            incarnation.tasks.push(task);
        }
        incarnation.tasks.push(tokio::spawn(forward_list_changes(
            self.spec.name.clone(),
            self.generation,
            Arc::clone(&incarnation.client),
            incarnation.cancel.child_token(),
            signals.clone(),
        )));
    }

    fn enter_running(
        &mut self,
        incarnation: Incarnation,
        signals: &mpsc::UnboundedSender<SupervisorSignal>,
    ) -> Result<()> {
        self.incarnation = Some(incarnation);
        self.started_at = Some(Utc::now());
        self.last_error = None;
        self.transition(LifecycleState::Running)?;
        if self.spec.readiness == Readiness::Immediate {
            let _ = signals.send(SupervisorSignal::CapabilitiesChanged {
                server: self.spec.name.clone(),
                generation: self.generation,
            });
        }
        Ok(())
    }

    fn fail_handshake(&mut self, error: ComposerError) -> ComposerError {
        warn!(server = %self.spec.name, error = %error, "Server did not become ready");
        self.stopped_at = Some(Utc::now());
        let _ = self.transition(LifecycleState::Crashed);
        ComposerError::process_start(&self.spec.name, error)
    }

    /// Re-list capabilities from the live incarnation.
    pub(crate) async fn refresh_capabilities(&mut self) -> Result<Arc<CapabilitySet>> {
        let Some(incarnation) = self.incarnation.as_mut() else {
            return Err(ComposerError::InvalidState {
                name: self.spec.name.clone(),
                operation: "refresh",
                state: self.state,
            });
        };
        let init = incarnation.client.server_info();
        let timeout = self.ctx.settings.handshake_timeout();
        let capabilities = tokio::time::timeout(
            timeout,
            fetch_capabilities(&incarnation.client, init.as_ref(), self.spec.version.clone()),
        )
        .await
        .map_err(|_| ComposerError::timeout("capability listing", timeout))??;
        let capabilities = Arc::new(capabilities);
        incarnation.capabilities = Arc::clone(&capabilities);
        debug!(server = %self.spec.name, tools = capabilities.tools.len(), "Capabilities refreshed");
        Ok(capabilities)
    }

    /// Graceful stop of a running server: close its input, then SIGTERM,
    /// then kill after the grace period.
    pub(crate) async fn terminate(&mut self) -> Result<()> {
        self.cancel_pending_restart();
        if self.state.is_down() {
            return Ok(());
        }
        if self.state != LifecycleState::Running {
            return Err(ComposerError::InvalidState {
                name: self.spec.name.clone(),
                operation: "stop",
                state: self.state,
            });
        }
        self.transition(LifecycleState::Stopping)?;
        let exit_code = self.release(Control::Stop {
            grace: self.ctx.settings.stop_grace(),
        })
        .await;
        self.exit_code = exit_code;
        self.stopped_at = Some(Utc::now());
        self.transition(LifecycleState::Stopped)?;
        Ok(())
    }

    /// Tear down after an unexpected end and record the cause.
    pub(crate) async fn crash(&mut self, cause: &CrashCause) {
        if !self.state.is_active() {
            return;
        }
        let exit_code = self.release(Control::Kill).await;
        self.exit_code = cause.exit_code().or(exit_code);
        self.stopped_at = Some(Utc::now());
        self.last_error = Some(cause.describe());
        let _ = self.transition(LifecycleState::Crashed);
    }

    /// Drop the incarnation, releasing the child exactly once.
    async fn release(&mut self, control: Control) -> Option<i32> {
        let incarnation = self.incarnation.take()?;
        incarnation.cancel.cancel();
        incarnation.client.shutdown().await;

        let mut exit_code = None;
        if let (Some(tx), Some(mut watcher)) = (incarnation.control, incarnation.watcher) {
            let budget = match &control {
                Control::Stop { grace } => *grace * 2 + Duration::from_secs(1),
                Control::Kill => self.ctx.settings.stop_grace() + Duration::from_secs(1),
            };
            let _ = tx.send(control).await;
            match tokio::time::timeout(budget, &mut watcher).await {
                Ok(Ok(code)) => exit_code = code,
                Ok(Err(e)) => warn!(server = %self.spec.name, error = %e, "Process watcher failed"),
                Err(_) => {
                    warn!(server = %self.spec.name, "Process did not exit; dropping handle");
                    watcher.abort();
                }
            }
        }
        for task in incarnation.tasks {
            task.abort();
        }
        exit_code
    }
}

/// Own the child until it exits; report unexpected exits to the supervisor.
async fn watch_child(
    server: String,
    generation: u64,
    mut child: Child,
    mut control: mpsc::Receiver<Control>,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<SupervisorSignal>,
) -> Option<i32> {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(command) = control.recv() => match command {
                Control::Stop { grace } => break stop_child(&server, &mut child, grace).await,
                Control::Kill => {
                    if let Err(e) = child.start_kill() {
                        debug!(server = %server, error = %e, "Kill failed");
                    }
                }
            },
        }
    };

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(server = %server, error = %e, "Failed to wait for server process");
            None
        }
    };
    if !cancel.is_cancelled() {
        info!(server = %server, exit_code = ?exit_code, "Server process exited");
        let _ = signals.send(SupervisorSignal::Exited {
            server,
            generation,
            exit_code,
        });
    }
    exit_code
}

pub(crate) async fn stop_child(server: &str, child: &mut Child, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        debug!(server = %server, "Server exited after stdin closed");
        return status;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            info!(server = %server, pid, "Sending SIGTERM");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(server = %server, pid, error = ?e, "SIGTERM failed");
            }
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
    }

    warn!(server = %server, "Server ignored shutdown; killing");
    child.kill().await?;
    child.wait().await
}

async fn watch_remote(
    server: String,
    generation: u64,
    closed: CancellationToken,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<SupervisorSignal>,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = closed.cancelled() => {
            if !cancel.is_cancelled() {
                warn!(server = %server, "Remote server connection lost");
                let _ = signals.send(SupervisorSignal::Disconnected { server, generation });
            }
        }
    }
}

/// Turn `*/list_changed` notifications into capability refreshes.
async fn forward_list_changes(
    server: String,
    generation: u64,
    client: Arc<RpcClient>,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<SupervisorSignal>,
) {
    let mut notifications = client.notifications();
    drop(client);
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => return,
            n = notifications.recv() => n,
        };
        match notification {
            Ok(n) if n.method.ends_with("/list_changed") => {
                debug!(server = %server, method = %n.method, "Capabilities changed");
                let _ = signals.send(SupervisorSignal::CapabilitiesChanged {
                    server: server.clone(),
                    generation,
                });
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(server = %server, skipped, "Notification feed lagged");
                let _ = signals.send(SupervisorSignal::CapabilitiesChanged {
                    server: server.clone(),
                    generation,
                });
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// List tools, plus prompts and resources when the server advertises them.
async fn fetch_capabilities(
    client: &RpcClient,
    init: Option<&InitializeResult>,
    configured_version: Option<String>,
) -> Result<CapabilitySet> {
    let capabilities = init.map(|i| &i.capabilities);
    let tools = match capabilities {
        Some(c) if c.tools.is_none() => Vec::new(),
        _ => client.list_tools().await?,
    };
    let prompts = match capabilities {
        Some(c) if c.prompts.is_some() => client.list_prompts().await?,
        _ => Vec::new(),
    };
    let resources = match capabilities {
        Some(c) if c.resources.is_some() => client.list_resources().await?,
        _ => Vec::new(),
    };
    let version = configured_version.or_else(|| init.and_then(|i| i.server_info.version.clone()));
    Ok(CapabilitySet {
        version,
        tools,
        prompts,
        resources,
    })
}
