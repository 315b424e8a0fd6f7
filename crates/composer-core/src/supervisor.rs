//! The process supervisor: a table of managed servers, restart policy and
//! crash handling.
//!
//! Every operation on one server runs under that server's mutex, so two
//! operations on the same name never interleave; different names proceed
//! concurrently. Status reads never wait on that mutex: each entry carries a
//! published snapshot that is replaced after every mutation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::RpcClient;
use crate::config::{CrashCause, ServerSpec};
use crate::context::CoreContext;
use crate::error::{ComposerError, Result};
use crate::lifecycle::LifecycleState;
use crate::observer::ComposerEvent;
use crate::process::{ManagedProcess, ServerStatus};
use crate::registry::CapabilitySet;

/// Internal messages from process watchers, health monitors and restart timers.
#[derive(Debug)]
pub(crate) enum SupervisorSignal {
    Exited {
        server: String,
        generation: u64,
        exit_code: Option<i32>,
    },
    Disconnected {
        server: String,
        generation: u64,
    },
    Unhealthy {
        server: String,
        generation: u64,
        reason: String,
    },
    ResourceLimit {
        server: String,
        generation: u64,
        detail: String,
    },
    CapabilitiesChanged {
        server: String,
        generation: u64,
    },
    RestartDue {
        server: String,
        generation: u64,
    },
}

/// Something about a server changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorChange {
    State {
        server: String,
        state: LifecycleState,
    },
    Capabilities {
        server: String,
    },
    Removed {
        server: String,
    },
}

#[derive(Clone)]
struct Published {
    status: ServerStatus,
    client: Option<Arc<RpcClient>>,
    capabilities: Option<Arc<CapabilitySet>>,
}

struct Entry {
    order: usize,
    spec: ServerSpec,
    process: tokio::sync::Mutex<ManagedProcess>,
    published: RwLock<Published>,
}

impl Entry {
    fn published(process: &ManagedProcess) -> Published {
        Published {
            status: process.status(),
            client: process.client(),
            capabilities: process.capabilities(),
        }
    }
}

pub struct Supervisor {
    ctx: CoreContext,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    next_order: AtomicUsize,
    signals: mpsc::UnboundedSender<SupervisorSignal>,
    changes: broadcast::Sender<SupervisorChange>,
    cancel: CancellationToken,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(ctx: CoreContext) -> Arc<Self> {
        let (signals, rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(256);
        let supervisor = Arc::new(Self {
            ctx,
            entries: RwLock::new(HashMap::new()),
            next_order: AtomicUsize::new(0),
            signals,
            changes,
            cancel: CancellationToken::new(),
            signal_task: Mutex::new(None),
        });
        let task = tokio::spawn(run_signals(
            Arc::downgrade(&supervisor),
            rx,
            supervisor.cancel.child_token(),
        ));
        *supervisor.signal_task.lock() = Some(task);
        supervisor
    }

    /// State and capability changes, for whoever keeps the registry current.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorChange> {
        self.changes.subscribe()
    }

    fn entry(&self, name: &str) -> Result<Arc<Entry>> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ComposerError::ServerNotFound(name.to_string()))
    }

    fn sorted_entries(&self) -> Vec<(String, Arc<Entry>)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect();
        entries.sort_by_key(|(_, entry)| entry.order);
        entries
    }

    /// Replace the published snapshot and announce what changed.
    fn publish(&self, entry: &Entry, process: &ManagedProcess) {
        let next = Entry::published(process);
        let previous = std::mem::replace(&mut *entry.published.write(), next.clone());

        if previous.status.state != next.status.state {
            let _ = self.changes.send(SupervisorChange::State {
                server: next.status.name.clone(),
                state: next.status.state,
            });
        }
        let capabilities_changed = match (&previous.capabilities, &next.capabilities) {
            (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
            (None, None) => false,
            _ => true,
        };
        if capabilities_changed && previous.status.state == next.status.state {
            let _ = self.changes.send(SupervisorChange::Capabilities {
                server: next.status.name.clone(),
            });
        }
    }

    /// Register a server. It starts `Stopped`.
    pub fn add(&self, spec: ServerSpec) -> Result<()> {
        spec.validate()?;
        let mut entries = self.entries.write();
        if entries.contains_key(&spec.name) {
            return Err(ComposerError::ServerExists(spec.name));
        }
        let name = spec.name.clone();
        let process = ManagedProcess::new(spec, self.ctx.clone());
        let published = RwLock::new(Entry::published(&process));
        entries.insert(
            name.clone(),
            Arc::new(Entry {
                order: self.next_order.fetch_add(1, Ordering::Relaxed),
                spec: process.spec.clone(),
                process: tokio::sync::Mutex::new(process),
                published,
            }),
        );
        info!(server = %name, "Server registered");
        Ok(())
    }

    /// Unregister a server that is not running.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let mut process = entry.process.lock().await;
        if !process.state().is_down() {
            return Err(ComposerError::InvalidState {
                name: name.to_string(),
                operation: "remove",
                state: process.state(),
            });
        }
        process.cancel_pending_restart();
        self.entries.write().remove(name);
        info!(server = %name, "Server removed");
        let _ = self.changes.send(SupervisorChange::Removed {
            server: name.to_string(),
        });
        Ok(())
    }

    /// Launch a stopped or crashed server and wait until it is ready.
    pub async fn start(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let mut process = entry.process.lock().await;
        if !process.state().is_down() {
            return Err(ComposerError::InvalidState {
                name: name.to_string(),
                operation: "start",
                state: process.state(),
            });
        }
        process.cancel_pending_restart();
        let result = process.launch(&self.signals).await;
        self.publish(&entry, &process);
        result
    }

    /// Stop a server. Stopping a stopped or crashed server is a no-op that
    /// also cancels any scheduled restart.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let mut process = entry.process.lock().await;
        let result = process.terminate().await;
        self.publish(&entry, &process);
        result
    }

    /// Stop, then start, counting one restart.
    ///
    /// Refused once a bounded policy has used up its restarts.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let mut process = entry.process.lock().await;
        let restart = process.spec.restart.clone();
        if restart.is_bounded() && process.restart_count() >= restart.max_restarts {
            return Err(ComposerError::RestartLimitExceeded {
                name: name.to_string(),
                max_restarts: restart.max_restarts,
            });
        }
        process.terminate().await?;
        let count = process.bump_restart_count();
        info!(server = %name, restart_count = count, "Restarting server");
        let result = process.launch(&self.signals).await;
        self.publish(&entry, &process);
        result
    }

    pub fn status(&self, name: &str) -> Result<ServerStatus> {
        Ok(self.entry(name)?.published.read().status.clone())
    }

    /// Status of every server, in registration order.
    pub fn list(&self) -> Vec<ServerStatus> {
        self.sorted_entries()
            .into_iter()
            .map(|(_, entry)| entry.published.read().status.clone())
            .collect()
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.sorted_entries().into_iter().map(|(name, _)| name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Result<ServerSpec> {
        Ok(self.entry(name)?.spec.clone())
    }

    /// Client of a running server.
    pub fn client(&self, name: &str) -> Option<Arc<RpcClient>> {
        let entry = self.entries.read().get(name).cloned()?;
        let published = entry.published.read();
        match published.status.state {
            LifecycleState::Running => published.client.clone(),
            _ => None,
        }
    }

    /// Capabilities of every running server, in registration order.
    pub fn live_capabilities(&self) -> Vec<(String, Arc<CapabilitySet>)> {
        self.sorted_entries()
            .into_iter()
            .filter_map(|(name, entry)| {
                let published = entry.published.read();
                match (&published.status.state, &published.capabilities) {
                    (LifecycleState::Running, Some(c)) => Some((name, Arc::clone(c))),
                    _ => None,
                }
            })
            .collect()
    }

    /// Re-list one running server's capabilities.
    pub async fn refresh_capabilities(&self, name: &str) -> Result<()> {
        self.refresh_generation(name, None).await
    }

    async fn refresh_generation(&self, name: &str, generation: Option<u64>) -> Result<()> {
        let entry = self.entry(name)?;
        let mut process = entry.process.lock().await;
        if process.state() != LifecycleState::Running {
            return Err(ComposerError::InvalidState {
                name: name.to_string(),
                operation: "refresh",
                state: process.state(),
            });
        }
        if generation.is_some_and(|g| g != process.generation()) {
            return Ok(());
        }
        let result = process.refresh_capabilities().await.map(|_| ());
        self.publish(&entry, &process);
        result
    }

    /// Stop every server, then stop handling signals.
    pub async fn shutdown(&self) {
        let entries = self.sorted_entries();
        let stops = entries.iter().rev().map(|(name, entry)| async move {
            let mut process = entry.process.lock().await;
            process.cancel_pending_restart();
            if let Err(e) = process.terminate().await {
                warn!(server = %name, error = %e, "Failed to stop server");
            }
            self.publish(entry, &process);
        });
        futures::future::join_all(stops).await;

        self.cancel.cancel();
        let task = self.signal_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("Supervisor shut down");
    }

    async fn handle_signal(&self, signal: SupervisorSignal) {
        match signal {
            SupervisorSignal::Exited {
                server,
                generation,
                exit_code,
            } => {
                self.on_crash(&server, generation, CrashCause::Exited(exit_code))
                    .await
            }
            SupervisorSignal::Disconnected { server, generation } => {
                self.on_crash(&server, generation, CrashCause::Disconnected)
                    .await
            }
            SupervisorSignal::Unhealthy {
                server,
                generation,
                reason,
            } => {
                self.on_crash(&server, generation, CrashCause::Unhealthy(reason))
                    .await
            }
            SupervisorSignal::ResourceLimit {
                server,
                generation,
                detail,
            } => {
                self.on_crash(&server, generation, CrashCause::ResourceLimit(detail))
                    .await
            }
            SupervisorSignal::CapabilitiesChanged { server, generation } => {
                if let Err(e) = self.refresh_generation(&server, Some(generation)).await {
                    debug!(server = %server, error = %e, "Capability refresh skipped");
                }
            }
            SupervisorSignal::RestartDue { server, generation } => {
                self.on_restart_due(&server, generation).await
            }
        }
    }

    async fn on_crash(&self, name: &str, generation: u64, cause: CrashCause) {
        let Ok(entry) = self.entry(name) else {
            return;
        };
        let mut process = entry.process.lock().await;
        if process.generation() != generation || process.state() != LifecycleState::Running {
            debug!(server = %name, generation, "Ignoring stale signal");
            return;
        }
        error!(
            server = %name,
            cause = %cause.describe(),
            restart_count = process.restart_count(),
            "Server crashed"
        );
        process.crash(&cause).await;
        self.after_crash(&mut process, &cause);
        self.publish(&entry, &process);
    }

    /// Apply the restart policy to a server that just ended up `Crashed`.
    fn after_crash(&self, process: &mut ManagedProcess, cause: &CrashCause) {
        let name = process.name().to_string();
        let restart = process.spec.restart.clone();
        let restarts = process.restart_count();

        if !restart.should_restart(cause, restarts) {
            if cause.is_failure() {
                let reason = if restart.is_bounded() && restarts >= restart.max_restarts {
                    format!(
                        "{} after {} restarts (limit {})",
                        cause.describe(),
                        restarts,
                        restart.max_restarts
                    )
                } else {
                    cause.describe()
                };
                error!(server = %name, reason = %reason, "Server will not be restarted");
                self.ctx.emit(ComposerEvent::Fatal {
                    server: name,
                    reason,
                });
            }
            return;
        }

        let attempt = restarts + 1;
        let delay = restart.backoff(attempt);
        info!(server = %name, attempt, delay_ms = delay.as_millis() as u64, "Scheduling restart");
        self.ctx.emit(ComposerEvent::RestartScheduled {
            server: name.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let token = CancellationToken::new();
        process.pending_restart = Some(token.clone());
        let signals = self.signals.clone();
        let generation = process.generation();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = signals.send(SupervisorSignal::RestartDue { server: name, generation });
                }
            }
        });
    }

    async fn on_restart_due(&self, name: &str, generation: u64) {
        let Ok(entry) = self.entry(name) else {
            return;
        };
        let mut process = entry.process.lock().await;
        if process.state() != LifecycleState::Crashed || process.generation() != generation {
            return;
        }
        let Some(token) = process.pending_restart.take() else {
            return;
        };
        if token.is_cancelled() {
            return;
        }

        let attempt = process.bump_restart_count();
        info!(server = %name, attempt, "Restarting crashed server");
        if let Err(e) = process.launch(&self.signals).await {
            warn!(server = %name, attempt, error = %e, "Restart attempt failed");
            let cause = CrashCause::Handshake(e.to_string());
            if process.state() == LifecycleState::Crashed {
                self.after_crash(&mut process, &cause);
            }
        }
        self.publish(&entry, &process);
    }
}

async fn run_signals(
    supervisor: Weak<Supervisor>,
    mut rx: mpsc::UnboundedReceiver<SupervisorSignal>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            signal = rx.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        tokio::spawn(async move { supervisor.handle_signal(signal).await });
    }
    debug!("Supervisor signal loop stopped");
}
