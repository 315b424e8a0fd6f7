//! Observer interface for lifecycle, conflict and invocation events.
//!
//! The core never calls observers directly. Events go through an
//! [`EventSink`] (an unbounded channel, so emitting never suspends) and a
//! dispatcher task fans them out to every registered [`Observer`].

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::lifecycle::LifecycleState;
use crate::registry::ConflictRecord;

/// What kind of entity a lifecycle event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Subject {
    Server,
    Translator,
}

/// Outcome of one `invoke`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success,
    NotFound,
    Unavailable,
    Downstream,
    Failed,
}

/// Events emitted by the core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ComposerEvent {
    Lifecycle {
        subject: Subject,
        name: String,
        from: LifecycleState,
        to: LifecycleState,
        at: DateTime<Utc>,
    },
    ConflictResolved(ConflictRecord),
    Invocation {
        tool: String,
        server: Option<String>,
        duration_ms: u64,
        outcome: InvocationOutcome,
    },
    /// One stderr line from a child process.
    Diagnostic { server: String, line: String },
    TranslationError { origin: String, detail: String },
    HealthCheckFailed {
        server: String,
        consecutive: u32,
        reason: String,
    },
    ResourceLimitExceeded {
        server: String,
        detail: String,
        consecutive: u32,
    },
    RestartScheduled {
        server: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// A server crashed and its policy will not restart it again.
    Fatal { server: String, reason: String },
}

/// Receives core events. Called from the dispatcher task, never from the core.
pub trait Observer: Send + Sync + 'static {
    fn on_event(&self, event: &ComposerEvent);
}

/// Cheap, cloneable handle the core emits events through.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ComposerEvent>,
}

impl EventSink {
    /// A sink whose events go nowhere.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Fire-and-forget.
    pub fn emit(&self, event: ComposerEvent) {
        let _ = self.tx.send(event);
    }
}

/// Spawn the dispatcher task fanning events out to `observers`.
///
/// The task ends once every [`EventSink`] clone has been dropped.
pub fn spawn_dispatcher(observers: Vec<Arc<dyn Observer>>) -> (EventSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ComposerEvent>();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for observer in &observers {
                observer.on_event(&event);
            }
        }
        debug!("Observer dispatcher stopped");
    });
    (EventSink { tx }, handle)
}

/// Turns events into log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &ComposerEvent) {
        match event {
            ComposerEvent::Lifecycle {
                subject,
                name,
                from,
                to,
                ..
            } => {
                info!(subject = ?subject, name = %name, from = %from, to = %to, "Lifecycle transition");
            }
            ComposerEvent::ConflictResolved(record) => {
                info!(
                    kind = ?record.kind,
                    name = %record.origin_name,
                    servers = ?record.servers,
                    strategy = %record.strategy,
                    exposed = ?record.exposed,
                    "Name conflict resolved"
                );
            }
            ComposerEvent::Invocation {
                tool,
                server,
                duration_ms,
                outcome,
            } => {
                debug!(tool = %tool, server = ?server, duration_ms, outcome = ?outcome, "Invocation finished");
            }
            ComposerEvent::Diagnostic { server, line } => {
                debug!(server = %server, stderr = %line, "Server diagnostic");
            }
            ComposerEvent::TranslationError { origin, detail } => {
                warn!(origin = %origin, detail = %detail, "Translation error");
            }
            ComposerEvent::HealthCheckFailed {
                server,
                consecutive,
                reason,
            } => {
                warn!(server = %server, consecutive, reason = %reason, "Health check failed");
            }
            ComposerEvent::ResourceLimitExceeded {
                server,
                detail,
                consecutive,
            } => {
                warn!(server = %server, consecutive, detail = %detail, "Resource limit exceeded");
            }
            ComposerEvent::RestartScheduled {
                server,
                attempt,
                delay_ms,
            } => {
                info!(server = %server, attempt, delay_ms, "Restart scheduled");
            }
            ComposerEvent::Fatal { server, reason } => {
                error!(server = %server, reason = %reason, "Server will not be restarted");
            }
        }
    }
}

/// Keeps the most recent events in memory.
#[derive(Debug)]
pub struct MemoryObserver {
    capacity: usize,
    events: Mutex<VecDeque<ComposerEvent>>,
}

impl MemoryObserver {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Events currently held, oldest first.
    pub fn snapshot(&self) -> Vec<ComposerEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Observer for MemoryObserver {
    fn on_event(&self, event: &ComposerEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatcher_fans_out() {
        let first = Arc::new(MemoryObserver::new(16));
        let second = Arc::new(MemoryObserver::new(16));
        let (sink, handle) = spawn_dispatcher(vec![first.clone(), second.clone()]);

        sink.emit(ComposerEvent::Diagnostic {
            server: "a".into(),
            line: "hello".into(),
        });
        drop(sink);
        handle.await.unwrap();

        assert_eq!(first.snapshot().len(), 1);
        assert_eq!(second.snapshot().len(), 1);
    }

    #[test]
    fn test_detached_sink_never_fails() {
        let sink = EventSink::detached();
        sink.emit(ComposerEvent::Fatal {
            server: "a".into(),
            reason: "gone".into(),
        });
    }

    #[test]
    fn test_memory_observer_is_bounded() {
        let observer = MemoryObserver::new(2);
        for i in 0..5 {
            observer.on_event(&ComposerEvent::Diagnostic {
                server: "a".into(),
                line: i.to_string(),
            });
        }
        let events = observer.snapshot();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], ComposerEvent::Diagnostic { line, .. } if line == "4"));
    }

    #[test]
    fn test_event_serialization() {
        let event = ComposerEvent::RestartScheduled {
            server: "a".into(),
            attempt: 2,
            delay_ms: 2000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "restart_scheduled");
        assert_eq!(json["attempt"], 2);
    }
}
