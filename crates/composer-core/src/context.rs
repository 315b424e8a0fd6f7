//! Settings and event sink threaded through every core constructor.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::observer::{ComposerEvent, EventSink};

/// Core-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Name reported to clients of the aggregate in `initialize`.
    pub name: String,
    /// Version reported to clients of the aggregate in `initialize`.
    pub version: String,
    /// Per-request timeout for calls to underlying servers.
    pub request_timeout_ms: u64,
    /// Time allowed for the `initialize` handshake.
    pub handshake_timeout_ms: u64,
    /// Grace period between SIGTERM and a forced kill.
    pub stop_grace_ms: u64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            name: "mcp-composer".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout_ms: 30_000,
            handshake_timeout_ms: 30_000,
            stop_grace_ms: 5_000,
        }
    }
}

impl CoreSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Shared context: settings plus the observer sink.
#[derive(Debug, Clone)]
pub struct CoreContext {
    pub settings: Arc<CoreSettings>,
    pub events: EventSink,
}

impl CoreContext {
    pub fn new(settings: CoreSettings, events: EventSink) -> Self {
        Self {
            settings: Arc::new(settings),
            events,
        }
    }

    /// Context whose events are discarded.
    pub fn detached(settings: CoreSettings) -> Self {
        Self::new(settings, EventSink::detached())
    }

    pub fn emit(&self, event: ComposerEvent) {
        self.events.emit(event);
    }
}
