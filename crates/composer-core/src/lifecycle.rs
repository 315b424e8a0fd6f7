//! Lifecycle state machine shared by managed servers and translators.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed server or a translator session.
///
/// ```text
///  Stopped ──► Starting ──► Running ──► Stopping ──► Stopped
///                 │            │
///                 └──► Crashed ◄┘
///                        │
///                        └──► Starting   (policy restart or explicit start)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl LifecycleState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Crashed, Starting)
        )
    }

    /// `Starting` or `Running`.
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Running)
    }

    /// `Stopped` or `Crashed`.
    pub fn is_down(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Crashed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
