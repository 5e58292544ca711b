use std::fmt;

use serde::{Deserialize, Serialize};

/// How a launcher hosts the driver: in a separate local process or inside
/// the controller process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentKind {
    LocalProcess,
    InProcess,
}

/// What an agent launcher advertises about the workers it builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub launcher_name: String,
    pub kind: AgentKind,
}

impl AgentInfo {
    pub fn local_process(launcher_name: impl Into<String>) -> Self {
        Self {
            launcher_name: launcher_name.into(),
            kind: AgentKind::LocalProcess,
        }
    }
}

/// Lifecycle state of an agent record. Transitions are totally ordered per
/// agent: Launching → Ready ⇄ Running, Ready → Stopping → Dead, and any
/// state → Dead when process exit is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Launching,
    Ready,
    Running,
    Stopping,
    Dead,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Launching => "launching",
            AgentStatus::Ready => "ready",
            AgentStatus::Running => "running",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Dead => "dead",
        };
        f.write_str(label)
    }
}
