//! Shell session state machine
//!
//! `Created → Starting → Running → Stopping → Stopped`. `Stopped` is terminal;
//! a start failure moves straight from `Starting` to `Stopped`.

use serde::{Deserialize, Serialize};

/// Possible states of a persistent shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellState {
    /// Constructed, no process yet
    Created,

    /// Pty allocated, shell spawning
    Starting,

    /// Shell alive and reader loop active
    Running,

    /// Termination in progress
    Stopping,

    /// Process gone, pty closed
    Stopped,
}

impl ShellState {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShellState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ShellState::Running)
    }

    /// Whether `stop` has work to do from this state
    pub fn is_stoppable(&self) -> bool {
        matches!(self, ShellState::Starting | ShellState::Running)
    }

    /// Get display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            ShellState::Created => "created",
            ShellState::Starting => "starting",
            ShellState::Running => "running",
            ShellState::Stopping => "stopping",
            ShellState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ShellState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ShellState::Stopped.is_terminal());
        assert!(!ShellState::Stopping.is_terminal());
        assert!(ShellState::Running.is_running());
        assert!(ShellState::Starting.is_stoppable());
        assert!(!ShellState::Created.is_stoppable());
        assert!(!ShellState::Stopped.is_stoppable());
    }

    #[test]
    fn test_display() {
        assert_eq!(ShellState::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&ShellState::Stopping).unwrap(),
            "\"stopping\""
        );
    }
}
