// Process instance lifecycle states and the transitions allowed between them

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a process instance.
///
/// Serialized as `SCREAMING_SNAKE_CASE` strings when mirrored to a store;
/// everywhere else it stays a typed enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

/// Events that move an instance between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Start,
    Pause,
    Resume,
    Abort,
    Complete,
    Fail,
}

impl ProcessEvent {
    /// Verb used in transition errors
    pub fn action(&self) -> &'static str {
        match self {
            ProcessEvent::Start => "start",
            ProcessEvent::Pause => "pause",
            ProcessEvent::Resume => "resume",
            ProcessEvent::Abort => "abort",
            ProcessEvent::Complete => "complete",
            ProcessEvent::Fail => "fail",
        }
    }
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Aborted
        )
    }

    /// Returns the next state, or `None` if `event` is not allowed from `self`.
    pub fn apply(self, event: ProcessEvent) -> Option<ProcessState> {
        use ProcessEvent as E;
        use ProcessState as S;

        match (self, event) {
            (S::Pending, E::Start) => Some(S::Running),
            (S::Running, E::Pause) => Some(S::Paused),
            (S::Paused, E::Resume) => Some(S::Running),
            (S::Running, E::Complete) => Some(S::Completed),
            (S::Running, E::Fail) => Some(S::Failed),
            (state, E::Abort) if !state.is_terminal() => Some(S::Aborted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Pending => "PENDING",
            ProcessState::Running => "RUNNING",
            ProcessState::Paused => "PAUSED",
            ProcessState::Completed => "COMPLETED",
            ProcessState::Failed => "FAILED",
            ProcessState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
