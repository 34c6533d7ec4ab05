// Error taxonomy for the process orchestration engine

use std::fmt;

use thiserror::Error;

use super::executor::ExecutionError;
use super::persistence::PersistenceError;
use super::state::ProcessState;

/// The kind of resource a lookup failed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Template,
    Instance,
    Component,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Template => write!(f, "Workflow template"),
            ResourceKind::Instance => write!(f, "Process instance"),
            ResourceKind::Component => write!(f, "Component"),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Malformed or cyclic template, rejected before anything executes
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    #[error("Invalid state transition: cannot {action} process {instance_id} while {from}")]
    InvalidStateTransition {
        instance_id: String,
        from: ProcessState,
        action: &'static str,
    },

    #[error("Step '{step_id}' timed out after {timeout_ms}ms")]
    Timeout { step_id: String, timeout_ms: u64 },

    #[error("Step '{step_id}' failed: {source}")]
    Execution {
        step_id: String,
        #[source]
        source: ExecutionError,
    },

    #[error(
        "Process {instance_id} stalled: no executable steps, waiting on [{}] blocked by failed [{}]",
        .waiting.join(", "),
        .blocked_by.join(", ")
    )]
    Stalled {
        instance_id: String,
        waiting: Vec<String>,
        blocked_by: Vec<String>,
    },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl WorkflowError {
    pub fn validation(message: impl Into<String>) -> Self {
        WorkflowError::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        WorkflowError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_resource() {
        let err = WorkflowError::not_found(ResourceKind::Template, "tpl-1");
        assert_eq!(err.to_string(), "Workflow template not found: tpl-1");
    }

    #[test]
    fn stalled_lists_waiting_steps() {
        let err = WorkflowError::Stalled {
            instance_id: "p1".to_string(),
            waiting: vec!["b".to_string(), "c".to_string()],
            blocked_by: vec!["a".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Process p1 stalled: no executable steps, waiting on [b, c] blocked by failed [a]"
        );
    }

    #[test]
    fn invalid_transition_reports_current_state() {
        let err = WorkflowError::InvalidStateTransition {
            instance_id: "p1".to_string(),
            from: ProcessState::Completed,
            action: "start",
        };
        assert!(err.to_string().contains("cannot start process p1 while COMPLETED"));
    }
}
