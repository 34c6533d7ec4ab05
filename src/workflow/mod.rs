// Process orchestration engine: DAG templates, instance lifecycle and step dispatch

pub mod errors;
pub mod executor;
pub mod graph;
mod instance_task;
pub mod manager;
pub mod persistence;
pub mod scheduler;
pub mod state;
mod step_runner;
pub mod types;

pub use errors::{ResourceKind, Result, WorkflowError};
pub use executor::{ComponentExecutor, ComponentRegistry, ExecutionError};
pub use graph::StepGraph;
pub use manager::WorkflowManager;
pub use persistence::{
    InMemoryProcessStore, JsonFileProcessStore, PersistReason, PersistenceError, ProcessStore,
};
pub use scheduler::{next_decision, ScheduleDecision};
pub use state::{ProcessEvent, ProcessState};
pub use types::{
    InstanceId, Metadata, ProcessInstance, ProcessStep, StepError, StepErrorKind, StepParameters,
    StepResult, StepStatus, WorkflowTemplate,
};
