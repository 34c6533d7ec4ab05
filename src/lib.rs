// Optiline - optical packaging process orchestration and active alignment
// This exposes the core components for the CLI, stations and integration tests

pub mod alignment;
pub mod config;
pub mod shutdown;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use alignment::{
    AlignmentController, AlignmentExecutor, AlignmentParameters, AlignmentReport,
    CalibrationProfile, SimulatedStage,
};
pub use config::{config, init_config, OptilineConfig};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflow::{
    ComponentExecutor, ProcessInstance, ProcessState, WorkflowError, WorkflowManager,
    WorkflowTemplate,
};
