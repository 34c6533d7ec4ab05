//! Closed-loop fiber-to-waveguide alignment.
//!
//! A run is vision-guided coarse positioning followed by a power-feedback fine
//! search (gradient, spiral or both). Hardware is reached only through
//! [`MotionActuator`] and [`FeatureDetector`]; [`SimulatedStage`] implements
//! both for simulation runs and tests. [`AlignmentExecutor`] exposes the
//! controller as a workflow component.

pub mod calibration;
pub mod controller;
pub mod errors;
pub mod executor;
pub mod phase;
pub mod search;
pub mod simulated;
pub mod traits;
pub mod types;

pub use calibration::CalibrationProfile;
pub use controller::AlignmentController;
pub use errors::{AlignmentError, HardwareError};
pub use executor::{AlignmentExecutor, MODE_PARAMETER};
pub use phase::{AlignmentPhase, PhaseEvent};
pub use simulated::{SimulatedStage, SimulationConfig};
pub use traits::{FeatureDetector, MotionActuator};
pub use types::{
    AlignmentMode, AlignmentParameters, AlignmentReport, AlignmentRun, Axis, CoarseReport,
    Detection, FeatureKind, Position, SearchStrategy, StopReason, TrajectoryPoint,
    MAX_SPIRAL_POINTS,
};
