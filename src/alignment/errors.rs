use thiserror::Error;

use super::types::FeatureKind;

/// Failures reported by the motion stage, power meter or vision system
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HardwareError {
    #[error("Actuator is not connected")]
    NotConnected,

    #[error("Actuator is not initialized")]
    NotInitialized,

    #[error("Move rejected: {reason}")]
    MoveRejected { reason: String },

    #[error("Hardware communication failed: {message}")]
    Communication { message: String },

    #[error("Could not detect {feature}: {message}")]
    Detection {
        feature: FeatureKind,
        message: String,
    },
}

/// Errors that prevent an alignment run from starting at all
#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("Invalid alignment parameters: {message}")]
    InvalidParameters { message: String },

    #[error("Invalid simulation settings: {message}")]
    InvalidSimulation { message: String },

    #[error("Calibration file error: {0}")]
    CalibrationIo(#[from] std::io::Error),

    #[error("Calibration format error: {0}")]
    CalibrationFormat(#[from] serde_json::Error),
}

impl AlignmentError {
    pub fn invalid(message: impl Into<String>) -> Self {
        AlignmentError::InvalidParameters {
            message: message.into(),
        }
    }
}
