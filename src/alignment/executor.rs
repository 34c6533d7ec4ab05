// Workflow component wrapping the alignment controller

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::controller::AlignmentController;
use super::errors::AlignmentError;
use super::types::{AlignmentMode, AlignmentParameters};
use crate::workflow::{ComponentExecutor, ExecutionError, StepParameters};

/// Step parameter selecting full, coarse or fine alignment
pub const MODE_PARAMETER: &str = "mode";

/// Runs one alignment per step invocation.
///
/// Step parameters override the configured defaults key by key. Runs are
/// serialized since the controller owns a single physical stage.
pub struct AlignmentExecutor {
    controller: Mutex<AlignmentController>,
    defaults: AlignmentParameters,
}

impl AlignmentExecutor {
    pub fn new(controller: AlignmentController, defaults: AlignmentParameters) -> Self {
        Self {
            controller: Mutex::new(controller),
            defaults,
        }
    }

    fn mode(parameters: &StepParameters) -> Result<AlignmentMode, ExecutionError> {
        match parameters.get(MODE_PARAMETER) {
            None => Ok(AlignmentMode::Full),
            Some(Value::String(mode)) => mode.parse().map_err(invalid),
            Some(other) => Err(ExecutionError::InvalidParameters {
                message: format!("'{MODE_PARAMETER}' must be a string, got {other}"),
            }),
        }
    }
}

fn invalid(error: AlignmentError) -> ExecutionError {
    ExecutionError::InvalidParameters {
        message: error.to_string(),
    }
}

#[async_trait]
impl ComponentExecutor for AlignmentExecutor {
    async fn execute(
        &self,
        parameters: &StepParameters,
        cancel: CancellationToken,
    ) -> Result<Value, ExecutionError> {
        let mode = Self::mode(parameters)?;
        let params = self
            .defaults
            .with_overrides(parameters, &[MODE_PARAMETER])
            .map_err(invalid)?;

        let controller = tokio::select! {
            guard = self.controller.lock() => guard,
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
        };
        debug!(mode = ?mode, "Alignment step acquired the stage");
        let report = controller.run(mode, &params, cancel).await.map_err(invalid)?;
        drop(controller);

        if report.cancelled {
            return Err(ExecutionError::Cancelled);
        }
        if !report.success {
            let reason = report
                .message
                .clone()
                .unwrap_or_else(|| "no diagnostic".to_string());
            return Err(ExecutionError::failed(format!(
                "Alignment failed ({:?}): {reason}",
                report.stop_reason
            )));
        }
        serde_json::to_value(&report).map_err(|e| ExecutionError::failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::alignment::calibration::CalibrationProfile;
    use crate::alignment::simulated::{SimulatedStage, SimulationConfig};
    use crate::alignment::types::Position;

    fn executor(start: Position) -> AlignmentExecutor {
        let stage = Arc::new(SimulatedStage::new(SimulationConfig {
            start,
            beam_waist_um: 1.0,
            ..SimulationConfig::default()
        }));
        let controller =
            AlignmentController::new(stage.clone(), stage, CalibrationProfile::default());
        AlignmentExecutor::new(controller, AlignmentParameters::default())
    }

    #[tokio::test]
    async fn successful_run_returns_the_report() {
        let exec = executor(Position::new(1.0, -1.0, 0.5));
        let mut params = StepParameters::new();
        params.insert("strategy".into(), Value::from("gradient"));

        let output = exec
            .execute(&params, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output["success"], true);
        assert_eq!(output["phase"], "ALIGNED");
    }

    #[tokio::test]
    async fn unknown_parameter_is_invalid() {
        let exec = executor(Position::ORIGIN);
        let mut params = StepParameters::new();
        params.insert("laser_power".into(), Value::from(3));

        let err = exec
            .execute(&params, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn bad_mode_is_invalid() {
        let exec = executor(Position::ORIGIN);
        let mut params = StepParameters::new();
        params.insert(MODE_PARAMETER.into(), Value::from("sideways"));

        let err = exec
            .execute(&params, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn cancelled_token_maps_to_cancelled() {
        let exec = executor(Position::new(1.0, 1.0, 0.0));
        let token = CancellationToken::new();
        token.cancel();

        let err = exec.execute(&StepParameters::new(), token).await.unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled);
    }
}
