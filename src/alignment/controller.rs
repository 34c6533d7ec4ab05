//! Closed-loop alignment controller: vision-guided coarse positioning followed
//! by power-feedback fine search.
//!
//! Hardware faults during a run never escape as errors; they end the run with
//! a failed [`AlignmentReport`] carrying the diagnostic. Only invalid
//! parameters are rejected up front.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use super::calibration::CalibrationProfile;
use super::errors::{AlignmentError, HardwareError};
use super::phase::{PhaseEvent, PhaseTracker};
use super::search::{combined_search, gradient_search, spiral_search, SearchContext};
use super::traits::{FeatureDetector, MotionActuator};
use super::types::{
    AlignmentMode, AlignmentParameters, AlignmentReport, AlignmentRun, CoarseReport, FeatureKind,
    Position, SearchStrategy, StopReason,
};
use crate::telemetry::create_alignment_span;

/// Corrected coarse moves shorter than this are skipped
const ZERO_MOVE_EPSILON_UM: f64 = 1e-9;

pub struct AlignmentController {
    actuator: Arc<dyn MotionActuator>,
    detector: Arc<dyn FeatureDetector>,
    calibration: CalibrationProfile,
    ready: AtomicBool,
}

/// Result of the fine phase before it is folded into a report
struct FineOutcome {
    stop: StopReason,
    run: Option<AlignmentRun>,
    settled: Option<(Position, f64)>,
    fault: Option<HardwareError>,
}

impl FineOutcome {
    fn fault(error: HardwareError, run: Option<AlignmentRun>) -> Self {
        Self {
            stop: StopReason::HardwareFault,
            run,
            settled: None,
            fault: Some(error),
        }
    }

    fn cancelled(run: AlignmentRun) -> Self {
        Self {
            stop: StopReason::Cancelled,
            run: Some(run),
            settled: None,
            fault: None,
        }
    }
}

impl AlignmentController {
    pub fn new(
        actuator: Arc<dyn MotionActuator>,
        detector: Arc<dyn FeatureDetector>,
        calibration: CalibrationProfile,
    ) -> Self {
        Self {
            actuator,
            detector,
            calibration,
            ready: AtomicBool::new(false),
        }
    }

    pub fn calibration(&self) -> &CalibrationProfile {
        &self.calibration
    }

    /// Coarse then fine alignment
    pub async fn align(
        &self,
        params: &AlignmentParameters,
        cancel: CancellationToken,
    ) -> Result<AlignmentReport, AlignmentError> {
        self.run(AlignmentMode::Full, params, cancel).await
    }

    pub async fn run(
        &self,
        mode: AlignmentMode,
        params: &AlignmentParameters,
        cancel: CancellationToken,
    ) -> Result<AlignmentReport, AlignmentError> {
        params.validate()?;
        let span = create_alignment_span(params.strategy.as_str(), None);
        Ok(self.run_phases(mode, params, &cancel).instrument(span).await)
    }

    async fn run_phases(
        &self,
        mode: AlignmentMode,
        params: &AlignmentParameters,
        cancel: &CancellationToken,
    ) -> AlignmentReport {
        let mut report = ReportBuilder::new(mode, params.strategy);
        info!(mode = ?mode, strategy = %params.strategy, "Alignment run started");

        if cancel.is_cancelled() {
            return report.cancelled(None);
        }
        if let Err(e) = self.ensure_ready().await {
            return report.failed(StopReason::HardwareFault, None, e.to_string());
        }

        if mode != AlignmentMode::Fine {
            report.phase.advance(PhaseEvent::BeginCoarse);
            let coarse = self.coarse_align(params, cancel).await;
            report.coarse = Some(coarse.clone());

            if coarse.cancelled {
                return report.cancelled(None);
            }
            if !coarse.success {
                let message = coarse
                    .message
                    .unwrap_or_else(|| "Coarse alignment failed".to_string());
                return report.failed(StopReason::CoarseFailed, None, message);
            }
            if mode == AlignmentMode::Coarse {
                let position = self.actuator.position().await.ok();
                return report.succeeded(
                    StopReason::CoarseComplete,
                    None,
                    position.zip(coarse.power_dbm),
                );
            }
        }

        report.phase.advance(PhaseEvent::BeginFine);
        let fine = self.fine_align(params, cancel).await;

        if let Some(fault) = fine.fault {
            warn!(error = %fault, "Fine alignment aborted by hardware fault");
            return report.failed(StopReason::HardwareFault, fine.run, fault.to_string());
        }
        if fine.stop == StopReason::Cancelled {
            return report.cancelled(fine.run);
        }

        let best_power = fine.run.as_ref().map(|r| r.best_power_dbm);
        let Some((position, power)) = fine.settled else {
            return report.failed(fine.stop, fine.run, "No settled position".to_string());
        };

        if fine.stop == StopReason::BelowCoarseFloor {
            let message = format!(
                "Spiral search found no signal above {:.1} dBm (best {:.2} dBm)",
                params.coarse_power_floor_dbm,
                best_power.unwrap_or(power)
            );
            return report.failed_at(fine.stop, fine.run, (position, power), message);
        }
        if power < params.optical_power_threshold_dbm {
            let message = format!(
                "Fine alignment stopped ({:?}) at {power:.2} dBm, below the {:.1} dBm threshold",
                fine.stop, params.optical_power_threshold_dbm
            );
            return report.failed_at(fine.stop, fine.run, (position, power), message);
        }

        report.succeeded(fine.stop, fine.run, Some((position, power)))
    }

    async fn ensure_ready(&self) -> Result<(), HardwareError> {
        if self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.actuator.connect().await?;
        self.actuator.initialize().await?;
        self.ready.store(true, Ordering::SeqCst);
        info!("Actuator connected and initialized");
        Ok(())
    }

    /// Detect both features, apply calibration and make one relative move
    pub async fn coarse_align(
        &self,
        params: &AlignmentParameters,
        cancel: &CancellationToken,
    ) -> CoarseReport {
        let started = Instant::now();
        let mut report = CoarseReport {
            success: false,
            fiber: None,
            waveguide: None,
            correction: None,
            moved: false,
            power_dbm: None,
            cancelled: false,
            message: None,
            duration_ms: 0,
        };

        if let Err(e) = self.coarse_steps(params, cancel, &mut report).await {
            report.success = false;
            report.message = Some(e.to_string());
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        if report.success {
            info!(power_dbm = ?report.power_dbm, moved = report.moved, "Coarse alignment succeeded");
        } else {
            warn!(message = ?report.message, cancelled = report.cancelled, "Coarse alignment did not succeed");
        }
        report
    }

    async fn coarse_steps(
        &self,
        params: &AlignmentParameters,
        cancel: &CancellationToken,
        report: &mut CoarseReport,
    ) -> Result<(), HardwareError> {
        let fiber = self.detector.detect(FeatureKind::Fiber).await?;
        report.fiber = Some(fiber);
        let waveguide = self.detector.detect(FeatureKind::Waveguide).await?;
        report.waveguide = Some(waveguide);

        let weakest = fiber.confidence.min(waveguide.confidence);
        if weakest < params.min_detection_confidence {
            report.message = Some(format!(
                "Detection confidence {weakest:.2} below minimum {:.2}",
                params.min_detection_confidence
            ));
            return Ok(());
        }

        let correction = self.calibration.apply(waveguide.position - fiber.position);
        report.correction = Some(correction);

        if correction.magnitude() > ZERO_MOVE_EPSILON_UM {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            tokio::select! {
                moved = self.actuator.move_relative(correction, params.coarse_speed) => moved?,
                _ = cancel.cancelled() => {
                    if let Err(e) = self.actuator.stop().await {
                        warn!(error = %e, "Failed to stop actuator after cancellation");
                    }
                    report.cancelled = true;
                    return Ok(());
                }
            }
            report.moved = true;
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(());
        }

        let power = self.actuator.power().await?;
        report.power_dbm = Some(power);
        report.success = power > params.coarse_power_floor_dbm;
        if !report.success {
            report.message = Some(format!(
                "Power {power:.2} dBm not above coarse floor {:.1} dBm",
                params.coarse_power_floor_dbm
            ));
        }
        Ok(())
    }

    async fn fine_align(
        &self,
        params: &AlignmentParameters,
        cancel: &CancellationToken,
    ) -> FineOutcome {
        let mut ctx = match SearchContext::begin(self.actuator.as_ref(), params, cancel).await {
            Ok(ctx) => ctx,
            Err(e) => return FineOutcome::fault(e, None),
        };

        let searched = match params.strategy {
            SearchStrategy::Gradient => gradient_search(&mut ctx).await,
            SearchStrategy::Spiral => spiral_search(&mut ctx).await,
            SearchStrategy::Combined => combined_search(&mut ctx).await,
        };
        let stop = match searched {
            Ok(stop) => stop,
            Err(e) => return FineOutcome::fault(e, Some(ctx.run)),
        };
        if stop == StopReason::Cancelled || ctx.run.cancelled {
            return FineOutcome::cancelled(ctx.run);
        }

        let settled = match ctx.settle_at_best().await {
            Ok(Some(settled)) => settled,
            Ok(None) => return FineOutcome::cancelled(ctx.run),
            Err(e) => return FineOutcome::fault(e, Some(ctx.run)),
        };
        info!(
            stop = ?stop,
            iterations = ctx.run.iterations,
            position = %settled.0,
            power_dbm = settled.1,
            "Fine alignment finished"
        );

        FineOutcome {
            stop,
            run: Some(ctx.run),
            settled: Some(settled),
            fault: None,
        }
    }
}

/// Accumulates report fields across phases
struct ReportBuilder {
    mode: AlignmentMode,
    strategy: SearchStrategy,
    started: Instant,
    phase: PhaseTracker,
    coarse: Option<CoarseReport>,
}

impl ReportBuilder {
    fn new(mode: AlignmentMode, strategy: SearchStrategy) -> Self {
        Self {
            mode,
            strategy,
            started: Instant::now(),
            phase: PhaseTracker::new(),
            coarse: None,
        }
    }

    fn build(
        self,
        success: bool,
        stop_reason: StopReason,
        run: Option<AlignmentRun>,
        settled: Option<(Position, f64)>,
        message: Option<String>,
    ) -> AlignmentReport {
        let (iterations, trajectory, best) = match run {
            Some(run) => (
                run.iterations,
                run.trajectory,
                Some((run.best_position, run.best_power_dbm)),
            ),
            None => (0, Vec::new(), None),
        };
        // Without a settled reading, report the best point sampled so far
        let (final_position, final_power_dbm) = settled.or(best).unzip();

        let report = AlignmentReport {
            success,
            cancelled: stop_reason == StopReason::Cancelled,
            phase: self.phase.current(),
            mode: self.mode,
            strategy: self.strategy,
            stop_reason,
            final_position,
            final_power_dbm,
            iterations,
            trajectory,
            coarse: self.coarse,
            message,
            duration_ms: self.started.elapsed().as_millis() as u64,
        };
        info!(
            success = report.success,
            phase = %report.phase,
            stop_reason = ?report.stop_reason,
            iterations = report.iterations,
            final_power_dbm = ?report.final_power_dbm,
            "Alignment run finished"
        );
        report
    }

    fn succeeded(
        mut self,
        stop: StopReason,
        run: Option<AlignmentRun>,
        settled: Option<(Position, f64)>,
    ) -> AlignmentReport {
        self.phase.advance(PhaseEvent::Converged);
        self.build(true, stop, run, settled, None)
    }

    fn failed(
        mut self,
        stop: StopReason,
        run: Option<AlignmentRun>,
        message: String,
    ) -> AlignmentReport {
        self.phase.advance(PhaseEvent::Failed);
        self.build(false, stop, run, None, Some(message))
    }

    fn failed_at(
        mut self,
        stop: StopReason,
        run: Option<AlignmentRun>,
        settled: (Position, f64),
        message: String,
    ) -> AlignmentReport {
        self.phase.advance(PhaseEvent::Failed);
        self.build(false, stop, run, Some(settled), Some(message))
    }

    fn cancelled(mut self, run: Option<AlignmentRun>) -> AlignmentReport {
        self.phase.advance(PhaseEvent::Cancelled);
        self.build(
            false,
            StopReason::Cancelled,
            run,
            None,
            Some("Alignment cancelled".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::phase::AlignmentPhase;
    use crate::alignment::simulated::{SimulatedStage, SimulationConfig};
    use crate::alignment::traits::{MockFeatureDetector, MockMotionActuator};
    use crate::alignment::types::Detection;

    fn detector_at(fiber: Position, waveguide: Position, confidence: f64) -> MockFeatureDetector {
        let mut detector = MockFeatureDetector::new();
        detector.expect_detect().returning(move |feature| {
            let position = match feature {
                FeatureKind::Fiber => fiber,
                FeatureKind::Waveguide => waveguide,
            };
            Ok(Detection {
                position,
                confidence,
            })
        });
        detector
    }

    fn ready_actuator() -> MockMotionActuator {
        let mut actuator = MockMotionActuator::new();
        actuator.expect_connect().returning(|| Ok(()));
        actuator.expect_initialize().returning(|| Ok(()));
        actuator
    }

    #[tokio::test]
    async fn low_confidence_detection_fails_coarse_without_moving() {
        let mut actuator = ready_actuator();
        actuator.expect_move_relative().times(0);
        let detector = detector_at(Position::ORIGIN, Position::new(5.0, 0.0, 0.0), 0.2);

        let controller = AlignmentController::new(
            Arc::new(actuator),
            Arc::new(detector),
            CalibrationProfile::default(),
        );
        let report = controller
            .align(&AlignmentParameters::default(), CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.phase, AlignmentPhase::Failed);
        assert_eq!(report.stop_reason, StopReason::CoarseFailed);
        assert!(report.message.unwrap().contains("confidence"));
    }

    #[tokio::test]
    async fn coincident_features_skip_the_move() {
        let stage = Arc::new(SimulatedStage::new(SimulationConfig {
            start: Position::new(0.2, 0.0, 0.0),
            ..SimulationConfig::default()
        }));
        let spot = Position::new(0.2, 0.0, 0.0);
        let controller = AlignmentController::new(
            stage.clone(),
            Arc::new(detector_at(spot, spot, 0.9)),
            CalibrationProfile::default(),
        );

        let report = controller
            .run(
                AlignmentMode::Coarse,
                &AlignmentParameters::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let coarse = report.coarse.unwrap();
        assert!(!coarse.moved);
        assert_eq!(stage.move_count(), 0);
        assert!(coarse.success);
        assert_eq!(report.phase, AlignmentPhase::Aligned);
    }

    #[tokio::test]
    async fn coincident_features_far_from_signal_fail_on_power() {
        let far = Position::new(40.0, 0.0, 0.0);
        let stage = Arc::new(SimulatedStage::new(SimulationConfig {
            start: far,
            ..SimulationConfig::default()
        }));
        let controller = AlignmentController::new(
            stage.clone(),
            Arc::new(detector_at(far, far, 0.9)),
            CalibrationProfile::default(),
        );

        let report = controller
            .align(&AlignmentParameters::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stage.move_count(), 0);
        assert!(!report.success);
        assert_eq!(report.stop_reason, StopReason::CoarseFailed);
        assert!(report.coarse.unwrap().message.unwrap().contains("coarse floor"));
    }

    #[tokio::test]
    async fn calibration_corrects_the_coarse_move() {
        let mut actuator = ready_actuator();
        actuator
            .expect_move_relative()
            .withf(|delta, speed| {
                delta.distance_to(&Position::new(2.0, 0.0, 0.0)) < 1e-9 && *speed == 1.0
            })
            .times(1)
            .returning(|_, _| Ok(()));
        actuator.expect_power().returning(|| Ok(-12.0));
        actuator
            .expect_position()
            .returning(|| Ok(Position::new(2.0, 0.0, 0.0)));

        let calibration = CalibrationProfile {
            scale: Position::new(2.0, 1.0, 1.0),
            ..CalibrationProfile::default()
        };
        let controller = AlignmentController::new(
            Arc::new(actuator),
            Arc::new(detector_at(Position::ORIGIN, Position::new(1.0, 0.0, 0.0), 0.9)),
            calibration,
        );

        let report = controller
            .run(
                AlignmentMode::Coarse,
                &AlignmentParameters::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.final_power_dbm, Some(-12.0));
    }

    #[tokio::test]
    async fn power_meter_fault_fails_the_run() {
        let mut actuator = ready_actuator();
        actuator.expect_position().returning(|| Ok(Position::ORIGIN));
        actuator.expect_power().returning(|| {
            Err(HardwareError::Communication {
                message: "power meter timeout".into(),
            })
        });

        let controller = AlignmentController::new(
            Arc::new(actuator),
            Arc::new(detector_at(Position::ORIGIN, Position::ORIGIN, 0.9)),
            CalibrationProfile::default(),
        );
        let report = controller
            .run(
                AlignmentMode::Fine,
                &AlignmentParameters::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.stop_reason, StopReason::HardwareFault);
        assert!(report.message.unwrap().contains("power meter timeout"));
    }

    #[tokio::test]
    async fn invalid_parameters_are_rejected_up_front() {
        let controller = AlignmentController::new(
            Arc::new(MockMotionActuator::new()),
            Arc::new(MockFeatureDetector::new()),
            CalibrationProfile::default(),
        );
        let params = AlignmentParameters {
            max_iterations: 0,
            ..AlignmentParameters::default()
        };
        let err = controller
            .align(&params, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AlignmentError::InvalidParameters { .. }));
    }
}
