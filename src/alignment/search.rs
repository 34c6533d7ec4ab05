//! Fine alignment search strategies driven by optical power feedback.
//!
//! Every probe is an absolute move followed by a power read. The cancellation
//! token is checked before and after each move and raced against the move
//! itself; a cancelled move is followed by an actuator `stop()` and no further
//! motion is issued.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::errors::HardwareError;
use super::traits::MotionActuator;
use super::types::{
    AlignmentParameters, AlignmentRun, Axis, Position, StopReason, MAX_SPIRAL_POINTS,
};

/// One search over a shared actuator, accumulating into an [`AlignmentRun`]
pub struct SearchContext<'a> {
    actuator: &'a dyn MotionActuator,
    params: &'a AlignmentParameters,
    cancel: &'a CancellationToken,
    pub run: AlignmentRun,
}

impl<'a> SearchContext<'a> {
    /// Sample the current position and power as the run's starting point
    pub async fn begin(
        actuator: &'a dyn MotionActuator,
        params: &'a AlignmentParameters,
        cancel: &'a CancellationToken,
    ) -> Result<SearchContext<'a>, HardwareError> {
        let position = actuator.position().await?;
        let power = actuator.power().await?;
        debug!(position = %position, power_dbm = power, "Fine alignment starting point");
        Ok(Self {
            actuator,
            params,
            cancel,
            run: AlignmentRun::start(position, power),
        })
    }

    fn cancelled(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            self.run.cancelled = true;
        }
        self.run.cancelled
    }

    /// Move to `target`, racing the move against cancellation.
    ///
    /// Returns false when the run was cancelled before, during or right after the move.
    async fn move_to(&mut self, target: Position) -> Result<bool, HardwareError> {
        if self.cancelled() {
            return Ok(false);
        }
        let actuator = self.actuator;
        tokio::select! {
            moved = actuator.move_absolute(target, self.params.fine_speed) => moved?,
            _ = self.cancel.cancelled() => {
                if let Err(e) = actuator.stop().await {
                    warn!(error = %e, "Failed to stop actuator after cancellation");
                }
                self.run.cancelled = true;
                return Ok(false);
            }
        }
        Ok(!self.cancelled())
    }

    /// Move, read power, record. `None` once cancelled.
    async fn probe(&mut self, target: Position) -> Result<Option<f64>, HardwareError> {
        if !self.move_to(target).await? {
            return Ok(None);
        }
        let position = self.actuator.position().await?;
        let power = self.actuator.power().await?;
        self.run.record(position, power);
        Ok(Some(power))
    }

    fn threshold_reached(&self, power: f64) -> bool {
        power >= self.params.optical_power_threshold_dbm
    }

    /// Return to the best sampled position and measure it.
    ///
    /// `None` when cancelled on the way.
    pub async fn settle_at_best(&mut self) -> Result<Option<(Position, f64)>, HardwareError> {
        if !self.move_to(self.run.best_position).await? {
            return Ok(None);
        }
        let position = self.actuator.position().await?;
        let power = self.actuator.power().await?;
        Ok(Some((position, power)))
    }
}

/// Coordinate search over the step schedule.
///
/// At each iteration every axis is probed at `+step` and, if that did not
/// improve, at `-step`; an improving probe is kept. An iteration gaining less
/// than `min_improvement_db` moves on to the next (smaller) step size, and
/// `convergence_window` such iterations in a row end the search.
pub async fn gradient_search(ctx: &mut SearchContext<'_>) -> Result<StopReason, HardwareError> {
    let params = ctx.params;
    let budget = params.max_iterations;
    let per_step = (budget / params.step_sizes_um.len() as u32).max(1);

    let mut current = ctx.run.best_position;
    let mut current_power = ctx.run.best_power_dbm;
    let mut iterations = 0u32;
    let mut stale = 0u32;

    if ctx.threshold_reached(current_power) {
        return Ok(StopReason::ThresholdReached);
    }

    for &step in &params.step_sizes_um {
        for _ in 0..per_step {
            if iterations >= budget {
                return Ok(StopReason::BudgetExhausted);
            }
            if ctx.cancelled() {
                return Ok(StopReason::Cancelled);
            }
            iterations += 1;
            ctx.run.iterations += 1;
            let before = current_power;

            for axis in Axis::ALL {
                for direction in [1.0, -1.0] {
                    let candidate = current.offset(axis, direction * step);
                    let Some(power) = ctx.probe(candidate).await? else {
                        return Ok(StopReason::Cancelled);
                    };
                    if power > current_power {
                        current = candidate;
                        current_power = power;
                        break;
                    }
                }
                if ctx.threshold_reached(current_power) {
                    debug!(iterations, power_dbm = current_power, "Power threshold reached");
                    return Ok(StopReason::ThresholdReached);
                }
            }

            if current_power - before < params.min_improvement_db {
                stale += 1;
                debug!(step_um = step, stale, "No meaningful gain at this step size");
                if stale >= params.convergence_window {
                    return Ok(StopReason::Converged);
                }
                break;
            }
            stale = 0;
        }
    }

    Ok(StopReason::ScheduleExhausted)
}

/// Archimedean spiral in the XY plane around the starting point:
/// `r = spiral_step * t`, `angle = spiral_angular_rate * t`, up to the max radius.
pub async fn spiral_search(ctx: &mut SearchContext<'_>) -> Result<StopReason, HardwareError> {
    let params = ctx.params;
    let center = ctx.run.best_position;

    if ctx.threshold_reached(ctx.run.best_power_dbm) {
        return Ok(StopReason::ThresholdReached);
    }

    let points = params.spiral_points().min(f64::from(MAX_SPIRAL_POINTS)) as u32;

    for i in 1..=points {
        if ctx.cancelled() {
            return Ok(StopReason::Cancelled);
        }
        let t = params.spiral_t_increment * f64::from(i);
        let radius = params.spiral_step_um * t;
        if radius > params.spiral_max_radius_um {
            break;
        }
        let angle = params.spiral_angular_rate * t;
        let target = center + Position::new(radius * angle.cos(), radius * angle.sin(), 0.0);

        ctx.run.iterations += 1;
        let Some(power) = ctx.probe(target).await? else {
            return Ok(StopReason::Cancelled);
        };
        if ctx.threshold_reached(power) {
            debug!(point = i, power_dbm = power, "Power threshold reached during spiral");
            return Ok(StopReason::ThresholdReached);
        }
    }

    Ok(StopReason::RadiusExhausted)
}

/// Spiral to find signal, then gradient refinement from the spiral's best point.
///
/// When the spiral never rises above the coarse power floor the search stops
/// with [`StopReason::BelowCoarseFloor`].
pub async fn combined_search(ctx: &mut SearchContext<'_>) -> Result<StopReason, HardwareError> {
    let spiral = spiral_search(ctx).await?;
    if spiral == StopReason::Cancelled {
        return Ok(spiral);
    }
    if ctx.run.best_power_dbm <= ctx.params.coarse_power_floor_dbm {
        debug!(
            best_power_dbm = ctx.run.best_power_dbm,
            spiral_stop = ?spiral,
            "Spiral found no usable signal"
        );
        return Ok(StopReason::BelowCoarseFloor);
    }
    gradient_search(ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::simulated::{SimulatedStage, SimulationConfig};

    fn stage(start: Position) -> SimulatedStage {
        SimulatedStage::new(SimulationConfig {
            start,
            beam_waist_um: 1.0,
            ..SimulationConfig::default()
        })
    }

    fn gradient_params() -> AlignmentParameters {
        AlignmentParameters {
            strategy: crate::alignment::SearchStrategy::Gradient,
            ..AlignmentParameters::default()
        }
    }

    async fn connected(stage: &SimulatedStage) {
        stage.connect().await.unwrap();
        stage.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn gradient_walks_to_peak() {
        let stage = stage(Position::new(1.0, -1.0, 0.5));
        connected(&stage).await;
        let params = gradient_params();
        let token = CancellationToken::new();

        let mut ctx = SearchContext::begin(&stage, &params, &token).await.unwrap();
        let stop = gradient_search(&mut ctx).await.unwrap();

        assert_eq!(stop, StopReason::ThresholdReached);
        assert_eq!(ctx.run.iterations, 2);
        assert!(ctx.run.best_position.distance_to(&Position::ORIGIN) < 1e-9);
    }

    #[tokio::test]
    async fn gradient_stops_on_convergence_when_threshold_is_unreachable() {
        let stage = stage(Position::new(0.3, 0.0, 0.0));
        connected(&stage).await;
        let params = AlignmentParameters {
            optical_power_threshold_dbm: 10.0,
            ..gradient_params()
        };
        let token = CancellationToken::new();

        let mut ctx = SearchContext::begin(&stage, &params, &token).await.unwrap();
        let stop = gradient_search(&mut ctx).await.unwrap();

        assert!(matches!(
            stop,
            StopReason::Converged | StopReason::ScheduleExhausted
        ));
        assert!(ctx.run.iterations <= params.max_iterations);
        assert!(ctx.run.best_position.distance_to(&Position::ORIGIN) <= 0.05 + 1e-9);
    }

    #[tokio::test]
    async fn spiral_finds_offset_peak() {
        let stage = stage(Position::new(1.2, 0.4, 0.0));
        connected(&stage).await;
        let params = AlignmentParameters {
            optical_power_threshold_dbm: -6.0,
            ..AlignmentParameters::default()
        };
        let token = CancellationToken::new();

        let mut ctx = SearchContext::begin(&stage, &params, &token).await.unwrap();
        let stop = spiral_search(&mut ctx).await.unwrap();

        assert_eq!(stop, StopReason::ThresholdReached);
        assert!(ctx.run.best_power_dbm >= -6.0);
    }

    #[tokio::test]
    async fn combined_reports_missing_signal() {
        let stage = SimulatedStage::new(SimulationConfig {
            start: Position::new(50.0, 50.0, 0.0),
            beam_waist_um: 1.0,
            ..SimulationConfig::default()
        });
        connected(&stage).await;
        let params = AlignmentParameters {
            spiral_max_radius_um: 2.0,
            ..AlignmentParameters::default()
        };
        let token = CancellationToken::new();

        let mut ctx = SearchContext::begin(&stage, &params, &token).await.unwrap();
        let stop = combined_search(&mut ctx).await.unwrap();
        assert_eq!(stop, StopReason::BelowCoarseFloor);
    }

    #[tokio::test]
    async fn pre_cancelled_search_issues_no_moves() {
        let stage = stage(Position::new(1.0, 1.0, 0.0));
        connected(&stage).await;
        let params = gradient_params();
        let token = CancellationToken::new();
        token.cancel();

        let mut ctx = SearchContext::begin(&stage, &params, &token).await.unwrap();
        let stop = gradient_search(&mut ctx).await.unwrap();

        assert_eq!(stop, StopReason::Cancelled);
        assert!(ctx.run.cancelled);
        assert_eq!(stage.move_count(), 0);
    }
}
