// In-memory stage, power meter and vision system for simulation runs and tests

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::errors::{AlignmentError, HardwareError};
use super::traits::{FeatureDetector, MotionActuator};
use super::types::{Detection, FeatureKind, Position};

/// 10 * log10(e) * 2: dB drop per unit of (distance / waist)^2 for a Gaussian mode
const GAUSSIAN_DB_PER_WAIST_SQ: f64 = 8.685_889_638;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Where the stage starts
    pub start: Position,
    /// Position of peak coupling
    pub optimum: Position,
    pub peak_power_dbm: f64,
    /// Mode field radius in microns
    pub beam_waist_um: f64,
    /// Uniform noise amplitude added to each reading
    pub noise_db: f64,
    /// Reading never drops below this level
    pub power_floor_dbm: f64,
    /// Travel speed at speed factor 1.0; zero means moves are instant
    pub velocity_um_per_s: f64,
    pub max_move_secs: f64,
    /// Error of the vision system's waveguide estimate
    pub vision_error: Position,
    pub detection_confidence: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start: Position::ORIGIN,
            optimum: Position::ORIGIN,
            peak_power_dbm: -2.0,
            beam_waist_um: 2.0,
            noise_db: 0.0,
            power_floor_dbm: -60.0,
            velocity_um_per_s: 0.0,
            max_move_secs: 5.0,
            vision_error: Position::ORIGIN,
            detection_confidence: 0.95,
        }
    }
}

impl SimulationConfig {
    /// Reject settings the stage model cannot run with
    pub fn validate(&self) -> Result<(), AlignmentError> {
        let invalid = |message: String| Err(AlignmentError::InvalidSimulation { message });

        for (name, position) in [
            ("start", self.start),
            ("optimum", self.optimum),
            ("vision_error", self.vision_error),
        ] {
            if !(position.x.is_finite() && position.y.is_finite() && position.z.is_finite()) {
                return invalid(format!("{name} must be finite, got {position}"));
            }
        }
        if !self.peak_power_dbm.is_finite() || !self.power_floor_dbm.is_finite() {
            return invalid("power levels must be finite".to_string());
        }
        if !self.beam_waist_um.is_finite() || self.beam_waist_um <= 0.0 {
            return invalid(format!("beam_waist_um must be positive, got {}", self.beam_waist_um));
        }
        for (name, value) in [
            ("noise_db", self.noise_db),
            ("velocity_um_per_s", self.velocity_um_per_s),
            ("max_move_secs", self.max_move_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be finite and non-negative, got {value}"));
            }
        }
        if !(0.0..=1.0).contains(&self.detection_confidence) {
            return invalid(format!(
                "detection_confidence must be between 0 and 1, got {}",
                self.detection_confidence
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct StageState {
    position: Position,
    connected: bool,
    initialized: bool,
}

/// Simulated motion stage with a Gaussian coupling model.
///
/// Also acts as the vision system: the fiber is detected at the current stage
/// position and the waveguide at the optimum plus `vision_error`.
#[derive(Debug)]
pub struct SimulatedStage {
    config: SimulationConfig,
    state: Mutex<StageState>,
    moves: AtomicU64,
    stops: AtomicU64,
}

impl SimulatedStage {
    pub fn new(config: SimulationConfig) -> Self {
        let state = StageState {
            position: config.start,
            connected: false,
            initialized: false,
        };
        Self {
            config,
            state: Mutex::new(state),
            moves: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Noise-free coupled power at `position`
    pub fn power_at(&self, position: Position) -> f64 {
        let d2 = {
            let d = position - self.config.optimum;
            d.x * d.x + d.y * d.y + d.z * d.z
        };
        let waist = self.config.beam_waist_um.max(f64::EPSILON);
        let power = self.config.peak_power_dbm - GAUSSIAN_DB_PER_WAIST_SQ * d2 / (waist * waist);
        power.max(self.config.power_floor_dbm)
    }

    /// Completed moves so far
    pub fn move_count(&self) -> u64 {
        self.moves.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    fn travel_time(&self, distance: f64, speed: f64) -> Duration {
        if self.config.velocity_um_per_s <= 0.0 || distance <= 0.0 {
            return Duration::ZERO;
        }
        let seconds = distance / (self.config.velocity_um_per_s * speed.max(0.01));
        Duration::try_from_secs_f64(seconds.min(self.config.max_move_secs)).unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
impl MotionActuator for SimulatedStage {
    async fn connect(&self) -> Result<(), HardwareError> {
        self.state.lock().await.connected = true;
        debug!("Simulated stage connected");
        Ok(())
    }

    async fn initialize(&self) -> Result<(), HardwareError> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(HardwareError::NotConnected);
        }
        state.initialized = true;
        Ok(())
    }

    async fn move_relative(&self, delta: Position, speed: f64) -> Result<(), HardwareError> {
        let current = self.position().await?;
        self.move_absolute(current + delta, speed).await
    }

    async fn move_absolute(&self, target: Position, speed: f64) -> Result<(), HardwareError> {
        let travel = {
            let state = self.state.lock().await;
            if !state.connected {
                return Err(HardwareError::NotConnected);
            }
            if !state.initialized {
                return Err(HardwareError::NotInitialized);
            }
            if !(target.x.is_finite() && target.y.is_finite() && target.z.is_finite()) {
                return Err(HardwareError::MoveRejected {
                    reason: format!("non-finite target {target}"),
                });
            }
            self.travel_time(state.position.distance_to(&target), speed)
        };

        // Dropping this future mid-travel leaves the stage where it was
        if !travel.is_zero() {
            tokio::time::sleep(travel).await;
        }

        self.state.lock().await.position = target;
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn position(&self) -> Result<Position, HardwareError> {
        let state = self.state.lock().await;
        if !state.connected {
            return Err(HardwareError::NotConnected);
        }
        Ok(state.position)
    }

    async fn power(&self) -> Result<f64, HardwareError> {
        let position = self.position().await?;
        let mut power = self.power_at(position);
        if self.config.noise_db > 0.0 && self.config.noise_db.is_finite() {
            let noise = self.config.noise_db;
            power += rand::rng().random_range(-noise..=noise);
        }
        Ok(power.max(self.config.power_floor_dbm))
    }

    async fn stop(&self) -> Result<(), HardwareError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated stage stopped");
        Ok(())
    }
}

#[async_trait]
impl FeatureDetector for SimulatedStage {
    async fn detect(&self, feature: FeatureKind) -> Result<Detection, HardwareError> {
        if self.config.detection_confidence <= 0.0 {
            return Err(HardwareError::Detection {
                feature,
                message: "no match in field of view".to_string(),
            });
        }
        let position = match feature {
            FeatureKind::Fiber => self.position().await?,
            FeatureKind::Waveguide => self.config.optimum + self.config.vision_error,
        };
        Ok(Detection {
            position,
            confidence: self.config.detection_confidence,
        })
    }
}
