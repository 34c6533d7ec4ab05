//! Value types shared by the alignment controller, its search strategies and
//! the hardware traits.

use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::AlignmentError;
use super::phase::AlignmentPhase;

/// Stage coordinates in microns
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl Position {
    pub const ORIGIN: Position = Position::new(0.0, 0.0, 0.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        (*self - *other).magnitude()
    }

    /// Copy of `self` moved by `delta` along one axis
    pub fn offset(&self, axis: Axis, delta: f64) -> Position {
        let mut moved = *self;
        match axis {
            Axis::X => moved.x += delta,
            Axis::Y => moved.y += delta,
            Axis::Z => moved.z += delta,
        }
        moved
    }
}

impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Position {
    type Output = Position;

    fn mul(self, factor: f64) -> Position {
        Position::new(self.x * factor, self.y * factor, self.z * factor)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

impl FromStr for Position {
    type Err = String;

    /// Parses `x,y,z`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [x, y, z] = parts.as_slice() else {
            return Err(format!("expected x,y,z but got '{s}'"));
        };
        let parse = |v: &str| v.parse::<f64>().map_err(|e| format!("'{v}': {e}"));
        Ok(Position::new(parse(*x)?, parse(*y)?, parse(*z)?))
    }
}

/// What the vision system is asked to locate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// The fiber tip carried by the stage
    Fiber,
    /// The chip waveguide facet the fiber is aligned to
    Waveguide,
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureKind::Fiber => write!(f, "fiber"),
            FeatureKind::Waveguide => write!(f, "waveguide"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub position: Position,
    /// 0.0 to 1.0
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    Gradient,
    Spiral,
    #[default]
    Combined,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::Gradient => "gradient",
            SearchStrategy::Spiral => "spiral",
            SearchStrategy::Combined => "combined",
        }
    }
}

impl fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchStrategy {
    type Err = AlignmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gradient" => Ok(SearchStrategy::Gradient),
            "spiral" => Ok(SearchStrategy::Spiral),
            "combined" => Ok(SearchStrategy::Combined),
            other => Err(AlignmentError::invalid(format!(
                "unknown strategy '{other}', expected gradient, spiral or combined"
            ))),
        }
    }
}

/// Which phases a run performs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentMode {
    #[default]
    Full,
    Coarse,
    Fine,
}

impl FromStr for AlignmentMode {
    type Err = AlignmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(AlignmentMode::Full),
            "coarse" => Ok(AlignmentMode::Coarse),
            "fine" => Ok(AlignmentMode::Fine),
            other => Err(AlignmentError::invalid(format!(
                "unknown mode '{other}', expected full, coarse or fine"
            ))),
        }
    }
}

/// Upper bound on the points a single spiral search may visit
pub const MAX_SPIRAL_POINTS: u32 = 100_000;

/// Tuning for one alignment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentParameters {
    pub position_tolerance_um: f64,
    pub angle_tolerance_deg: f64,
    /// Fine alignment succeeds once power reaches this level
    pub optical_power_threshold_dbm: f64,
    /// Coarse alignment succeeds when power is above this level
    pub coarse_power_floor_dbm: f64,
    pub max_iterations: u32,
    /// Strictly decreasing gradient step schedule
    pub step_sizes_um: Vec<f64>,
    /// Iterations without meaningful gain before gradient search stops
    pub convergence_window: u32,
    pub min_improvement_db: f64,
    pub strategy: SearchStrategy,
    pub spiral_step_um: f64,
    pub spiral_angular_rate: f64,
    pub spiral_t_increment: f64,
    pub spiral_max_radius_um: f64,
    pub min_detection_confidence: f64,
    pub coarse_speed: f64,
    pub fine_speed: f64,
}

impl Default for AlignmentParameters {
    fn default() -> Self {
        Self {
            position_tolerance_um: 0.1,
            angle_tolerance_deg: 0.05,
            optical_power_threshold_dbm: -3.0,
            coarse_power_floor_dbm: -30.0,
            max_iterations: 100,
            step_sizes_um: vec![0.5, 0.2, 0.1, 0.05],
            convergence_window: 3,
            min_improvement_db: 0.01,
            strategy: SearchStrategy::Combined,
            spiral_step_um: 0.5,
            spiral_angular_rate: 1.0,
            spiral_t_increment: 0.1,
            spiral_max_radius_um: 10.0,
            min_detection_confidence: 0.5,
            coarse_speed: 1.0,
            fine_speed: 0.5,
        }
    }
}

impl AlignmentParameters {
    pub fn validate(&self) -> Result<(), AlignmentError> {
        if self.step_sizes_um.is_empty() {
            return Err(AlignmentError::invalid("step_sizes_um must not be empty"));
        }
        if self.step_sizes_um.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(AlignmentError::invalid("step sizes must be positive"));
        }
        if self.step_sizes_um.windows(2).any(|w| w[1] >= w[0]) {
            return Err(AlignmentError::invalid(
                "step sizes must be strictly decreasing",
            ));
        }
        if self.max_iterations == 0 {
            return Err(AlignmentError::invalid("max_iterations must be at least 1"));
        }
        if self.convergence_window == 0 {
            return Err(AlignmentError::invalid(
                "convergence_window must be at least 1",
            ));
        }
        let positive = [
            ("spiral_step_um", self.spiral_step_um),
            ("spiral_t_increment", self.spiral_t_increment),
            ("spiral_max_radius_um", self.spiral_max_radius_um),
            ("coarse_speed", self.coarse_speed),
            ("fine_speed", self.fine_speed),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(AlignmentError::invalid(format!("{name} must be positive")));
            }
        }
        let spiral_points = self.spiral_points();
        if spiral_points > f64::from(MAX_SPIRAL_POINTS) {
            return Err(AlignmentError::invalid(format!(
                "spiral would visit {spiral_points:.0} points, limit is {MAX_SPIRAL_POINTS}; \
                 raise spiral_t_increment or spiral_step_um"
            )));
        }
        if !(0.0..=1.0).contains(&self.min_detection_confidence) {
            return Err(AlignmentError::invalid(
                "min_detection_confidence must be between 0 and 1",
            ));
        }
        Ok(())
    }

    /// Number of spiral points before the radius runs out
    pub fn spiral_points(&self) -> f64 {
        (self.spiral_max_radius_um / (self.spiral_step_um * self.spiral_t_increment)).floor()
    }

    /// Copy of `self` with matching keys from `overrides` applied.
    ///
    /// Keys listed in `ignored` are skipped; any other unknown key is an error.
    pub fn with_overrides(
        &self,
        overrides: &serde_json::Map<String, Value>,
        ignored: &[&str],
    ) -> Result<Self, AlignmentError> {
        let current =
            serde_json::to_value(self).map_err(|e| AlignmentError::invalid(e.to_string()))?;
        let Value::Object(mut merged) = current else {
            return Err(AlignmentError::invalid("parameters did not serialize to an object"));
        };
        for (key, value) in overrides {
            if ignored.contains(&key.as_str()) {
                continue;
            }
            if !merged.contains_key(key) {
                return Err(AlignmentError::invalid(format!("unknown parameter '{key}'")));
            }
            merged.insert(key.clone(), value.clone());
        }
        let params: AlignmentParameters = serde_json::from_value(Value::Object(merged))
            .map_err(|e| AlignmentError::invalid(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }
}

/// One sampled point of a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub position: Position,
    pub power_dbm: f64,
}

/// Mutable state of one in-progress run
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentRun {
    pub best_position: Position,
    pub best_power_dbm: f64,
    pub iterations: u32,
    pub trajectory: Vec<TrajectoryPoint>,
    pub cancelled: bool,
}

impl AlignmentRun {
    pub fn start(position: Position, power_dbm: f64) -> Self {
        Self {
            best_position: position,
            best_power_dbm: power_dbm,
            iterations: 0,
            trajectory: vec![TrajectoryPoint {
                position,
                power_dbm,
            }],
            cancelled: false,
        }
    }

    /// Append a sample; returns true when it is a new best
    pub fn record(&mut self, position: Position, power_dbm: f64) -> bool {
        self.trajectory.push(TrajectoryPoint {
            position,
            power_dbm,
        });
        if power_dbm > self.best_power_dbm {
            self.best_power_dbm = power_dbm;
            self.best_position = position;
            true
        } else {
            false
        }
    }
}

/// Why a phase or search stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ThresholdReached,
    Converged,
    BudgetExhausted,
    ScheduleExhausted,
    RadiusExhausted,
    BelowCoarseFloor,
    CoarseComplete,
    CoarseFailed,
    Cancelled,
    HardwareFault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoarseReport {
    pub success: bool,
    pub fiber: Option<Detection>,
    pub waveguide: Option<Detection>,
    /// Calibrated relative move that was requested
    pub correction: Option<Position>,
    /// False when the corrected move was zero and skipped
    pub moved: bool,
    pub power_dbm: Option<f64>,
    pub cancelled: bool,
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of one controller run, returned as a step output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub success: bool,
    pub cancelled: bool,
    pub phase: AlignmentPhase,
    pub mode: AlignmentMode,
    pub strategy: SearchStrategy,
    pub stop_reason: StopReason,
    pub final_position: Option<Position>,
    pub final_power_dbm: Option<f64>,
    pub iterations: u32,
    pub trajectory: Vec<TrajectoryPoint>,
    pub coarse: Option<CoarseReport>,
    pub message: Option<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parameters_are_valid() {
        let params = AlignmentParameters::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.strategy, SearchStrategy::Combined);
    }

    #[test]
    fn rejects_non_decreasing_schedule() {
        let params = AlignmentParameters {
            step_sizes_um: vec![0.2, 0.5],
            ..AlignmentParameters::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn overrides_apply_known_keys_only() {
        let mut overrides = serde_json::Map::new();
        overrides.insert("strategy".into(), Value::from("spiral"));
        overrides.insert("max_iterations".into(), Value::from(12));
        overrides.insert("mode".into(), Value::from("fine"));

        let params = AlignmentParameters::default()
            .with_overrides(&overrides, &["mode"])
            .unwrap();
        assert_eq!(params.strategy, SearchStrategy::Spiral);
        assert_eq!(params.max_iterations, 12);

        overrides.insert("speed_of_light".into(), Value::from(1));
        let err = AlignmentParameters::default()
            .with_overrides(&overrides, &["mode"])
            .unwrap_err();
        assert!(err.to_string().contains("speed_of_light"));
    }

    #[test]
    fn overrides_are_validated() {
        let mut overrides = serde_json::Map::new();
        overrides.insert("step_sizes_um".into(), serde_json::json!([]));
        assert!(AlignmentParameters::default()
            .with_overrides(&overrides, &[])
            .is_err());
    }

    #[test]
    fn rejects_unbounded_spiral() {
        let mut overrides = serde_json::Map::new();
        overrides.insert("spiral_t_increment".into(), Value::from(1e-12));
        let err = AlignmentParameters::default()
            .with_overrides(&overrides, &[])
            .unwrap_err();
        assert!(err.to_string().contains("spiral would visit"));
        assert!(AlignmentParameters::default().spiral_points() <= f64::from(MAX_SPIRAL_POINTS));
    }

    #[test]
    fn run_tracks_best_sample() {
        let mut run = AlignmentRun::start(Position::ORIGIN, -20.0);
        assert!(run.record(Position::new(1.0, 0.0, 0.0), -10.0));
        assert!(!run.record(Position::new(2.0, 0.0, 0.0), -15.0));
        assert_eq!(run.best_position, Position::new(1.0, 0.0, 0.0));
        assert_eq!(run.trajectory.len(), 3);
    }

    #[test]
    fn position_parses_from_cli_form() {
        let p: Position = "1.0, -1.0,0.5".parse().unwrap();
        assert_eq!(p, Position::new(1.0, -1.0, 0.5));
        assert!("1,2".parse::<Position>().is_err());
    }
}
