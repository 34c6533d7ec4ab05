// Vision-to-stage calibration applied to coarse alignment moves

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::errors::AlignmentError;
use super::types::Position;

/// Per-axis correction measured for one station.
///
/// A correction is applied as offset, then scale, then rotation about Z.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationProfile {
    /// Added to the raw delta (microns)
    pub offset: Position,
    /// Multiplied into the offset delta, per axis
    pub scale: Position,
    /// Rotation about Z in degrees
    pub z_rotation_deg: f64,
    pub camera_pixels_per_um: f64,
    pub last_calibrated: Option<DateTime<Utc>>,
    pub calibrated_by: Option<String>,
    pub notes: String,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            offset: Position::ORIGIN,
            scale: Position::new(1.0, 1.0, 1.0),
            z_rotation_deg: 0.0,
            camera_pixels_per_um: 10.0,
            last_calibrated: None,
            calibrated_by: None,
            notes: String::new(),
        }
    }
}

impl CalibrationProfile {
    pub fn apply(&self, delta: Position) -> Position {
        let shifted = delta + self.offset;
        let scaled = Position::new(
            shifted.x * self.scale.x,
            shifted.y * self.scale.y,
            shifted.z * self.scale.z,
        );

        if self.z_rotation_deg == 0.0 {
            return scaled;
        }
        let (sin, cos) = self.z_rotation_deg.to_radians().sin_cos();
        Position::new(
            scaled.x * cos - scaled.y * sin,
            scaled.x * sin + scaled.y * cos,
            scaled.z,
        )
    }

    pub fn load(path: &Path) -> Result<Self, AlignmentError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), AlignmentError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!(file = ?path, "Calibration profile saved");
        Ok(())
    }
}
