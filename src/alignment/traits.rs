//! Hardware seams of the alignment controller.
//!
//! Vendor drivers and the camera pipeline live behind these traits; the
//! controller only ever talks to them. Both are mockable in unit tests.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use super::errors::HardwareError;
use super::types::{Detection, FeatureKind, Position};

/// Motion stage with an attached optical power meter.
///
/// Speeds are fractions of the stage's maximum (1.0 = 100%).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MotionActuator: Send + Sync {
    async fn connect(&self) -> Result<(), HardwareError>;

    /// Home and enable the axes
    async fn initialize(&self) -> Result<(), HardwareError>;

    async fn move_relative(&self, delta: Position, speed: f64) -> Result<(), HardwareError>;

    async fn move_absolute(&self, target: Position, speed: f64) -> Result<(), HardwareError>;

    async fn position(&self) -> Result<Position, HardwareError>;

    /// Optical power in dBm
    async fn power(&self) -> Result<f64, HardwareError>;

    /// Halt any motion in progress
    async fn stop(&self) -> Result<(), HardwareError>;
}

/// Vision system locating the fiber tip and the chip waveguide in stage coordinates
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FeatureDetector: Send + Sync {
    async fn detect(&self, feature: FeatureKind) -> Result<Detection, HardwareError>;
}
