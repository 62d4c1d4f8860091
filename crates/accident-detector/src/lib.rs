//! Accident Detector
//!
//! Fuses acceleration and speed samples into an accident classification:
//! - Acceleration spikes must persist across a short sample window
//! - A persisting spike must be confirmed by a speed drop within a bounded
//!   correlation window, otherwise it silently reverts to normal
//!
//! Also tracks the coarse vehicle motion state (stopped, parked, running).

pub mod config;
pub mod detector;
pub mod motion;
pub mod state;

pub use config::DetectorConfig;
pub use detector::AccidentDetector;
pub use motion::{GpsFix, MotionConfig, MotionSample, MotionTracker, StateChange, VehicleState};
pub use state::{Classification, DetectorState};

use thiserror::Error;

/// Standard gravity (m/s²)
pub const STANDARD_GRAVITY: f64 = 9.8;

/// Detector error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("Configuration error: {0}")]
    Config(String),
}
