//! Detector configuration

use serde::{Deserialize, Serialize};

use crate::{DetectorError, STANDARD_GRAVITY};

/// Accident detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Acceleration magnitude threshold (m/s²)
    pub accel_threshold: f64,

    /// Number of recent magnitude samples kept in the window
    pub accel_window: usize,

    /// Over-threshold samples in the window needed to raise a potential accident
    pub accel_occurrence_min: usize,

    /// Minimum speed drop (km/h) confirming a potential accident
    pub speed_drop_threshold: f64,

    /// Time allowed between the acceleration spike and the speed drop (seconds)
    pub correlation_window_s: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            accel_threshold: 2.0 * STANDARD_GRAVITY,
            accel_window: 5,
            accel_occurrence_min: 3,
            speed_drop_threshold: 15.0,
            correlation_window_s: 2.0,
        }
    }
}

impl DetectorConfig {
    /// Create config with the threshold expressed as a multiple of g
    pub fn with_g_multiple(g_multiple: f64) -> Self {
        Self {
            accel_threshold: g_multiple * STANDARD_GRAVITY,
            ..Default::default()
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.accel_window == 0 {
            return Err(DetectorError::Config("accel_window must be at least 1".into()));
        }
        if self.accel_occurrence_min == 0 || self.accel_occurrence_min > self.accel_window {
            return Err(DetectorError::Config(format!(
                "accel_occurrence_min must be within 1..={}, got {}",
                self.accel_window, self.accel_occurrence_min
            )));
        }
        if !self.accel_threshold.is_finite() || self.accel_threshold < 0.0 {
            return Err(DetectorError::Config(format!(
                "accel_threshold must be a non-negative number, got {}",
                self.accel_threshold
            )));
        }
        if !self.speed_drop_threshold.is_finite() || self.speed_drop_threshold < 0.0 {
            return Err(DetectorError::Config(format!(
                "speed_drop_threshold must be a non-negative number, got {}",
                self.speed_drop_threshold
            )));
        }
        if !self.correlation_window_s.is_finite() || self.correlation_window_s <= 0.0 {
            return Err(DetectorError::Config(format!(
                "correlation_window_s must be positive, got {}",
                self.correlation_window_s
            )));
        }
        Ok(())
    }
}
