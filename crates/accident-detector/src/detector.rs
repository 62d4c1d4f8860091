//! Two-stage accident detector
//!
//! Acceleration and speed arrive on independent loops at different rates
//! (~10 Hz and ~1 Hz); both read and write the potential-accident flag, so
//! every operation runs under the single state lock.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::config::DetectorConfig;
use crate::state::{Classification, DetectorState};
use crate::DetectorError;

/// Accident detector shared between the acceleration and speed loops
pub struct AccidentDetector {
    config: DetectorConfig,
    state: Mutex<DetectorState>,
}

impl AccidentDetector {
    /// Create a detector after validating its configuration
    pub fn new(config: DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;
        info!(
            threshold = config.accel_threshold,
            window = config.accel_window,
            occurrence_min = config.accel_occurrence_min,
            "Creating accident detector"
        );
        Ok(Self {
            state: Mutex::new(DetectorState::new(config.accel_window)),
            config,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed one acceleration magnitude (m/s²) taken at `timestamp` (seconds)
    ///
    /// While a potential accident is pending the sample is ignored and the
    /// pending state is reported.
    pub fn process_acceleration(&self, magnitude: f64, timestamp: f64) -> Classification {
        let mut state = self.lock();

        if state.potential_accident {
            return Classification::PotentialAccident;
        }

        state.accel_window.push(magnitude.abs());
        state.accel_timestamps.push(timestamp);

        let threshold = self.config.accel_threshold;
        let high_count = state.accel_window.count_where(|a| *a > threshold);

        if high_count >= self.config.accel_occurrence_min {
            state.potential_accident = true;
            state.accident_timestamp = Some(timestamp);
            info!(
                magnitude,
                timestamp,
                high_count,
                "Potential accident raised from acceleration"
            );
            return Classification::PotentialAccident;
        }

        Classification::Normal
    }

    /// Feed one speed sample (km/h) taken at `timestamp` (seconds)
    pub fn process_speed(&self, speed: f64, timestamp: f64) -> Classification {
        let mut state = self.lock();

        let Some(last_speed) = state.last_speed else {
            state.last_speed = Some(speed);
            state.last_speed_time = Some(timestamp);
            return Classification::Normal;
        };

        let speed_drop = last_speed - speed;
        state.last_speed = Some(speed);
        state.last_speed_time = Some(timestamp);

        if !state.potential_accident {
            return Classification::Normal;
        }

        let raised_at = state.accident_timestamp.unwrap_or(timestamp);
        let elapsed = (timestamp - raised_at).abs();

        if elapsed <= self.config.correlation_window_s {
            if speed_drop.abs() >= self.config.speed_drop_threshold {
                info!(speed_drop, elapsed, "Accident confirmed by speed drop");
                return Classification::Accident;
            }
            debug!(speed_drop, elapsed, "Speed drop below threshold, still pending");
        } else {
            // Spikes from the expired event must not count towards the next one
            debug!(elapsed, "Correlation window elapsed, potential accident cleared");
            state.reset();
        }

        Classification::Normal
    }

    /// Clear the window and accident flags
    pub fn reset(&self) {
        self.lock().reset();
        debug!("Accident detector reset");
    }

    /// Whether a potential accident is awaiting confirmation
    pub fn is_potential(&self) -> bool {
        self.lock().potential_accident
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> DetectorState {
        self.lock().clone()
    }
}
