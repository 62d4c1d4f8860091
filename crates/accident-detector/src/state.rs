//! Detection state tracking

use ring_buffer::RingBuffer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification emitted by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Classification {
    #[default]
    Normal,
    PotentialAccident,
    Accident,
}

impl Classification {
    /// Status string used in telemetry payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Normal => "Normal",
            Classification::PotentialAccident => "PotentialAccident",
            Classification::Accident => "Accident",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accident-detection session state
#[derive(Debug, Clone)]
pub struct DetectorState {
    /// Recent acceleration magnitudes
    pub accel_window: RingBuffer<f64>,

    /// Timestamps parallel to `accel_window` (seconds)
    pub accel_timestamps: RingBuffer<f64>,

    /// Spike persisted, awaiting speed confirmation
    pub potential_accident: bool,

    /// Time the potential accident was raised (seconds)
    pub accident_timestamp: Option<f64>,

    /// Last speed sample (km/h)
    pub last_speed: Option<f64>,

    /// Time of the last speed sample (seconds)
    pub last_speed_time: Option<f64>,
}

impl DetectorState {
    pub fn new(window: usize) -> Self {
        Self {
            accel_window: RingBuffer::new(window),
            accel_timestamps: RingBuffer::new(window),
            potential_accident: false,
            accident_timestamp: None,
            last_speed: None,
            last_speed_time: None,
        }
    }

    /// Clear the window and accident flags
    ///
    /// Speed history is kept so the next speed sample still yields a drop.
    pub fn reset(&mut self) {
        self.accel_window.clear();
        self.accel_timestamps.clear();
        self.potential_accident = false;
        self.accident_timestamp = None;
    }
}
