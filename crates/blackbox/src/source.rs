//! Sample source interface
//!
//! Hardware drivers (camera, IMU, GPS) live outside this crate; the pipeline
//! polls them through [`SampleSource`].

use accident_detector::GpsFix;
use async_trait::async_trait;
use camera_capture::{CaptureError, Frame};
use thiserror::Error;

/// Sample source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open device: {0}")]
    Open(String),

    #[error("Device not open: {0}")]
    NotOpen(&'static str),

    #[error("Sample unavailable: {0}")]
    Unavailable(String),

    #[error("Frame error: {0}")]
    Frame(#[from] CaptureError),
}

/// One accelerometer reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelSample {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    /// Raw acceleration including gravity (m/s²)
    pub accel: [f64; 3],
    /// Linear acceleration with gravity removed (m/s²)
    pub linear: [f64; 3],
}

impl AccelSample {
    /// Magnitude of the raw acceleration vector
    pub fn magnitude(&self) -> f64 {
        let [x, y, z] = self.accel;
        (x * x + y * y + z * z).sqrt()
    }
}

/// One speed reading, with the GPS fix it came from when available
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub speed_kmh: f64,
    pub gps: Option<GpsFix>,
}

/// Polled source of frames and motion samples
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Open the camera; failure aborts startup
    async fn open_camera(&self) -> Result<(), SourceError>;

    async fn next_frame(&self) -> Result<Frame, SourceError>;

    async fn next_accel(&self) -> Result<AccelSample, SourceError>;

    async fn next_speed(&self) -> Result<SpeedSample, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnitude() {
        let sample = AccelSample {
            timestamp: 0.0,
            accel: [3.0, 4.0, 0.0],
            linear: [0.0; 3],
        };
        assert!((sample.magnitude() - 5.0).abs() < 1e-12);
    }
}
