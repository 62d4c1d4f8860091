//! Camera Capture Library for the Vehicle Blackbox
//!
//! Keeps the last seconds of video in a pre-trigger ring and, on trigger,
//! persists a fixed pre-trigger + post-trigger window:
//! - Pre-trigger ring filled continuously at the source frame rate
//! - Triggered recording bounded by frame count and wall-clock deadline
//! - Motion-JPEG AVI output, finalized atomically
//! - JPEG stills of the latest frame

pub mod frame;
pub mod mjpeg;
pub mod recorder;
pub mod sink;
pub mod snapshot;

pub use frame::Frame;
pub use mjpeg::MjpegAviWriter;
pub use recorder::{CaptureBuffer, RecordingSession, RecordingSummary};
pub use sink::{FinishedVideo, MjpegFileFactory, SinkFactory, VideoSink};
pub use snapshot::write_snapshot;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Capture error types
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open capture device: {0}")]
    Open(String),

    #[error("Frame encoding failed: {0}")]
    Encode(String),

    #[error("Video container error: {0}")]
    Container(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture and triggered-recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Source frame rate
    pub fps: u32,
    /// Seconds of video kept before a trigger
    pub pretrigger_seconds: u32,
    /// Seconds of video recorded after a trigger
    pub posttrigger_seconds: u32,
    /// Directory for incident recordings
    pub output_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: 20,
            pretrigger_seconds: 20,
            posttrigger_seconds: 20,
            output_dir: PathBuf::from("recordings/incidents"),
        }
    }
}

impl CaptureConfig {
    /// Frames kept in the pre-trigger ring
    pub fn required_pre_frames(&self) -> usize {
        (self.fps as usize) * (self.pretrigger_seconds as usize)
    }

    /// Pre-trigger plus post-trigger duration
    pub fn total_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.pretrigger_seconds) + u64::from(self.posttrigger_seconds))
    }

    /// Frame target for one triggered recording
    pub fn target_frames(&self) -> u64 {
        u64::from(self.fps) * (u64::from(self.pretrigger_seconds) + u64::from(self.posttrigger_seconds))
    }

    /// Time between two frames at the source rate
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.fps == 0 {
            return Err(CaptureError::Config("fps must be positive".into()));
        }
        if self.pretrigger_seconds + self.posttrigger_seconds == 0 {
            return Err(CaptureError::Config(
                "pre-trigger plus post-trigger duration must be positive".into(),
            ));
        }
        Ok(())
    }
}
