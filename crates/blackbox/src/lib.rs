//! Vehicle Blackbox
//!
//! Wires the accident detector, incident capture, segment retention and the
//! telemetry delivery queue into one set of cooperating tasks.

pub mod config;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod sim;
pub mod source;

pub use config::{BlackboxConfig, PipelineConfig};
pub use logging::{init_logging, install_metrics_exporter, LogFormat, LoggingConfig};
pub use orchestrator::{AccidentOutcome, Orchestrator};
pub use pipeline::{Collaborators, Pipeline};
pub use sim::{SimulatedSource, SimulationConfig};
pub use source::{AccelSample, SampleSource, SourceError, SpeedSample};

use accident_detector::DetectorError;
use camera_capture::CaptureError;
use cloud_sync::CloudError;
use storage::StorageError;
use thiserror::Error;

/// Startup and wiring errors
#[derive(Error, Debug)]
pub enum BlackboxError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Sample source error: {0}")]
    Source(#[from] SourceError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cloud sync error: {0}")]
    Cloud(#[from] CloudError),
}
