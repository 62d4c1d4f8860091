//! Storage Layer
//!
//! Rotates continuous recording into fixed-duration segments and keeps the
//! segment directory under a storage quota by evicting the oldest files.

mod retention;
mod segment;

pub use retention::{RetentionConfig, RetentionManager};
pub use segment::{eviction_count, Segment};

use camera_capture::CaptureError;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Segment write failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("Invalid configuration: {0}")]
    Config(String),
}
