//! Video sinks
//!
//! Recorders write through [`VideoSink`] so tests and alternative encoders
//! can stand in for the MJPEG file writer.

use chrono::Local;
use std::path::{Path, PathBuf};

use crate::frame::Frame;
use crate::mjpeg::{part_path, MjpegAviWriter};
use crate::CaptureError;

/// A finalized video file
#[derive(Debug, Clone)]
pub struct FinishedVideo {
    pub path: PathBuf,
    pub frames: u64,
    pub size_bytes: u64,
}

/// Destination for a sequence of frames
pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), CaptureError>;

    fn frames_written(&self) -> u64;

    /// Flush and close; the output is complete once this returns
    fn finish(self: Box<Self>) -> Result<FinishedVideo, CaptureError>;
}

/// Creates a sink sized for the first frame it will receive
pub trait SinkFactory: Send + Sync {
    fn create(&self, first: &Frame) -> Result<Box<dyn VideoSink>, CaptureError>;
}

impl VideoSink for MjpegAviWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        MjpegAviWriter::write_frame(self, frame)
    }

    fn frames_written(&self) -> u64 {
        self.frames()
    }

    fn finish(self: Box<Self>) -> Result<FinishedVideo, CaptureError> {
        let path = self.path().to_path_buf();
        let frames = self.frames();
        let size_bytes = MjpegAviWriter::finish(*self)?;
        Ok(FinishedVideo {
            path,
            frames,
            size_bytes,
        })
    }
}

/// Writes timestamped MJPEG AVI files into a directory
#[derive(Debug, Clone)]
pub struct MjpegFileFactory {
    dir: PathBuf,
    prefix: String,
    fps: u32,
}

impl MjpegFileFactory {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, fps: u32) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            fps,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Next free `<prefix>_<YYYYmmdd_HHMMSS>[_nnn].avi` path
    pub fn next_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let base = format!("{}_{}", self.prefix, stamp);
        let mut path = self.dir.join(format!("{base}.avi"));
        let mut n = 1;
        while path.exists() || part_path(&path).exists() {
            path = self.dir.join(format!("{base}_{n:03}.avi"));
            n += 1;
        }
        path
    }
}

impl SinkFactory for MjpegFileFactory {
    fn create(&self, first: &Frame) -> Result<Box<dyn VideoSink>, CaptureError> {
        std::fs::create_dir_all(&self.dir)?;
        let writer = MjpegAviWriter::create(self.next_path(), first.width, first.height, self.fps)?;
        Ok(Box::new(writer))
    }
}
