//! Segment rotation and quota enforcement

use camera_capture::{Frame, MjpegFileFactory, SinkFactory, VideoSink};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::segment::{eviction_count, Segment};
use crate::StorageError;

const SEGMENT_PREFIX: &str = "segment";

/// How often the recorder loop checks for a due rotation without frames
const ROTATION_CHECK: Duration = Duration::from_secs(1);

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Directory holding continuous-recording segments
    pub segment_dir: PathBuf,
    /// Length of one segment (seconds)
    pub segment_duration_seconds: u64,
    /// Storage quota for all segments (MB)
    pub storage_quota_mb: u64,
    /// Frame rate written into segment headers
    pub fps: u32,
    /// Frames buffered between the capture loop and the segment recorder
    pub channel_capacity: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            segment_dir: PathBuf::from("recordings/segments"),
            segment_duration_seconds: 300,
            storage_quota_mb: 500,
            fps: 20,
            channel_capacity: 64,
        }
    }
}

impl RetentionConfig {
    pub fn quota_bytes(&self) -> u64 {
        self.storage_quota_mb.saturating_mul(1024 * 1024)
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_seconds)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.segment_duration_seconds == 0 {
            return Err(StorageError::Config("segment_duration_seconds must be positive".into()));
        }
        if self.fps == 0 {
            return Err(StorageError::Config("fps must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(StorageError::Config("channel_capacity must be positive".into()));
        }
        Ok(())
    }
}

struct ActiveSegment {
    sink: Box<dyn VideoSink>,
    opened_at: Instant,
    created_at: DateTime<Utc>,
}

/// Continuous-recording segment manager
pub struct RetentionManager {
    config: RetentionConfig,
    factory: Box<dyn SinkFactory>,
    /// Finalized segments, oldest first
    segments: VecDeque<Segment>,
    active: Option<ActiveSegment>,
}

impl RetentionManager {
    /// Manager writing MJPEG segments into the configured directory
    pub fn new(config: RetentionConfig) -> Result<Self, StorageError> {
        let factory = MjpegFileFactory::new(&config.segment_dir, SEGMENT_PREFIX, config.fps);
        Self::with_factory(config, Box::new(factory))
    }

    pub fn with_factory(config: RetentionConfig, factory: Box<dyn SinkFactory>) -> Result<Self, StorageError> {
        config.validate()?;
        info!(
            dir = %config.segment_dir.display(),
            segment_seconds = config.segment_duration_seconds,
            quota_mb = config.storage_quota_mb,
            "Creating retention manager"
        );
        Ok(Self {
            config,
            factory,
            segments: VecDeque::new(),
            active: None,
        })
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Finalized segments, oldest first
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Total size of finalized segments
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }

    pub fn has_active_segment(&self) -> bool {
        self.active.is_some()
    }

    /// Adopt segment files left by previous runs, then enforce the quota
    ///
    /// Returns the number of adopted segments.
    pub fn scan_existing(&mut self) -> Result<usize, StorageError> {
        fs::create_dir_all(&self.config.segment_dir)?;

        let mut found: Vec<(PathBuf, fs::Metadata)> = Vec::new();
        for entry in fs::read_dir(&self.config.segment_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable segment directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if !is_segment_file(&path) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => found.push((path, meta)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable segment"),
            }
        }

        found.sort_by_cached_key(|(path, _)| creation_order(path));
        let adopted = found.len();
        for (path, meta) in found {
            let created_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            self.segments.push_back(Segment {
                path,
                created_at,
                size_bytes: meta.len(),
            });
        }

        info!(adopted, bytes = self.total_bytes(), "Adopted existing segments");
        self.enforce_quota();
        Ok(adopted)
    }

    /// Track an externally finalized segment
    pub fn track(&mut self, segment: Segment) {
        self.segments.push_back(segment);
    }

    /// Append a frame to the active segment, rotating first when it is due
    pub fn write_frame(&mut self, frame: &Frame, now: Instant) -> Result<(), StorageError> {
        self.rotate_if_due(now)?;

        if self.active.is_none() {
            let sink = self.factory.create(frame)?;
            debug!("Opened new segment");
            self.active = Some(ActiveSegment {
                sink,
                opened_at: now,
                created_at: Utc::now(),
            });
        }

        if let Some(active) = self.active.as_mut() {
            if let Err(e) = active.sink.write_frame(frame) {
                // Close what was written so far and start over on the next frame
                self.rotate()?;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Rotate when the active segment has reached the segment duration
    pub fn rotate_if_due(&mut self, now: Instant) -> Result<bool, StorageError> {
        let due = self
            .active
            .as_ref()
            .is_some_and(|a| now.saturating_duration_since(a.opened_at) >= self.config.segment_duration());
        if due {
            self.rotate()?;
        }
        Ok(due)
    }

    /// Finalize the active segment and enforce the quota
    pub fn rotate(&mut self) -> Result<(), StorageError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        let finished = active.sink.finish();
        match finished {
            Ok(video) => {
                info!(
                    path = %video.path.display(),
                    frames = video.frames,
                    bytes = video.size_bytes,
                    "Segment finalized"
                );
                self.segments.push_back(Segment {
                    path: video.path,
                    created_at: active.created_at,
                    size_bytes: video.size_bytes,
                });
                counter!("storage_segments_written_total").increment(1);
            }
            Err(e) => {
                warn!(error = %e, "Failed to finalize segment");
                self.enforce_quota();
                return Err(e.into());
            }
        }

        self.enforce_quota();
        Ok(())
    }

    /// Delete the oldest segments until the rest fit in the quota
    ///
    /// Returns the paths evicted.
    pub fn enforce_quota(&mut self) -> Vec<PathBuf> {
        let evict = eviction_count(&self.segments, self.config.quota_bytes());
        let mut evicted = Vec::with_capacity(evict);

        for segment in self.segments.drain(..evict) {
            match fs::remove_file(&segment.path) {
                Ok(()) => info!(
                    path = %segment.path.display(),
                    bytes = segment.size_bytes,
                    "Evicted segment"
                ),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(path = %segment.path.display(), "Segment already gone")
                }
                Err(e) => warn!(path = %segment.path.display(), error = %e, "Failed to evict segment"),
            }
            evicted.push(segment.path);
        }

        if !evicted.is_empty() {
            counter!("storage_segments_evicted_total").increment(evicted.len() as u64);
        }
        gauge!("storage_segments_bytes").set(self.total_bytes() as f64);
        evicted
    }

    /// Finalize the active segment on shutdown
    pub fn finish(&mut self) -> Result<(), StorageError> {
        self.rotate()?;
        info!(segments = self.segments.len(), bytes = self.total_bytes(), "Segment recorder stopped");
        Ok(())
    }

    /// Drive the manager from a frame channel until shutdown
    pub async fn run(mut self, mut frames: mpsc::Receiver<Frame>, mut shutdown: watch::Receiver<bool>) -> Self {
        let mut check = tokio::time::interval(ROTATION_CHECK);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = self.write_frame(&frame, tokio::time::Instant::now().into_std()) {
                        warn!(error = %e, "Segment write failed");
                    }
                }
                _ = check.tick() => {
                    if let Err(e) = self.rotate_if_due(tokio::time::Instant::now().into_std()) {
                        warn!(error = %e, "Segment rotation failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.finish() {
            warn!(error = %e, "Failed to finalize segment on shutdown");
        }
        self
    }
}

/// Sort key for `segment_<date>_<time>[_n].avi`: timestamp, then collision suffix
fn creation_order(path: &Path) -> (String, u32) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some((base, suffix)) = stem.rsplit_once('_') {
        // Timestamp fields are at least six digits; a shorter tail is a suffix
        if suffix.len() < 6 {
            if let Ok(n) = suffix.parse() {
                return (base.to_string(), n);
            }
        }
    }
    (stem, 0)
}

fn is_segment_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with("segment_") && name.ends_with(".avi")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, quota_mb: u64) -> RetentionConfig {
        RetentionConfig {
            segment_dir: dir.to_path_buf(),
            segment_duration_seconds: 300,
            storage_quota_mb: quota_mb,
            fps: 20,
            channel_capacity: 4,
        }
    }

    fn frame(sequence: u64, len: usize) -> Frame {
        Frame::new(vec![0xABu8; len], 2, 2, sequence * 50, sequence)
    }

    #[test]
    fn test_rotates_after_segment_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = RetentionManager::new(config(dir.path(), 500)).unwrap();
        let start = Instant::now();

        manager.write_frame(&frame(0, 100), start).unwrap();
        manager.write_frame(&frame(1, 100), start + Duration::from_secs(299)).unwrap();
        assert_eq!(manager.segments().count(), 0);

        manager.write_frame(&frame(2, 100), start + Duration::from_secs(300)).unwrap();
        assert_eq!(manager.segments().count(), 1);
        assert!(manager.has_active_segment());

        manager.finish().unwrap();
        assert_eq!(manager.segments().count(), 2);
        assert!(!manager.has_active_segment());
        for segment in manager.segments() {
            assert!(segment.path.exists());
            assert_eq!(fs::metadata(&segment.path).unwrap().len(), segment.size_bytes);
        }
    }

    #[test]
    fn test_quota_evicts_oldest_file() {
        let dir = tempfile::tempdir().unwrap();
        // 1 MB quota, each segment ~600 KB
        let mut manager = RetentionManager::new(config(dir.path(), 1)).unwrap();
        let start = Instant::now();

        manager.write_frame(&frame(0, 600 * 1024), start).unwrap();
        manager.rotate().unwrap();
        let first = manager.segments().next().unwrap().path.clone();

        manager.write_frame(&frame(1, 600 * 1024), start).unwrap();
        manager.rotate().unwrap();

        assert_eq!(manager.segments().count(), 1);
        assert!(!first.exists());
        assert!(manager.total_bytes() <= manager.config().quota_bytes());
    }

    #[test]
    fn test_missing_file_is_dropped_from_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = RetentionManager::new(config(dir.path(), 0)).unwrap();
        manager.track(Segment {
            path: dir.path().join("segment_gone.avi"),
            created_at: Utc::now(),
            size_bytes: 10,
        });

        let evicted = manager.enforce_quota();
        assert_eq!(evicted.len(), 1);
        assert_eq!(manager.segments().count(), 0);
    }

    #[test]
    fn test_scan_adopts_previous_segments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("segment_20240101_000000.avi"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("segment_20240101_000500.avi"), vec![0u8; 20]).unwrap();
        fs::write(dir.path().join("incident_20240101_000100.avi"), vec![0u8; 30]).unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let mut manager = RetentionManager::new(config(dir.path(), 500)).unwrap();
        assert_eq!(manager.scan_existing().unwrap(), 2);

        let names: Vec<_> = manager
            .segments()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["segment_20240101_000000.avi", "segment_20240101_000500.avi"]);
        assert_eq!(manager.total_bytes(), 30);
    }

    #[test]
    fn test_scan_orders_collision_suffixes_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "segment_20240101_000000_10.avi",
            "segment_20240101_000000_2.avi",
            "segment_20240101_000000.avi",
            "segment_20240101_000001.avi",
        ] {
            fs::write(dir.path().join(name), vec![0u8; 10]).unwrap();
        }

        let mut manager = RetentionManager::new(config(dir.path(), 500)).unwrap();
        assert_eq!(manager.scan_existing().unwrap(), 4);

        let names: Vec<_> = manager
            .segments()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "segment_20240101_000000.avi",
                "segment_20240101_000000_2.avi",
                "segment_20240101_000000_10.avi",
                "segment_20240101_000001.avi",
            ]
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 500);
        config.segment_duration_seconds = 0;
        assert!(RetentionManager::new(config).is_err());
    }

    #[tokio::test]
    async fn test_run_finalizes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RetentionManager::new(config(dir.path(), 500)).unwrap();
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(manager.run(frame_rx, shutdown_rx));
        for i in 0..3 {
            frame_tx.send(frame(i, 64)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let manager = task.await.unwrap();
        assert_eq!(manager.segments().count(), 1);
        assert!(manager.segments().all(|s| s.path.exists()));
    }
}
