//! Task wiring
//!
//! One long-lived task per polling source plus the recording driver, the
//! segment recorder, the publish loop and the connectivity monitor. Every
//! loop exits after its current iteration once shutdown is signalled.

use accident_detector::{AccidentDetector, Classification, MotionConfig, MotionSample, MotionTracker};
use camera_capture::{write_snapshot, CaptureBuffer, MjpegFileFactory};
use chrono::Local;
use cloud_sync::{
    kind, AccelerometerReading, Connectivity, ConnectivityMonitor, DeliveryQueue, GpsReading,
    Publisher, Reading,
};
use metrics::counter;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use storage::RetentionManager;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{BlackboxConfig, PipelineConfig};
use crate::orchestrator::Orchestrator;
use crate::source::{AccelSample, SampleSource, SpeedSample};
use crate::BlackboxError;

/// External collaborators the pipeline drives
pub struct Collaborators {
    pub source: Arc<dyn SampleSource>,
    /// Required for publishing; without one envelopes stay queued
    pub publisher: Option<Arc<dyn Publisher>>,
    pub connectivity: Arc<dyn Connectivity>,
    /// Probed in its own task when set
    pub monitor: Option<Arc<ConnectivityMonitor>>,
}

/// Most recent readings, shared by the sampling and telemetry loops
#[derive(Debug, Clone, Copy, Default)]
struct LatestReadings {
    accel: Option<AccelSample>,
    status: Classification,
    speed: Option<SpeedSample>,
}

#[derive(Default)]
struct Latest(Mutex<LatestReadings>);

impl Latest {
    fn lock(&self) -> MutexGuard<'_, LatestReadings> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Running blackbox pipeline
pub struct Pipeline {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    orchestrator: Arc<Orchestrator>,
    capture: Arc<CaptureBuffer>,
    queue: Arc<DeliveryQueue>,
}

impl Pipeline {
    /// Validate, open the camera and spawn every task
    ///
    /// Only configuration and device-open failures are returned; everything
    /// after startup is logged and retried by the owning loop.
    pub async fn start(
        config: BlackboxConfig,
        collaborators: Collaborators,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, BlackboxError> {
        config.validate()?;
        collaborators.source.open_camera().await?;

        let detector = Arc::new(AccidentDetector::new(config.detector.clone())?);
        let capture = Arc::new(CaptureBuffer::new(config.capture.clone())?);
        let queue = Arc::new(DeliveryQueue::new(config.queue.clone())?);
        queue.load_from_disk();

        let mut retention = RetentionManager::new(config.retention.clone())?;
        if let Err(e) = retention.scan_existing() {
            warn!(error = %e, "Could not scan existing segments");
        }

        let orchestrator = Arc::new(Orchestrator::new(
            detector,
            Arc::clone(&capture),
            Arc::clone(&queue),
            config.alert.clone(),
            shutdown.clone(),
        ));
        let latest = Arc::new(Latest::default());
        let (segment_tx, segment_rx) = mpsc::channel(config.retention.channel_capacity);
        let source = collaborators.source;

        let mut tasks = Vec::new();

        tasks.push((
            "capture",
            tokio::spawn(capture_loop(
                Arc::clone(&source),
                Arc::clone(&capture),
                segment_tx,
                config.capture.frame_interval(),
                shutdown.clone(),
            )),
        ));

        let factory = MjpegFileFactory::new(&config.capture.output_dir, "incident", config.capture.fps);
        tasks.push((
            "recording",
            tokio::spawn(recording_loop(Arc::clone(&capture), factory, shutdown.clone())),
        ));

        let segment_shutdown = shutdown.clone();
        tasks.push((
            "segments",
            tokio::spawn(async move {
                retention.run(segment_rx, segment_shutdown).await;
            }),
        ));

        tasks.push((
            "accel",
            tokio::spawn(accel_loop(
                Arc::clone(&source),
                Arc::clone(&orchestrator),
                Arc::clone(&latest),
                config.pipeline.accel_interval(),
                shutdown.clone(),
            )),
        ));

        tasks.push((
            "speed",
            tokio::spawn(speed_loop(
                SpeedLoop {
                    source: Arc::clone(&source),
                    orchestrator: Arc::clone(&orchestrator),
                    capture: Arc::clone(&capture),
                    queue: Arc::clone(&queue),
                    latest: Arc::clone(&latest),
                    pipeline: config.pipeline.clone(),
                    motion: config.motion.clone(),
                },
                shutdown.clone(),
            )),
        ));

        tasks.push((
            "telemetry",
            tokio::spawn(telemetry_loop(
                Arc::clone(&queue),
                Arc::clone(&latest),
                config.pipeline.telemetry_interval(),
                shutdown.clone(),
            )),
        ));

        match (config.pipeline.cloud_enabled, collaborators.publisher) {
            (true, Some(publisher)) => {
                let queue = Arc::clone(&queue);
                let connectivity = Arc::clone(&collaborators.connectivity);
                let publish_shutdown = shutdown.clone();
                tasks.push((
                    "publish",
                    tokio::spawn(async move {
                        queue
                            .run(publisher.as_ref(), connectivity.as_ref(), publish_shutdown)
                            .await;
                    }),
                ));
            }
            (true, None) => warn!("Cloud publishing enabled but no publisher configured"),
            (false, _) => info!("Cloud publishing disabled, telemetry stays cached"),
        }

        if let Some(monitor) = collaborators.monitor {
            let monitor_shutdown = shutdown.clone();
            tasks.push((
                "connectivity",
                tokio::spawn(async move { monitor.run(monitor_shutdown).await }),
            ));
        }

        info!(tasks = tasks.len(), "Pipeline started");
        Ok(Self {
            tasks,
            orchestrator,
            capture,
            queue,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn capture(&self) -> &Arc<CaptureBuffer> {
        &self.capture
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Signal shutdown through `shutdown` and wait for every task
    pub async fn stop(self, shutdown: &watch::Sender<bool>) {
        if let Err(e) = shutdown.send(true) {
            debug!(error = %e, "All tasks already stopped");
        }
        self.join().await;
    }

    /// Wait for every task to exit; call after signalling shutdown
    pub async fn join(self) {
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => debug!(task = name, "Task stopped"),
                Err(e) => warn!(task = name, error = %e, "Task failed"),
            }
        }
        self.orchestrator.join_scheduled().await;
        self.queue.flush_cache().await;
        info!(queued = self.queue.len(), "Pipeline stopped");
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Wait for the next tick; `false` once shutdown is signalled
async fn tick(interval: &mut Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    loop {
        tokio::select! {
            _ = interval.tick() => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

async fn capture_loop(
    source: Arc<dyn SampleSource>,
    capture: Arc<CaptureBuffer>,
    segments: mpsc::Sender<camera_capture::Frame>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(period);
    while tick(&mut interval, &mut shutdown).await {
        match source.next_frame().await {
            Ok(frame) => {
                capture.push_frame(frame.clone());
                if let Err(TrySendError::Full(_)) = segments.try_send(frame) {
                    counter!("segment_frames_dropped_total").increment(1);
                    debug!("Segment recorder busy, frame dropped for segment");
                }
            }
            Err(e) => warn!(error = %e, "Frame capture failed"),
        }
    }
    debug!("Capture loop stopped");
}

async fn recording_loop(
    capture: Arc<CaptureBuffer>,
    factory: MjpegFileFactory,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match capture.record_next(&factory, &mut shutdown).await {
            Ok(Some(summary)) => {
                if let Some(video) = &summary.video {
                    info!(
                        path = %video.path.display(),
                        frames = video.frames,
                        bytes = video.size_bytes,
                        "Incident video saved"
                    );
                }
            }
            Ok(None) => break,
            Err(e) => warn!(error = %e, "Incident recording failed"),
        }
    }
    debug!("Recording driver stopped");
}

async fn accel_loop(
    source: Arc<dyn SampleSource>,
    orchestrator: Arc<Orchestrator>,
    latest: Arc<Latest>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(period);
    while tick(&mut interval, &mut shutdown).await {
        match source.next_accel().await {
            Ok(sample) => {
                let status = orchestrator.on_accel(&sample);
                let mut readings = latest.lock();
                readings.accel = Some(sample);
                readings.status = status;
            }
            Err(e) => warn!(error = %e, "Accelerometer read failed"),
        }
    }
    debug!("Accelerometer loop stopped");
}

struct SpeedLoop {
    source: Arc<dyn SampleSource>,
    orchestrator: Arc<Orchestrator>,
    capture: Arc<CaptureBuffer>,
    queue: Arc<DeliveryQueue>,
    latest: Arc<Latest>,
    pipeline: PipelineConfig,
    motion: MotionConfig,
}

async fn speed_loop(ctx: SpeedLoop, mut shutdown: watch::Receiver<bool>) {
    let mut interval = ticker(ctx.pipeline.speed_interval());
    let mut tracker: Option<MotionTracker> = None;
    let mut last_snapshot: Option<Instant> = None;

    while tick(&mut interval, &mut shutdown).await {
        let sample = match ctx.source.next_speed().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Speed read failed");
                continue;
            }
        };

        ctx.orchestrator.on_speed(&sample);

        let linear_accel = {
            let mut readings = ctx.latest.lock();
            readings.speed = Some(sample);
            readings.accel.map(|a| a.linear).unwrap_or([0.0; 3])
        };

        let tracker =
            tracker.get_or_insert_with(|| MotionTracker::new(ctx.motion.clone(), sample.timestamp));
        let change = tracker.observe(MotionSample {
            timestamp: sample.timestamp,
            speed_kmh: sample.speed_kmh,
            linear_accel,
            gps: sample.gps,
        });
        if let Some(change) = change {
            ctx.queue.enqueue(kind::VEHICLE_STATE_CHANGE, change.to_payload());
        }

        maybe_snapshot(&ctx.capture, &ctx.pipeline, sample.speed_kmh, &mut last_snapshot);
    }
    debug!("Speed loop stopped");
}

/// Save the latest frame when over the speed limit, rate limited
fn maybe_snapshot(
    capture: &CaptureBuffer,
    config: &PipelineConfig,
    speed_kmh: f64,
    last: &mut Option<Instant>,
) {
    if speed_kmh <= config.overspeed_kmh {
        return;
    }
    let now = Instant::now();
    if last.is_some_and(|t| now.saturating_duration_since(t) < config.snapshot_interval()) {
        return;
    }
    let Some(frame) = capture.latest_frame() else {
        debug!("Overspeed without a frame to save");
        return;
    };

    let name = format!(
        "overspeed_{}_speed_{:.0}.jpg",
        Local::now().format("%Y%m%d_%H%M%S"),
        speed_kmh
    );
    match write_snapshot(&frame, &config.snapshot_dir, &name) {
        Ok(path) => {
            *last = Some(now);
            info!(path = %path.display(), speed_kmh, "Overspeed snapshot saved");
        }
        Err(e) => warn!(error = %e, "Overspeed snapshot failed"),
    }
}

async fn telemetry_loop(
    queue: Arc<DeliveryQueue>,
    latest: Arc<Latest>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(period);
    while tick(&mut interval, &mut shutdown).await {
        let readings = *latest.lock();
        let Some(accel) = readings.accel else {
            continue;
        };
        let speed = readings.speed.map(|s| s.speed_kmh).unwrap_or(0.0);

        push_reading(
            &queue,
            &AccelerometerReading {
                accel_x: accel.accel[0],
                accel_y: accel.accel[1],
                accel_z: accel.accel[2],
                acc_magnitude: accel.magnitude(),
                speed,
                status: readings.status.as_str().to_string(),
            },
        );

        if let Some(SpeedSample {
            gps: Some(fix),
            speed_kmh,
            ..
        }) = readings.speed
        {
            push_reading(
                &queue,
                &GpsReading {
                    longitude: fix.longitude,
                    latitude: fix.latitude,
                    speed: speed_kmh,
                },
            );
        }
    }
    debug!("Telemetry loop stopped");
}

fn push_reading<R: Reading>(queue: &DeliveryQueue, reading: &R) {
    match reading.to_envelope() {
        Ok(envelope) => {
            queue.push(envelope);
        }
        Err(e) => warn!(kind = R::KIND, error = %e, "Reading not serializable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedSource, SimulationConfig};
    use crate::source::SourceError;
    use camera_capture::CaptureConfig;
    use cloud_sync::ManualConnectivity;
    use serde_json::json;
    use std::path::Path;
    use storage::RetentionConfig;

    fn test_config(dir: &Path, crash_after: Option<f64>) -> BlackboxConfig {
        let mut config = BlackboxConfig::default();
        config.capture = CaptureConfig {
            fps: 5,
            pretrigger_seconds: 1,
            posttrigger_seconds: 1,
            output_dir: dir.join("incidents"),
        };
        config.retention = RetentionConfig {
            segment_dir: dir.join("segments"),
            fps: 5,
            ..Default::default()
        };
        config.queue.cache_path = dir.join("cache.json");
        config.pipeline.snapshot_dir = dir.join("snapshots");
        config.pipeline.cloud_enabled = false;
        config.alert.signal_reset_seconds = 2;
        config.simulation = SimulationConfig {
            width: 32,
            height: 24,
            crash_after_seconds: crash_after,
            ..Default::default()
        };
        config
    }

    fn collaborators(config: &BlackboxConfig) -> Collaborators {
        Collaborators {
            source: Arc::new(SimulatedSource::new(config.simulation.clone())),
            publisher: None,
            connectivity: Arc::new(ManualConnectivity::new(false)),
            monitor: None,
        }
    }

    fn files_in(dir: &Path, ext: &str) -> Vec<String> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.ends_with(ext))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_open_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), None);
        config.simulation.fail_camera = true;
        let (_tx, rx) = watch::channel(false);

        let result = Pipeline::start(config.clone(), collaborators(&config), rx).await;
        assert!(matches!(
            result,
            Err(BlackboxError::Source(SourceError::Open(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_crash_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), Some(3.0));
        let (tx, rx) = watch::channel(false);

        let pipeline = Pipeline::start(config.clone(), collaborators(&config), rx)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        tx.send(true).unwrap();
        let queue = Arc::clone(pipeline.queue());
        pipeline.join().await;

        let envelopes = queue.snapshot();
        let signals: Vec<_> = envelopes
            .iter()
            .filter(|e| e.kind == kind::ACCIDENT)
            .map(|e| e.payload.clone())
            .collect();
        assert_eq!(signals, vec![json!({ "accident": 1 }), json!({ "accident": 0 })]);

        assert!(envelopes.iter().any(|e| e.kind == kind::VEHICLE_STATE_CHANGE
            && e.payload["newSta"] == "RUNNING"));
        assert!(envelopes.iter().any(|e| e.kind == kind::ACCELEROMETER));
        assert!(envelopes.iter().any(|e| e.kind == kind::GPS));

        assert_eq!(files_in(&dir.path().join("incidents"), ".avi").len(), 1);
        assert!(!files_in(&dir.path().join("segments"), ".avi").is_empty());
        assert!(!files_in(&dir.path().join("snapshots"), ".jpg").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_drive_raises_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), None);
        let (tx, rx) = watch::channel(false);

        let pipeline = Pipeline::start(config.clone(), collaborators(&config), rx)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!pipeline.capture().is_recording());

        let queue = Arc::clone(pipeline.queue());
        pipeline.stop(&tx).await;
        assert!(tx.is_closed());

        assert!(queue.snapshot().iter().all(|e| e.kind != kind::ACCIDENT));
        assert!(files_in(&dir.path().join("incidents"), ".avi").is_empty());
    }
}
