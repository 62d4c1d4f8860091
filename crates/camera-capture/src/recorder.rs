//! Triggered incident recording
//!
//! Frames are pushed into a pre-trigger ring sized to `fps × pretrigger`.
//! A trigger snapshots the ring and opens a recording session; frames pushed
//! afterwards are queued for the recorder until the session reaches its
//! frame target or its deadline. The ring, the queue and the session flag
//! share one lock so a trigger never races a frame push.

use metrics::{counter, gauge};
use ring_buffer::RingBuffer;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::sink::{FinishedVideo, SinkFactory, VideoSink};
use crate::{CaptureConfig, CaptureError};

/// Idle wait between queue polls while a session is open
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct FrameState {
    ring: RingBuffer<Frame>,
    queue: VecDeque<Frame>,
    active: bool,
    pending: Option<PendingTrigger>,
}

struct PendingTrigger {
    pre_frames: Vec<Frame>,
    triggered_at: Instant,
}

/// Progress of one triggered recording
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub triggered_at: Instant,
    /// Trigger time plus pre-trigger and post-trigger duration
    pub deadline: Instant,
    pub target_frames: u64,
    pub pre_trigger_frames: u64,
    pub frames_written: u64,
}

impl RecordingSession {
    pub fn is_complete(&self, now: Instant) -> bool {
        self.frames_written >= self.target_frames || now >= self.deadline
    }
}

/// Result of a finished recording
#[derive(Debug, Clone)]
pub struct RecordingSummary {
    /// Output file; `None` when no frame was available
    pub video: Option<FinishedVideo>,
    pub frames_written: u64,
    pub pre_trigger_frames: u64,
    pub elapsed: Duration,
    /// Stopped early by shutdown
    pub interrupted: bool,
}

/// Pre-trigger ring plus triggered recording state
pub struct CaptureBuffer {
    config: CaptureConfig,
    state: Mutex<FrameState>,
    triggered: Notify,
}

impl CaptureBuffer {
    pub fn new(config: CaptureConfig) -> Result<Self, CaptureError> {
        config.validate()?;
        info!(
            fps = config.fps,
            pretrigger = config.pretrigger_seconds,
            posttrigger = config.posttrigger_seconds,
            "Creating capture buffer"
        );
        Ok(Self {
            state: Mutex::new(FrameState {
                ring: RingBuffer::new(config.required_pre_frames()),
                queue: VecDeque::new(),
                active: false,
                pending: None,
            }),
            triggered: Notify::new(),
            config,
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a captured frame to the ring and, while recording, to the queue
    pub fn push_frame(&self, frame: Frame) {
        let limit = self.config.target_frames() as usize;
        let mut state = self.lock();
        if state.active {
            if state.queue.len() >= limit {
                state.queue.pop_front();
            }
            state.queue.push_back(frame.clone());
        }
        state.ring.push(frame);
        let fill = state.ring.fill_ratio();
        drop(state);
        gauge!("capture_pretrigger_fill_ratio").set(fill);
    }

    /// Share of the pre-trigger window currently buffered (0.0 to 1.0)
    pub fn pretrigger_fill(&self) -> f64 {
        self.lock().ring.fill_ratio()
    }

    /// Start a recording session
    ///
    /// Returns `false` without side effects when a session is already open.
    pub fn trigger(&self) -> bool {
        let mut state = self.lock();
        if state.active {
            debug!("Recording already in progress, trigger ignored");
            return false;
        }

        let pre_frames = state.ring.read_last(self.config.required_pre_frames());
        let count = pre_frames.len();
        state.active = true;
        state.queue.clear();
        state.pending = Some(PendingTrigger {
            pre_frames,
            triggered_at: Instant::now(),
        });
        drop(state);

        self.triggered.notify_one();
        counter!("capture_triggers_total").increment(1);
        info!(pre_frames = count, "Incident recording triggered");
        true
    }

    /// Whether a session is open
    pub fn is_recording(&self) -> bool {
        self.lock().active
    }

    /// Most recent frame in the ring
    pub fn latest_frame(&self) -> Option<Frame> {
        self.lock().ring.latest().cloned()
    }

    /// Frames currently held in the pre-trigger ring
    pub fn buffered_frames(&self) -> usize {
        self.lock().ring.len()
    }

    /// Wait for the next trigger and record it to completion
    ///
    /// Returns `Ok(None)` when shutdown is signalled before a trigger arrives.
    /// A session already triggered when shutdown arrives still has its
    /// pre-trigger frames written.
    pub async fn record_next(
        &self,
        factory: &dyn SinkFactory,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<RecordingSummary>, CaptureError> {
        loop {
            let pending = self.lock().pending.take();
            if let Some(pending) = pending {
                let result = self.record(pending, factory, shutdown).await;
                self.end_session();
                return result.map(Some);
            }

            if *shutdown.borrow() {
                return Ok(None);
            }

            tokio::select! {
                _ = self.triggered.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn record(
        &self,
        pending: PendingTrigger,
        factory: &dyn SinkFactory,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<RecordingSummary, CaptureError> {
        let mut session = RecordingSession {
            triggered_at: pending.triggered_at,
            deadline: pending.triggered_at + self.config.total_duration(),
            target_frames: self.config.target_frames(),
            pre_trigger_frames: pending.pre_frames.len() as u64,
            frames_written: 0,
        };

        let mut sink: Option<Box<dyn VideoSink>> = None;
        let outcome = self
            .drain(&mut session, &mut sink, pending.pre_frames, factory, shutdown)
            .await;
        let finished = sink.map(|s| s.finish()).transpose();

        if let Err(e) = &outcome {
            warn!(error = %e, frames = session.frames_written, "Incident recording failed");
        }
        let interrupted = outcome?;
        let video = finished?;

        let summary = RecordingSummary {
            video,
            frames_written: session.frames_written,
            pre_trigger_frames: session.pre_trigger_frames,
            elapsed: Instant::now().saturating_duration_since(session.triggered_at),
            interrupted,
        };

        counter!("capture_frames_recorded_total").increment(summary.frames_written);
        info!(
            frames = summary.frames_written,
            pre_trigger = summary.pre_trigger_frames,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            interrupted,
            path = ?summary.video.as_ref().map(|v| v.path.display().to_string()),
            "Incident recording finished"
        );
        Ok(summary)
    }

    /// Write the pre-trigger frames, then queued frames until complete
    ///
    /// Returns whether shutdown cut the session short.
    async fn drain(
        &self,
        session: &mut RecordingSession,
        sink: &mut Option<Box<dyn VideoSink>>,
        pre_frames: Vec<Frame>,
        factory: &dyn SinkFactory,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<bool, CaptureError> {
        for frame in pre_frames.iter().take(session.target_frames as usize) {
            write_frame(sink, factory, frame)?;
            session.frames_written += 1;
        }

        loop {
            let now = Instant::now();
            if session.is_complete(now) {
                return Ok(false);
            }
            if *shutdown.borrow() {
                debug!("Shutdown during incident recording");
                return Ok(true);
            }

            let next = self.lock().queue.pop_front();
            match next {
                Some(frame) => {
                    write_frame(sink, factory, &frame)?;
                    session.frames_written += 1;
                }
                None => sleep_until((now + POLL_INTERVAL).min(session.deadline)).await,
            }
        }
    }

    fn end_session(&self) {
        let mut state = self.lock();
        state.active = false;
        state.queue.clear();
    }
}

fn write_frame(
    sink: &mut Option<Box<dyn VideoSink>>,
    factory: &dyn SinkFactory,
    frame: &Frame,
) -> Result<(), CaptureError> {
    if sink.is_none() {
        *sink = Some(factory.create(frame)?);
    }
    if let Some(sink) = sink.as_mut() {
        sink.write_frame(frame)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct MemoryFactory {
        sequences: Arc<Mutex<Vec<u64>>>,
        created: Arc<AtomicUsize>,
    }

    struct MemorySink {
        sequences: Arc<Mutex<Vec<u64>>>,
        count: u64,
    }

    impl VideoSink for MemorySink {
        fn write_frame(&mut self, frame: &Frame) -> Result<(), CaptureError> {
            self.sequences.lock().unwrap().push(frame.sequence);
            self.count += 1;
            Ok(())
        }

        fn frames_written(&self) -> u64 {
            self.count
        }

        fn finish(self: Box<Self>) -> Result<FinishedVideo, CaptureError> {
            Ok(FinishedVideo {
                path: PathBuf::from("memory.avi"),
                frames: self.count,
                size_bytes: 0,
            })
        }
    }

    impl SinkFactory for MemoryFactory {
        fn create(&self, _first: &Frame) -> Result<Box<dyn VideoSink>, CaptureError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MemorySink {
                sequences: Arc::clone(&self.sequences),
                count: 0,
            }))
        }
    }

    fn small_config() -> CaptureConfig {
        CaptureConfig {
            fps: 2,
            pretrigger_seconds: 2,
            posttrigger_seconds: 1,
            ..Default::default()
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![0xFFu8, 0xD8], 2, 2, sequence * 500, sequence)
    }

    #[test]
    fn test_pretrigger_fill() {
        let buffer = CaptureBuffer::new(small_config()).unwrap();
        assert_eq!(buffer.pretrigger_fill(), 0.0);
        buffer.push_frame(frame(0));
        assert!((buffer.pretrigger_fill() - 0.25).abs() < 1e-9);
        for i in 1..10 {
            buffer.push_frame(frame(i));
        }
        assert!((buffer.pretrigger_fill() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ring_holds_pretrigger_window() {
        let buffer = CaptureBuffer::new(small_config()).unwrap();
        for i in 0..10 {
            buffer.push_frame(frame(i));
        }
        assert_eq!(buffer.buffered_frames(), 4);
        assert_eq!(buffer.latest_frame().map(|f| f.sequence), Some(9));
    }

    #[test]
    fn test_trigger_while_active_is_ignored() {
        let buffer = CaptureBuffer::new(small_config()).unwrap();
        assert!(buffer.trigger());
        assert!(buffer.is_recording());
        assert!(!buffer.trigger());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_ends_at_frame_target() {
        let buffer = CaptureBuffer::new(small_config()).unwrap();
        let factory = MemoryFactory::default();
        let (_tx, mut rx) = watch::channel(false);

        for i in 0..10 {
            buffer.push_frame(frame(i));
        }
        assert!(buffer.trigger());
        for i in 10..14 {
            buffer.push_frame(frame(i));
        }

        let summary = buffer.record_next(&factory, &mut rx).await.unwrap().unwrap();
        assert_eq!(summary.frames_written, 6);
        assert_eq!(summary.pre_trigger_frames, 4);
        assert!(!summary.interrupted);
        assert_eq!(*factory.sequences.lock().unwrap(), vec![6, 7, 8, 9, 10, 11]);
        assert!(!buffer.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_ends_at_deadline() {
        let buffer = CaptureBuffer::new(small_config()).unwrap();
        let factory = MemoryFactory::default();
        let (_tx, mut rx) = watch::channel(false);

        buffer.push_frame(frame(0));
        buffer.trigger();

        let summary = buffer.record_next(&factory, &mut rx).await.unwrap().unwrap();
        assert_eq!(summary.frames_written, 1);
        assert!(summary.elapsed >= Duration::from_secs(3));
        assert!(summary.elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_frames_creates_no_file() {
        let buffer = CaptureBuffer::new(small_config()).unwrap();
        let factory = MemoryFactory::default();
        let (_tx, mut rx) = watch::channel(false);

        buffer.trigger();
        let summary = buffer.record_next(&factory, &mut rx).await.unwrap().unwrap();
        assert!(summary.video.is_none());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_keeps_pretrigger_frames() {
        let buffer = CaptureBuffer::new(small_config()).unwrap();
        let factory = MemoryFactory::default();
        let (tx, mut rx) = watch::channel(false);

        for i in 0..3 {
            buffer.push_frame(frame(i));
        }
        buffer.trigger();
        tx.send(true).unwrap();

        let summary = buffer.record_next(&factory, &mut rx).await.unwrap().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.frames_written, 3);
        assert!(summary.video.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_trigger_returns_none() {
        let buffer = Arc::new(CaptureBuffer::new(small_config()).unwrap());
        let factory = MemoryFactory::default();
        let (tx, mut rx) = watch::channel(false);

        let task = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.record_next(&factory, &mut rx).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        assert!(task.await.unwrap().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_wakes_waiting_recorder() {
        let buffer = Arc::new(CaptureBuffer::new(small_config()).unwrap());
        let factory = MemoryFactory::default();
        let (_tx, mut rx) = watch::channel(false);

        let task = {
            let buffer = Arc::clone(&buffer);
            let factory = factory.clone();
            tokio::spawn(async move { buffer.record_next(&factory, &mut rx).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        buffer.push_frame(frame(0));
        buffer.trigger();
        buffer.push_frame(frame(1));

        let summary = task.await.unwrap().unwrap().unwrap();
        assert_eq!(summary.frames_written, 2);
        assert_eq!(*factory.sequences.lock().unwrap(), vec![0, 1]);

        // A new session can start once the previous one finished
        assert!(buffer.trigger());
    }
}
