//! Simulated vehicle
//!
//! Produces synthetic frames and motion samples so the pipeline runs without
//! hardware. An optional scripted crash injects an acceleration spike
//! followed by a sudden stop.

use accident_detector::{GpsFix, STANDARD_GRAVITY};
use async_trait::async_trait;
use camera_capture::Frame;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::info;

use crate::source::{AccelSample, SampleSource, SourceError, SpeedSample};

/// Length of the scripted acceleration spike (seconds)
const CRASH_SPIKE_S: f64 = 0.5;

/// Delay between the spike onset and the vehicle standing still (seconds)
const CRASH_STOP_S: f64 = 0.3;

const KM_PER_DEGREE: f64 = 111.0;

/// Simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub width: u32,
    pub height: u32,
    pub cruise_speed_kmh: f64,
    /// Seconds after start at which the scripted crash happens
    pub crash_after_seconds: Option<f64>,
    /// Make `open_camera` fail
    pub fail_camera: bool,
    pub start_latitude: f64,
    pub start_longitude: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            cruise_speed_kmh: 60.0,
            crash_after_seconds: None,
            fail_camera: false,
            start_latitude: 10.762622,
            start_longitude: 106.660172,
        }
    }
}

struct Track {
    position: GpsFix,
    last_t: f64,
}

/// [`SampleSource`] backed by synthetic data
pub struct SimulatedSource {
    config: SimulationConfig,
    started: Instant,
    epoch_base: f64,
    camera_open: AtomicBool,
    frame_seq: AtomicU64,
    track: Mutex<Track>,
}

impl SimulatedSource {
    pub fn new(config: SimulationConfig) -> Self {
        let epoch_base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let position = GpsFix {
            latitude: config.start_latitude,
            longitude: config.start_longitude,
        };
        Self {
            config,
            started: Instant::now(),
            epoch_base,
            camera_open: AtomicBool::new(false),
            frame_seq: AtomicU64::new(0),
            track: Mutex::new(Track { position, last_t: 0.0 }),
        }
    }

    /// Seconds since the source was created
    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Seconds since the scripted crash, if it has happened
    fn since_crash(&self, t: f64) -> Option<f64> {
        self.config
            .crash_after_seconds
            .map(|at| t - at)
            .filter(|d| *d >= 0.0)
    }

    fn speed_at(&self, t: f64) -> f64 {
        match self.since_crash(t) {
            Some(d) if d >= CRASH_STOP_S => 0.0,
            _ => (self.config.cruise_speed_kmh + 3.0 * (t / 7.0).sin()).max(0.0),
        }
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let (w, h) = (self.config.width.max(1), self.config.height.max(1));
        let bar = ((sequence * 4) % u64::from(w)) as u32;
        let mut rgb = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                if x >= bar && x < bar + 8 {
                    rgb.extend_from_slice(&[255, 255, 255]);
                } else {
                    rgb.push((x * 255 / w) as u8);
                    rgb.push((y * 255 / h) as u8);
                    rgb.push(128);
                }
            }
        }
        rgb
    }
}

/// Small deterministic jitter in [-amplitude, amplitude]
fn jitter(t: f64, seed: f64, amplitude: f64) -> f64 {
    ((t * 12.9898 + seed * 78.233).sin() * 43_758.545).fract() * amplitude
}

#[async_trait]
impl SampleSource for SimulatedSource {
    async fn open_camera(&self) -> Result<(), SourceError> {
        if self.config.fail_camera {
            return Err(SourceError::Open("simulated camera unavailable".into()));
        }
        self.camera_open.store(true, Ordering::SeqCst);
        info!(
            width = self.config.width,
            height = self.config.height,
            crash_after = ?self.config.crash_after_seconds,
            "Simulated camera opened"
        );
        Ok(())
    }

    async fn next_frame(&self) -> Result<Frame, SourceError> {
        if !self.camera_open.load(Ordering::SeqCst) {
            return Err(SourceError::NotOpen("camera"));
        }
        let sequence = self.frame_seq.fetch_add(1, Ordering::Relaxed);
        let timestamp_ms = ((self.epoch_base + self.elapsed()) * 1000.0) as u64;
        let frame = Frame::from_rgb(
            self.render(sequence),
            self.config.width.max(1),
            self.config.height.max(1),
            timestamp_ms,
            sequence,
        )?;
        Ok(frame)
    }

    async fn next_accel(&self) -> Result<AccelSample, SourceError> {
        let t = self.elapsed();
        let linear = match self.since_crash(t) {
            Some(d) if d < CRASH_SPIKE_S => [3.0 * STANDARD_GRAVITY, 0.5 * STANDARD_GRAVITY, 0.0],
            _ => [jitter(t, 1.0, 0.05), jitter(t, 2.0, 0.05), jitter(t, 3.0, 0.05)],
        };
        Ok(AccelSample {
            timestamp: self.epoch_base + t,
            accel: [linear[0], linear[1], linear[2] + STANDARD_GRAVITY],
            linear,
        })
    }

    async fn next_speed(&self) -> Result<SpeedSample, SourceError> {
        let t = self.elapsed();
        let speed_kmh = self.speed_at(t);

        let position = {
            let mut track = self.track.lock().unwrap_or_else(PoisonError::into_inner);
            let hours = (t - track.last_t).max(0.0) / 3600.0;
            track.position.latitude += speed_kmh * hours / KM_PER_DEGREE;
            track.last_t = t;
            track.position
        };

        Ok(SpeedSample {
            timestamp: self.epoch_base + t,
            speed_kmh,
            gps: Some(position),
        })
    }
}
