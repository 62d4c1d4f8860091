//! Vehicle motion state tracking
//!
//! Classifies the vehicle as running, temporarily stopped, or parked from
//! short windows of speed, linear acceleration and GPS samples.

use ring_buffer::RingBuffer;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

/// Mean Earth radius (km)
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Coarse vehicle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleState {
    /// Temporarily stopped with engine on
    #[serde(rename = "STOPPED")]
    Stopped,
    /// Stopped for longer than the idle timeout
    #[serde(rename = "PARKED")]
    Parked,
    /// In motion
    #[serde(rename = "RUNNING")]
    Running,
}

impl VehicleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleState::Stopped => "STOPPED",
            VehicleState::Parked => "PARKED",
            VehicleState::Running => "RUNNING",
        }
    }
}

/// GPS position fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
}

/// One combined motion observation
#[derive(Debug, Clone, Copy)]
pub struct MotionSample {
    /// Seconds
    pub timestamp: f64,
    pub speed_kmh: f64,
    /// Linear acceleration vector (m/s²)
    pub linear_accel: [f64; 3],
    pub gps: Option<GpsFix>,
}

/// Motion tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Mean speed above which the vehicle is moving (km/h)
    pub speed_threshold_kmh: f64,
    /// Mean linear acceleration above which the vehicle is moving (m/s²)
    pub accel_threshold: f64,
    /// GPS path length above which the vehicle is moving (km)
    pub gps_distance_threshold_km: f64,
    /// Stopped time after which the vehicle counts as parked (seconds)
    pub idle_timeout_s: f64,
    /// Samples required before a signal takes part in the decision
    pub min_samples: usize,
    pub gps_window: usize,
    pub accel_window: usize,
    pub speed_window: usize,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            speed_threshold_kmh: 2.0,
            accel_threshold: 0.15,
            gps_distance_threshold_km: 0.003,
            idle_timeout_s: 300.0,
            min_samples: 3,
            gps_window: 5,
            accel_window: 10,
            speed_window: 5,
        }
    }
}

/// Transition between two vehicle states
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub previous: VehicleState,
    pub current: VehicleState,
    /// Time spent in the previous state (seconds)
    pub duration_s: f64,
}

impl StateChange {
    /// Telemetry payload for the change
    pub fn to_payload(&self) -> serde_json::Value {
        json!({
            "preSta": self.previous.as_str(),
            "newSta": self.current.as_str(),
            "duration": format_duration(self.duration_s),
        })
    }
}

/// Tracks the vehicle state across samples
pub struct MotionTracker {
    config: MotionConfig,
    current: VehicleState,
    state_since: f64,
    gps: RingBuffer<GpsFix>,
    accel: RingBuffer<[f64; 3]>,
    speeds: RingBuffer<f64>,
}

impl MotionTracker {
    /// Start in the stopped state at `now` (seconds)
    pub fn new(config: MotionConfig, now: f64) -> Self {
        Self {
            gps: RingBuffer::new(config.gps_window),
            accel: RingBuffer::new(config.accel_window),
            speeds: RingBuffer::new(config.speed_window),
            current: VehicleState::Stopped,
            state_since: now,
            config,
        }
    }

    pub fn current(&self) -> VehicleState {
        self.current
    }

    /// Record a sample and return the transition it caused, if any
    pub fn observe(&mut self, sample: MotionSample) -> Option<StateChange> {
        if let Some(fix) = sample.gps {
            self.gps.push(fix);
        }
        self.speeds.push(sample.speed_kmh);
        self.accel.push(sample.linear_accel);

        let moving = self.is_moving();
        let next = if moving {
            VehicleState::Running
        } else if sample.timestamp - self.state_since > self.config.idle_timeout_s {
            VehicleState::Parked
        } else {
            VehicleState::Stopped
        };

        if next == self.current {
            return None;
        }

        let change = StateChange {
            previous: self.current,
            current: next,
            duration_s: (sample.timestamp - self.state_since).max(0.0),
        };
        info!(
            previous = change.previous.as_str(),
            current = change.current.as_str(),
            duration = %format_duration(change.duration_s),
            "Vehicle state changed"
        );
        self.current = next;
        self.state_since = sample.timestamp;
        Some(change)
    }

    fn is_moving(&self) -> bool {
        let by_speed = self.speed_moving();
        let by_accel = self.accel_moving();
        let by_gps = self.gps_moving();
        debug!(by_speed, by_accel, by_gps, "Movement status");
        by_speed || by_accel || by_gps
    }

    fn speed_moving(&self) -> bool {
        if self.speeds.len() < self.config.min_samples {
            return false;
        }
        let mean = self.speeds.iter().sum::<f64>() / self.speeds.len() as f64;
        mean > self.config.speed_threshold_kmh
    }

    fn accel_moving(&self) -> bool {
        if self.accel.len() < self.config.min_samples {
            return false;
        }
        let mean = self
            .accel
            .iter()
            .map(|[x, y, z]| (x * x + y * y + z * z).sqrt())
            .sum::<f64>()
            / self.accel.len() as f64;
        mean > self.config.accel_threshold
    }

    fn gps_moving(&self) -> bool {
        if self.gps.len() < self.config.min_samples {
            return false;
        }
        let fixes: Vec<_> = self.gps.iter().copied().collect();
        let distance: f64 = fixes.windows(2).map(|w| haversine_km(w[0], w[1])).sum();
        distance > self.config.gps_distance_threshold_km
    }
}

/// Great-circle distance between two fixes (km)
pub fn haversine_km(a: GpsFix, b: GpsFix) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Human-readable duration, e.g. `1h 2m 3s`
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{secs}s"));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn still(t: f64) -> MotionSample {
        MotionSample {
            timestamp: t,
            speed_kmh: 0.0,
            linear_accel: [0.0, 0.0, 0.0],
            gps: Some(GpsFix {
                latitude: 10.825225,
                longitude: 106.706718,
            }),
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "0s");
        assert_eq!(format_duration(59.9), "59s");
        assert_eq!(format_duration(3723.0), "1h 2m 3s");
        assert_eq!(format_duration(7200.0), "2h");
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let a = GpsFix { latitude: 0.0, longitude: 0.0 };
        let b = GpsFix { latitude: 1.0, longitude: 0.0 };
        assert!((haversine_km(a, b) - 111.19).abs() < 0.1);
    }

    #[test]
    fn test_speed_moves_to_running() {
        let mut tracker = MotionTracker::new(MotionConfig::default(), 0.0);
        let mut changes = Vec::new();
        for i in 0..3 {
            let sample = MotionSample {
                speed_kmh: 40.0,
                ..still(i as f64)
            };
            if let Some(change) = tracker.observe(sample) {
                changes.push(change);
            }
        }
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, VehicleState::Stopped);
        assert_eq!(changes[0].current, VehicleState::Running);
        assert_eq!(tracker.current(), VehicleState::Running);
    }

    #[test]
    fn test_fewer_than_min_samples_stays_stopped() {
        let mut tracker = MotionTracker::new(MotionConfig::default(), 0.0);
        for i in 0..2 {
            let sample = MotionSample {
                speed_kmh: 80.0,
                ..still(i as f64)
            };
            assert!(tracker.observe(sample).is_none());
        }
    }

    #[test]
    fn test_idle_timeout_parks() {
        let mut tracker = MotionTracker::new(MotionConfig::default(), 0.0);
        assert!(tracker.observe(still(100.0)).is_none());
        let change = tracker.observe(still(301.0)).unwrap();
        assert_eq!(change.current, VehicleState::Parked);

        let payload = change.to_payload();
        assert_eq!(payload["preSta"], "STOPPED");
        assert_eq!(payload["newSta"], "PARKED");
        assert_eq!(payload["duration"], "5m 1s");
    }

    #[test]
    fn test_gps_track_counts_as_movement() {
        let mut tracker = MotionTracker::new(MotionConfig::default(), 0.0);
        let mut last = None;
        for i in 0..4 {
            let sample = MotionSample {
                gps: Some(GpsFix {
                    latitude: 10.0 + i as f64 * 0.001,
                    longitude: 106.0,
                }),
                ..still(i as f64)
            };
            last = tracker.observe(sample).or(last);
        }
        assert_eq!(last.map(|c| c.current), Some(VehicleState::Running));
    }
}
