//! Blackbox configuration
//!
//! Loaded from an optional TOML file layered under `BLACKBOX__*` environment
//! variables, e.g. `BLACKBOX__QUEUE__MAX_SIZE=2000`.

use accident_detector::{DetectorConfig, MotionConfig, STANDARD_GRAVITY};
use alerting::AlertConfig;
use camera_capture::CaptureConfig;
use cloud_sync::{ConnectivityConfig, MqttConfig, QueueConfig};
use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use storage::RetentionConfig;

use crate::logging::LoggingConfig;
use crate::sim::SimulationConfig;
use crate::BlackboxError;

pub const ENV_PREFIX: &str = "BLACKBOX";

/// Task timing and pipeline-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Accelerometer polling period (~10 Hz)
    pub accel_interval_ms: u64,
    /// Speed/GPS polling period (~1 Hz)
    pub speed_interval_ms: u64,
    /// Period of routine accelerometer/GPS telemetry
    pub telemetry_interval_seconds: u64,
    /// Speed above which an overspeed snapshot is taken (km/h)
    pub overspeed_kmh: f64,
    /// Minimum time between two overspeed snapshots
    pub snapshot_interval_seconds: u64,
    pub snapshot_dir: PathBuf,
    /// Publish queued telemetry; when off, envelopes only accumulate in the cache
    pub cloud_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            accel_interval_ms: 100,
            speed_interval_ms: 1000,
            telemetry_interval_seconds: 3,
            overspeed_kmh: 50.0,
            snapshot_interval_seconds: 10,
            snapshot_dir: PathBuf::from("recordings/snapshots"),
            cloud_enabled: true,
        }
    }
}

impl PipelineConfig {
    pub fn accel_interval(&self) -> Duration {
        Duration::from_millis(self.accel_interval_ms)
    }

    pub fn speed_interval(&self) -> Duration {
        Duration::from_millis(self.speed_interval_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_seconds)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_seconds)
    }
}

/// Complete blackbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackboxConfig {
    /// Acceleration threshold as a multiple of g; overrides `detector.accel_threshold`
    pub accel_threshold_g: Option<f64>,
    pub detector: DetectorConfig,
    pub motion: MotionConfig,
    pub alert: AlertConfig,
    pub capture: CaptureConfig,
    pub retention: RetentionConfig,
    pub queue: QueueConfig,
    pub mqtt: MqttConfig,
    pub connectivity: ConnectivityConfig,
    pub pipeline: PipelineConfig,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,
    /// Prometheus exporter port; disabled when unset
    pub metrics_port: Option<u16>,
}

impl BlackboxConfig {
    /// Load from `path` (if it exists) and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, BlackboxError> {
        Self::load_with_env(path, None)
    }

    /// Load with an explicit environment map instead of the process environment
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<Map<String, String>>,
    ) -> Result<Self, BlackboxError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let mut config: BlackboxConfig = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| BlackboxError::Config(e.to_string()))?;

        if let Some(g) = config.accel_threshold_g {
            config.detector.accel_threshold = g * STANDARD_GRAVITY;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check every section before any task starts
    pub fn validate(&self) -> Result<(), BlackboxError> {
        self.detector.validate()?;
        self.capture.validate()?;
        self.retention.validate()?;
        self.queue.validate()?;

        if self.retention.fps != self.capture.fps {
            return Err(BlackboxError::Config(format!(
                "retention.fps ({}) must match capture.fps ({})",
                self.retention.fps, self.capture.fps
            )));
        }
        if self.pipeline.accel_interval_ms == 0 || self.pipeline.speed_interval_ms == 0 {
            return Err(BlackboxError::Config("polling intervals must be positive".into()));
        }
        if self.pipeline.telemetry_interval_seconds == 0 {
            return Err(BlackboxError::Config(
                "telemetry_interval_seconds must be positive".into(),
            ));
        }
        if self.connectivity.hosts.is_empty() {
            return Err(BlackboxError::Config("connectivity.hosts must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = BlackboxConfig::load_with_env(None, env(&[])).unwrap();
        assert_eq!(config.alert.cooldown_seconds, 30);
        assert_eq!(config.capture.pretrigger_seconds, 20);
        assert_eq!(config.retention.storage_quota_mb, 500);
        assert_eq!(config.queue.max_size, 1000);
        assert_eq!(config.queue.publish_retry_interval_seconds, 5);
        assert!((config.detector.correlation_window_s - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_file_then_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blackbox.toml");
        std::fs::write(
            &path,
            r#"
accel_threshold_g = 2.5

[queue]
max_size = 200
topic = "fleet/telemetry"

[capture]
fps = 15

[retention]
fps = 15
"#,
        )
        .unwrap();

        let config = BlackboxConfig::load_with_env(
            Some(&path),
            env(&[("BLACKBOX__QUEUE__MAX_SIZE", "2000")]),
        )
        .unwrap();

        assert_eq!(config.queue.max_size, 2000);
        assert_eq!(config.queue.topic, "fleet/telemetry");
        assert_eq!(config.capture.fps, 15);
        assert!((config.detector.accel_threshold - 24.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            BlackboxConfig::load_with_env(Some(&dir.path().join("absent.toml")), env(&[])).unwrap();
        assert_eq!(config.pipeline.overspeed_kmh, 50.0);
    }

    #[test]
    fn test_mismatched_fps_rejected() {
        let config = BlackboxConfig::load_with_env(None, env(&[("BLACKBOX__CAPTURE__FPS", "30")]));
        assert!(matches!(config, Err(BlackboxError::Config(_))));
    }

    #[test]
    fn test_invalid_detector_config_rejected() {
        let config = BlackboxConfig::load_with_env(
            None,
            env(&[("BLACKBOX__DETECTOR__ACCEL_OCCURRENCE_MIN", "9")]),
        );
        assert!(matches!(config, Err(BlackboxError::Detector(_))));
    }
}
