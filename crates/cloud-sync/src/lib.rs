//! Cloud Synchronization Module
//!
//! Telemetry delivery with:
//! - Bounded in-memory queue mirrored to an on-disk cache
//! - Replay of cached envelopes after restart
//! - Connectivity-gated, at-least-once publishing over MQTT

mod cache;
mod connectivity;
mod envelope;
mod publisher;
mod queue;

pub use cache::{read_cache, write_cache, CacheRecord};
pub use connectivity::{Connectivity, ConnectivityConfig, ConnectivityMonitor, ManualConnectivity};
pub use envelope::{
    kind, AccelerometerReading, AlcoholReading, GpsReading, Reading, TelemetryEnvelope,
    TemperatureReading,
};
pub use publisher::{MqttConfig, MqttPublisher, Publisher};
pub use queue::{DeliveryQueue, DrainReport, QueueConfig};

use thiserror::Error;

/// Cloud sync error types
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
