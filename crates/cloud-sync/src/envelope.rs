//! Telemetry envelopes and readings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::CloudError;

/// Envelope kinds
pub mod kind {
    pub const ACCELEROMETER: &str = "accelerometer";
    pub const ACCIDENT: &str = "accident";
    pub const GPS: &str = "gps";
    pub const TEMPERATURE: &str = "temperature";
    pub const ALCOHOL: &str = "alcohol";
    pub const VEHICLE_STATE_CHANGE: &str = "vehicle_state_change";
}

/// One outbound telemetry message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub id: Uuid,
    pub kind: String,
    /// Flat JSON object sent as-is on the telemetry topic
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEnvelope {
    /// New envelope stamped with the current time
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self::with_timestamp(kind, payload, Utc::now())
    }

    pub fn with_timestamp(kind: impl Into<String>, payload: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            timestamp,
        }
    }

    /// Accident signal; `1` on an accepted accident, `0` for the reset
    pub fn accident_signal(value: u8) -> Self {
        Self::new(kind::ACCIDENT, json!({ "accident": value }))
    }

    /// Bytes published on the telemetry topic
    pub fn payload_bytes(&self) -> Result<Vec<u8>, CloudError> {
        Ok(serde_json::to_vec(&self.payload)?)
    }
}

/// A sensor reading with a fixed envelope kind
pub trait Reading: Serialize {
    const KIND: &'static str;

    fn to_envelope(&self) -> Result<TelemetryEnvelope, CloudError> {
        Ok(TelemetryEnvelope::new(Self::KIND, serde_json::to_value(self)?))
    }
}

/// Accelerometer telemetry, sent with the current detector status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccelerometerReading {
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub acc_magnitude: f64,
    pub speed: f64,
    /// `Normal` or `PotentialAccident`
    pub status: String,
}

impl Reading for AccelerometerReading {
    const KIND: &'static str = kind::ACCELEROMETER;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsReading {
    pub longitude: f64,
    pub latitude: f64,
    pub speed: f64,
}

impl Reading for GpsReading {
    const KIND: &'static str = kind::GPS;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub temperature: f64,
}

impl Reading for TemperatureReading {
    const KIND: &'static str = kind::TEMPERATURE;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlcoholReading {
    pub alcohol: f64,
}

impl Reading for AlcoholReading {
    const KIND: &'static str = kind::ALCOHOL;
}
