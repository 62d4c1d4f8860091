//! On-disk telemetry cache
//!
//! The cache is a single JSON array of `{timestamp, sensor_type, data, id}`
//! records, rewritten in full through a temporary file and a rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

use crate::envelope::TelemetryEnvelope;
use crate::CloudError;

/// One cached envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub timestamp: DateTime<Utc>,
    pub sensor_type: String,
    pub data: Value,
    /// Absent in caches written before envelopes carried ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

impl From<&TelemetryEnvelope> for CacheRecord {
    fn from(envelope: &TelemetryEnvelope) -> Self {
        Self {
            timestamp: envelope.timestamp,
            sensor_type: envelope.kind.clone(),
            data: envelope.payload.clone(),
            id: Some(envelope.id),
        }
    }
}

impl CacheRecord {
    /// Envelope for this record; records without an id get a fresh one
    pub fn into_envelope(self) -> TelemetryEnvelope {
        let mut envelope = TelemetryEnvelope::with_timestamp(self.sensor_type, self.data, self.timestamp);
        if let Some(id) = self.id {
            envelope.id = id;
        }
        envelope
    }

    /// Same content as `envelope`, ignoring ids
    pub fn matches(&self, envelope: &TelemetryEnvelope) -> bool {
        self.timestamp == envelope.timestamp
            && self.sensor_type == envelope.kind
            && self.data == envelope.payload
    }
}

/// Read the cache at `path`
///
/// A missing file is an empty cache. Records that fail to parse are skipped
/// with a warning; a file that is not a JSON array is an error.
pub fn read_cache(path: &Path) -> Result<Vec<CacheRecord>, CloudError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let raw: Vec<Value> = serde_json::from_slice(&bytes)
        .map_err(|e| CloudError::Cache(format!("{}: {e}", path.display())))?;

    let mut records = Vec::with_capacity(raw.len());
    for (i, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<CacheRecord>(value) {
            Ok(record) => records.push(record),
            Err(e) => warn!(index = i, error = %e, "Skipping malformed cache record"),
        }
    }
    Ok(records)
}

/// Atomically replace the cache at `path` with `records`
pub fn write_cache(path: &Path, records: &[CacheRecord]) -> Result<(), CloudError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);

    let data = serde_json::to_vec_pretty(records)?;
    let mut file = fs::File::create(tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = read_cache(&dir.path().join("cache.json")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");
        let envelope = TelemetryEnvelope::accident_signal(1);

        write_cache(&path, &[CacheRecord::from(&envelope)]).unwrap();
        let records = read_cache(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].clone().into_envelope(), envelope);
        assert!(!dir.path().join("nested").join("cache.json.tmp").exists());
    }

    #[test]
    fn test_not_an_array_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, b"{\"truncated\": ").unwrap();
        assert!(matches!(read_cache(&path), Err(CloudError::Cache(_))));
    }

    #[test]
    fn test_malformed_records_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let content = json!([
            {"timestamp": "2024-05-01T10:00:00Z", "sensor_type": "temperature", "data": {"temperature": 30.5}},
            {"sensor_type": "gps"},
        ]);
        fs::write(&path, content.to_string()).unwrap();

        let records = read_cache(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sensor_type, "temperature");
        assert!(records[0].id.is_none());
    }
}
