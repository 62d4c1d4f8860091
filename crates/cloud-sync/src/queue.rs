//! Durable telemetry delivery queue
//!
//! Envelopes wait in a bounded in-memory queue that is mirrored to the
//! on-disk cache after every change. The queue lock covers only in-memory
//! state: each change hands a snapshot to the cache writer, which writes the
//! newest one on the blocking pool. A generation counter keeps an older
//! snapshot from replacing a newer one.

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{read_cache, write_cache, CacheRecord};
use crate::connectivity::Connectivity;
use crate::envelope::TelemetryEnvelope;
use crate::publisher::Publisher;
use crate::CloudError;

/// Delivery queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued envelopes; the oldest is dropped beyond this
    pub max_size: usize,
    /// Newest envelopes mirrored to the cache
    pub max_cache_size: usize,
    pub cache_path: PathBuf,
    /// Seconds between publish passes
    pub publish_retry_interval_seconds: u64,
    /// Telemetry topic
    pub topic: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_cache_size: 100,
            cache_path: PathBuf::from("data/telemetry_cache.json"),
            publish_retry_interval_seconds: 5,
            topic: "v1/devices/me/telemetry".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), CloudError> {
        if self.max_size == 0 {
            return Err(CloudError::Config("max_size must be at least 1".into()));
        }
        if self.publish_retry_interval_seconds == 0 {
            return Err(CloudError::Config(
                "publish_retry_interval_seconds must be positive".into(),
            ));
        }
        if self.topic.is_empty() {
            return Err(CloudError::Config("topic must not be empty".into()));
        }
        Ok(())
    }
}

/// Outcome of one publish pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Pass skipped because the link was down
    pub offline: bool,
    pub attempted: usize,
    pub published: usize,
    pub failed: usize,
    /// Envelopes still queued after the pass
    pub remaining: usize,
}

struct QueueState {
    entries: VecDeque<TelemetryEnvelope>,
    generation: u64,
    dropped: u64,
}

/// Writes cache snapshots, coalescing bursts into one write
struct CacheWriter {
    path: PathBuf,
    /// Newest snapshot not yet on disk
    pending: Mutex<Option<(u64, Vec<CacheRecord>)>>,
    /// Generation last written; held for the duration of a write
    written: Mutex<u64>,
    /// A blocking flush is queued and has not started yet
    scheduled: AtomicBool,
}

impl CacheWriter {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            pending: Mutex::new(None),
            written: Mutex::new(0),
            scheduled: AtomicBool::new(false),
        }
    }

    /// Hand over a snapshot; inside a runtime the write happens on the
    /// blocking pool, otherwise inline
    fn submit(self: &Arc<Self>, generation: u64, records: Vec<CacheRecord>) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.as_ref().map_or(true, |(g, _)| generation > *g) {
                *pending = Some((generation, records));
            }
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                if !self.scheduled.swap(true, Ordering::AcqRel) {
                    let writer = Arc::clone(self);
                    handle.spawn_blocking(move || {
                        writer.scheduled.store(false, Ordering::Release);
                        writer.flush();
                    });
                }
            }
            Err(_) => self.flush(),
        }
    }

    /// Write the pending snapshot unless a newer one is already on disk
    fn flush(&self) {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((generation, records)) = pending else {
            return;
        };
        if generation <= *written {
            debug!(generation, written = *written, "Skipping stale cache snapshot");
            return;
        }
        match write_cache(&self.path, &records) {
            Ok(()) => *written = generation,
            Err(e) => warn!(error = %e, "Failed to write telemetry cache"),
        }
    }
}

/// Bounded, disk-backed telemetry queue
pub struct DeliveryQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    cache: Arc<CacheWriter>,
}

impl DeliveryQueue {
    pub fn new(config: QueueConfig) -> Result<Self, CloudError> {
        config.validate()?;
        info!(
            max_size = config.max_size,
            max_cache_size = config.max_cache_size,
            cache = %config.cache_path.display(),
            "Creating delivery queue"
        );
        Ok(Self {
            cache: Arc::new(CacheWriter::new(config.cache_path.clone())),
            config,
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                generation: 0,
                dropped: 0,
            }),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a new envelope stamped with the current time
    pub fn enqueue(&self, kind: &str, payload: Value) -> Uuid {
        self.push(TelemetryEnvelope::new(kind, payload))
    }

    /// Queue an existing envelope
    pub fn push(&self, envelope: TelemetryEnvelope) -> Uuid {
        let id = envelope.id;
        let kind = envelope.kind.clone();

        let (generation, records, depth) = {
            let mut state = self.lock();
            if state.entries.len() >= self.config.max_size {
                if let Some(oldest) = state.entries.pop_front() {
                    state.dropped += 1;
                    counter!("telemetry_queue_dropped_total").increment(1);
                    warn!(kind = %oldest.kind, "Delivery queue full, dropped oldest envelope");
                }
            }
            state.entries.push_back(envelope);
            state.generation += 1;
            (state.generation, self.cache_records(&state), state.entries.len())
        };

        gauge!("telemetry_queue_depth").set(depth as f64);
        debug!(kind = %kind, depth, "Envelope queued");
        self.persist(generation, records);
        id
    }

    /// Replay the on-disk cache into memory
    ///
    /// Entries already queued (same id, or same content for id-less records)
    /// are skipped, so loading twice is harmless. A missing or corrupt cache
    /// leaves the queue as it is. Returns the number of envelopes added.
    pub fn load_from_disk(&self) -> usize {
        let mut records = match read_cache(&self.config.cache_path) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable telemetry cache");
                return 0;
            }
        };
        records.sort_by_key(|r| r.timestamp);

        let mut state = self.lock();
        let mut known: HashSet<Uuid> = state.entries.iter().map(|e| e.id).collect();
        let mut added = 0;

        for record in records {
            let duplicate = match record.id {
                Some(id) => known.contains(&id),
                None => state.entries.iter().any(|e| record.matches(e)),
            };
            if duplicate {
                continue;
            }
            let envelope = record.into_envelope();
            known.insert(envelope.id);
            state.entries.push_back(envelope);
            added += 1;
        }

        if added > 0 {
            state.entries.make_contiguous().sort_by_key(|e| e.timestamp);
            while state.entries.len() > self.config.max_size {
                state.entries.pop_front();
                state.dropped += 1;
            }
            state.generation += 1;
        }
        let depth = state.entries.len();
        drop(state);

        gauge!("telemetry_queue_depth").set(depth as f64);
        info!(added, depth, "Loaded telemetry cache");
        added
    }

    /// Try to publish every queued envelope once
    ///
    /// Published envelopes are removed afterwards; failures stay queued. The
    /// pass stops at the first connection error.
    pub async fn publish_pending(
        &self,
        publisher: &dyn Publisher,
        connectivity: &dyn Connectivity,
    ) -> DrainReport {
        if !connectivity.is_connected() {
            let remaining = self.len();
            debug!(remaining, "Offline, publish pass skipped");
            return DrainReport {
                offline: true,
                remaining,
                ..Default::default()
            };
        }

        let pending: Vec<TelemetryEnvelope> = self.lock().entries.iter().cloned().collect();
        let mut report = DrainReport::default();
        let mut published: HashSet<Uuid> = HashSet::new();

        for envelope in &pending {
            report.attempted += 1;
            let payload = match envelope.payload_bytes() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(kind = %envelope.kind, error = %e, "Envelope payload not serializable");
                    report.failed += 1;
                    continue;
                }
            };

            match publisher.publish(&self.config.topic, &payload).await {
                Ok(()) => {
                    published.insert(envelope.id);
                    report.published += 1;
                }
                Err(CloudError::Connection(reason)) => {
                    report.failed += 1;
                    warn!(reason = %reason, "Link down, stopping publish pass");
                    break;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(kind = %envelope.kind, error = %e, "Publish failed, envelope kept");
                }
            }
        }

        counter!("telemetry_published_total").increment(report.published as u64);
        counter!("telemetry_publish_failures_total").increment(report.failed as u64);

        if published.is_empty() {
            report.remaining = self.len();
            return report;
        }

        let (generation, records, depth) = {
            let mut state = self.lock();
            state.entries.retain(|e| !published.contains(&e.id));
            state.generation += 1;
            (state.generation, self.cache_records(&state), state.entries.len())
        };
        gauge!("telemetry_queue_depth").set(depth as f64);
        self.persist(generation, records);

        report.remaining = depth;
        info!(
            published = report.published,
            failed = report.failed,
            remaining = depth,
            "Publish pass complete"
        );
        report
    }

    /// Publish pass every retry interval until shutdown
    pub async fn run(
        &self,
        publisher: &dyn Publisher,
        connectivity: &dyn Connectivity,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = Duration::from_secs(self.config.publish_retry_interval_seconds);
        loop {
            self.publish_pending(publisher, connectivity).await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.flush_cache().await;
        info!(remaining = self.len(), "Delivery queue stopped");
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Envelopes dropped on overflow since start
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Copy of the queued envelopes, oldest first
    pub fn snapshot(&self) -> Vec<TelemetryEnvelope> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Newest `max_cache_size` entries, oldest first
    fn cache_records(&self, state: &QueueState) -> Vec<CacheRecord> {
        let skip = state.entries.len().saturating_sub(self.config.max_cache_size);
        state.entries.iter().skip(skip).map(CacheRecord::from).collect()
    }

    fn persist(&self, generation: u64, records: Vec<CacheRecord>) {
        self.cache.submit(generation, records);
    }

    /// Wait until the newest snapshot is on disk
    pub async fn flush_cache(&self) {
        let writer = Arc::clone(&self.cache);
        if let Err(e) = tokio::task::spawn_blocking(move || writer.flush()).await {
            warn!(error = %e, "Cache flush task failed");
        }
    }
}
