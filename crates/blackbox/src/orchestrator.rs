//! Accident handling
//!
//! Routes detector samples, and on a confirmed accident applies the cooldown,
//! triggers incident capture and pulses the accident signal (1, then 0).

use accident_detector::{AccidentDetector, Classification};
use alerting::{AlertConfig, CooldownGate};
use camera_capture::CaptureBuffer;
use cloud_sync::{DeliveryQueue, TelemetryEnvelope};
use metrics::counter;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::source::{AccelSample, SpeedSample};

/// Result of handling a confirmed accident
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccidentOutcome {
    Accepted {
        /// `false` when a recording was already running
        capture_started: bool,
    },
    Suppressed {
        remaining: Duration,
    },
}

/// Connects detector output to capture and delivery
pub struct Orchestrator {
    detector: Arc<AccidentDetector>,
    capture: Arc<CaptureBuffer>,
    queue: Arc<DeliveryQueue>,
    alert: AlertConfig,
    gate: Mutex<CooldownGate>,
    shutdown: watch::Receiver<bool>,
    scheduled: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        detector: Arc<AccidentDetector>,
        capture: Arc<CaptureBuffer>,
        queue: Arc<DeliveryQueue>,
        alert: AlertConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            gate: Mutex::new(CooldownGate::new(alert.cooldown())),
            detector,
            capture,
            queue,
            alert,
            shutdown,
            scheduled: Mutex::new(Vec::new()),
        }
    }

    pub fn detector(&self) -> &AccidentDetector {
        &self.detector
    }

    fn gate(&self) -> MutexGuard<'_, CooldownGate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed an accelerometer sample to the detector
    pub fn on_accel(&self, sample: &AccelSample) -> Classification {
        self.detector
            .process_acceleration(sample.magnitude(), sample.timestamp)
    }

    /// Feed a speed sample to the detector, handling a confirmed accident
    pub fn on_speed(&self, sample: &SpeedSample) -> Classification {
        let classification = self.detector.process_speed(sample.speed_kmh, sample.timestamp);
        if classification == Classification::Accident {
            self.on_accident();
        }
        classification
    }

    /// Handle a confirmed accident
    ///
    /// Must be called from within a tokio runtime; the signal reset and the
    /// detector reset run as background tasks.
    pub fn on_accident(&self) -> AccidentOutcome {
        let now = Instant::now();
        let suppressed = {
            let mut gate = self.gate();
            if gate.try_accept(now) {
                None
            } else {
                Some(gate.remaining(now))
            }
        };

        if let Some(remaining) = suppressed {
            counter!("accidents_suppressed_total").increment(1);
            info!(
                remaining_s = remaining.as_secs_f64(),
                "Accident within cooldown, suppressed"
            );
            return AccidentOutcome::Suppressed { remaining };
        }

        counter!("accidents_accepted_total").increment(1);
        warn!("Accident detected");

        let capture_started = self.capture.trigger();
        self.queue.push(TelemetryEnvelope::accident_signal(1));
        self.schedule_signal_reset();
        self.schedule_detector_reset();

        AccidentOutcome::Accepted { capture_started }
    }

    /// Enqueue the `0` signal after the reset delay, or at once on shutdown
    fn schedule_signal_reset(&self) {
        let queue = Arc::clone(&self.queue);
        let delay = self.alert.signal_reset();
        let mut shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            if !*shutdown.borrow() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
            queue.push(TelemetryEnvelope::accident_signal(0));
            debug!("Accident signal reset");
        });
        self.track(handle);
    }

    /// Reset the detector once the cooldown has elapsed; skipped on shutdown
    fn schedule_detector_reset(&self) {
        let detector = Arc::clone(&self.detector);
        let delay = self.alert.cooldown();
        let mut shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => detector.reset(),
                _ = shutdown.changed() => debug!("Detector reset skipped on shutdown"),
            }
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut scheduled = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        scheduled.retain(|h| !h.is_finished());
        scheduled.push(handle);
    }

    /// Wait for scheduled actions; call after signalling shutdown
    pub async fn join_scheduled(&self) {
        let handles: Vec<_> = {
            let mut scheduled = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
            scheduled.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduled accident action failed");
            }
        }
    }
}
