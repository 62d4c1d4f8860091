//! Event cooldown gate

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Alert configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum time between two accepted accidents (seconds)
    pub cooldown_seconds: u64,
    /// Time the accident signal stays at 1 before the 0 reset (seconds)
    pub signal_reset_seconds: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 30,
            signal_reset_seconds: 10,
        }
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn signal_reset(&self) -> Duration {
        Duration::from_secs(self.signal_reset_seconds)
    }
}

/// Suppresses events that follow an accepted one within the cooldown
#[derive(Debug, Clone)]
pub struct CooldownGate {
    cooldown: Duration,
    last_accepted: Option<Instant>,
    accepted: u64,
    suppressed: u64,
}

impl CooldownGate {
    pub fn new(cooldown: Duration) -> Self {
        info!(cooldown_s = cooldown.as_secs_f64(), "Creating cooldown gate");
        Self {
            cooldown,
            last_accepted: None,
            accepted: 0,
            suppressed: 0,
        }
    }

    /// Whether an event at `now` would be accepted
    pub fn should_fire(&self, now: Instant) -> bool {
        match self.last_accepted {
            Some(last) => now.saturating_duration_since(last) >= self.cooldown,
            None => true,
        }
    }

    /// Record an accepted event at `now`
    pub fn record_fire(&mut self, now: Instant) {
        self.last_accepted = Some(now);
        self.accepted += 1;
    }

    /// Accept and record the event, or count it as suppressed
    pub fn try_accept(&mut self, now: Instant) -> bool {
        if self.should_fire(now) {
            self.record_fire(now);
            true
        } else {
            self.suppressed += 1;
            debug!(remaining_ms = self.remaining(now).as_millis() as u64, "Event suppressed by cooldown");
            false
        }
    }

    /// Cooldown time left at `now`
    pub fn remaining(&self, now: Instant) -> Duration {
        self.last_accepted
            .map(|last| self.cooldown.saturating_sub(now.saturating_duration_since(last)))
            .unwrap_or(Duration::ZERO)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new(AlertConfig::default().cooldown())
    }
}
