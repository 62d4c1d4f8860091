//! Alerting System
//!
//! Provides event cooldown and accident-signal timing.

mod gate;

pub use gate::{AlertConfig, CooldownGate};
