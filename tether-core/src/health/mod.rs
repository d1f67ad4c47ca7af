//! Connection health: heartbeat probing and the metrics derived from it.

mod monitor;
mod tracker;

pub(crate) use monitor::{HealthMonitor, ProbeTable};
pub use tracker::{DegradeReason, HealthSignal, HealthSnapshot, HealthThresholds, HealthTracker};
