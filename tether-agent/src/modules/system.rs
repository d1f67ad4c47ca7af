//! The `system` producer: streams the link's own state and health.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tether_core::clock::unix_millis;
use tether_core::{
    ConnectionState, DeliveryStatus, HealthSnapshot, Link, ProducerHandler, RejectReason,
    TetherError,
};

pub const PRODUCER_ID: &str = "system";

/// Receives host messages addressed to `system`.
struct SystemHandler;

impl ProducerHandler for SystemHandler {
    fn on_message(&self, payload: Value) {
        info!(%payload, "host message for system module");
    }

    fn on_status(&self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Rejected { sequence, reason } => {
                debug!(?sequence, %reason, "system sample rejected")
            }
            other => trace!(?other, "system sample status"),
        }
    }
}

/// One sample as published on the wire.
pub fn sample(state: ConnectionState, health: &HealthSnapshot, reconnect_failures: u32) -> Value {
    let millis = |d: Option<Duration>| d.map(|d| d.as_micros() as f64 / 1000.0);
    json!({
        "state": state.to_string(),
        "latencyMs": millis(health.latency),
        "smoothedLatencyMs": millis(health.smoothed_latency),
        "errorCount": health.error_count,
        "errorRate": health.error_rate,
        "consecutiveFailures": health.consecutive_failures,
        "lastHeartbeat": health.last_heartbeat.map(unix_millis),
        "uptimeSecs": health.uptime.as_secs(),
        "reconnectFailures": reconnect_failures,
    })
}

/// Publish a sample every `interval` until cancelled or the link closes.
///
/// Samples are published with `try_publish`: when the queue is full the
/// sample is dropped, since a newer one follows shortly.
pub async fn run(link: Link, interval: Duration, cancel: CancellationToken) {
    let handle = link.register(PRODUCER_ID, SystemHandler);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(?interval, "system module started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let payload = sample(link.state(), &link.health(), link.reconnect_failures());
        match handle.try_publish(payload) {
            Ok(sequence) => trace!(sequence, "system sample queued"),
            Err(TetherError::Rejected {
                reason: RejectReason::QueueFull,
                ..
            }) => debug!("system queue full; sample dropped"),
            Err(TetherError::Rejected {
                reason: RejectReason::Closed,
                ..
            }) => break,
            Err(e) => warn!(error = %e, "system sample not published"),
        }
    }
    debug!("system module stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_shape() {
        let health = HealthSnapshot {
            latency: Some(Duration::from_millis(12)),
            consecutive_failures: 1,
            uptime: Duration::from_secs(42),
            ..HealthSnapshot::default()
        };
        let v = sample(ConnectionState::Degraded, &health, 0);
        assert_eq!(v["state"], "Degraded");
        assert_eq!(v["latencyMs"], 12.0);
        assert_eq!(v["smoothedLatencyMs"], Value::Null);
        assert_eq!(v["consecutiveFailures"], 1);
        assert_eq!(v["uptimeSecs"], 42);
        assert_eq!(v["lastHeartbeat"], Value::Null);
    }
}
