//! Periodic heartbeat probing for one session.
//!
//! Every `interval` the monitor queues a heartbeat on the multiplexer's
//! control lane and waits up to `timeout` for the reader task to resolve
//! it. Outcomes go into the shared [`HealthTracker`]; the resulting
//! [`HealthSignal`]s are forwarded to the session, which owns every
//! state transition. The monitor never reconnects on its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::tracker::{HealthSignal, HealthTracker};
use crate::clock::Clock;
use crate::message::Envelope;
use crate::mux::Multiplexer;

/// Outstanding probes, keyed by probe sequence. The reader resolves
/// entries when heartbeat replies arrive.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProbeTable {
    waiting: Arc<Mutex<HashMap<u64, oneshot::Sender<Instant>>>>,
}

impl ProbeTable {
    fn register(&self, sequence: u64) -> oneshot::Receiver<Instant> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(sequence, tx);
        rx
    }

    fn forget(&self, sequence: u64) {
        self.lock().remove(&sequence);
    }

    /// Resolve probe `sequence` as answered at `at`. Late or unknown
    /// replies return `false`.
    pub(crate) fn resolve(&self, sequence: u64, at: Instant) -> bool {
        match self.lock().remove(&sequence) {
            Some(tx) => tx.send(at).is_ok(),
            None => false,
        }
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Instant>>> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct HealthMonitor {
    interval: Duration,
    timeout: Duration,
    tracker: Arc<Mutex<HealthTracker>>,
    probes: ProbeTable,
    mux: Multiplexer,
    clock: Arc<dyn Clock>,
    last_sequence: u64,
}

impl HealthMonitor {
    pub(crate) fn new(
        interval: Duration,
        timeout: Duration,
        tracker: Arc<Mutex<HealthTracker>>,
        probes: ProbeTable,
        mux: Multiplexer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            interval,
            timeout,
            tracker,
            probes,
            mux,
            clock,
            last_sequence: 0,
        }
    }

    /// Probe until cancelled or the session stops listening.
    pub(crate) async fn run(
        mut self,
        cancel: CancellationToken,
        signals: mpsc::UnboundedSender<HealthSignal>,
    ) {
        // First probe one full interval after the session came up.
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval = ?self.interval, timeout = ?self.timeout, "heartbeat monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = self.probe() => signal,
            };
            if signals.send(signal).is_err() {
                break;
            }
        }

        self.probes.clear();
        debug!("heartbeat monitor stopped");
    }

    async fn probe(&mut self) -> HealthSignal {
        self.last_sequence += 1;
        let sequence = self.last_sequence;
        let reply = self.probes.register(sequence);
        let sent_at = Instant::now();
        self.mux.send_control(Envelope::heartbeat(sequence));

        let outcome = tokio::time::timeout(self.timeout, reply).await;
        self.probes.forget(sequence);

        let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            Ok(Ok(answered_at)) => {
                let rtt = answered_at.saturating_duration_since(sent_at);
                trace!(sequence, ?rtt, "heartbeat answered");
                tracker.record_success(answered_at.into_std(), self.clock.now(), rtt)
            }
            Ok(Err(_)) | Err(_) => {
                let signal = tracker.record_failure(Instant::now().into_std());
                warn!(
                    sequence,
                    consecutive = tracker.consecutive_failures(),
                    "heartbeat probe timed out"
                );
                signal
            }
        }
    }
}
