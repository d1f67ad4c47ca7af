//! Stream multiplexer: many producers, one transport.
//!
//! Producers hand payloads to the [`Multiplexer`], which stamps each one
//! with the producer's next sequence number and queues it. The session's
//! single writer task pulls frames with round-robin fairness across
//! producers; control frames (auth, heartbeats) always go first.
//!
//! Messages stay owned by the multiplexer until the host acknowledges
//! `(producer, sequence)`. A reconnect puts every unacknowledged message
//! back at the front of its queue under its original number, so the host
//! sees each producer's sequence strictly increasing and can drop
//! duplicates.
//!
//! Data frames only leave while the link state accepts data
//! (`Connected` or `Degraded`); the multiplexer reads that state but
//! never touches a transport.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, unix_millis};
use crate::config::{OverflowMode, StreamConfig};
use crate::error::{RejectReason, TetherError};
use crate::message::Envelope;
use crate::state::ConnectionState;

mod queue;

use queue::RoundRobin;

// ── ProducerId ───────────────────────────────────────────────────

/// Names a logical data stream sharing the link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerId(String);

impl ProducerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProducerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ProducerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Messages and statuses ────────────────────────────────────────

/// One queued producer message.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub producer: ProducerId,
    /// Per-producer, starts at 1, never reused.
    pub sequence: u64,
    pub payload: Value,
    /// Unix milliseconds at publish time.
    pub timestamp: u64,
}

impl StreamMessage {
    pub fn to_envelope(&self) -> Envelope {
        Envelope::module_data(
            self.producer.clone(),
            self.sequence,
            self.timestamp,
            self.payload.clone(),
        )
    }
}

/// Delivery progress reported to a producer's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued { sequence: u64 },
    Sent { sequence: u64 },
    Acknowledged { sequence: u64 },
    /// `sequence` is `None` when the message never got one.
    Rejected {
        sequence: Option<u64>,
        reason: RejectReason,
    },
}

/// Receives host-to-producer data and delivery statuses.
///
/// Called from connector tasks; implementations should return quickly.
pub trait ProducerHandler: Send + Sync + 'static {
    fn on_message(&self, payload: Value);

    fn on_status(&self, _status: DeliveryStatus) {}
}

impl<F> ProducerHandler for F
where
    F: Fn(Value) + Send + Sync + 'static,
{
    fn on_message(&self, payload: Value) {
        self(payload)
    }
}

/// A frame ready for the writer.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Control(Envelope),
    Data(StreamMessage),
}

// ── Multiplexer ──────────────────────────────────────────────────

struct Inner {
    streams: RoundRobin,
    control: VecDeque<Envelope>,
}

struct Shared {
    capacity: usize,
    overflow: OverflowMode,
    state: watch::Receiver<ConnectionState>,
    /// Stamps every outgoing frame.
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    handlers: Mutex<HashMap<ProducerId, Arc<dyn ProducerHandler>>>,
    /// Wakes the writer.
    outbound: Notify,
    /// Wakes publishers blocked on a full queue.
    space: Notify,
    closed: CancellationToken,
}

/// Cheaply cloneable handle to the shared queues.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("capacity", &self.shared.capacity)
            .field("overflow", &self.shared.overflow)
            .field("closed", &self.shared.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    pub fn new(
        config: &StreamConfig,
        state: watch::Receiver<ConnectionState>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity: config.queue_capacity.max(1),
                overflow: config.overflow,
                state,
                clock,
                inner: Mutex::new(Inner {
                    streams: RoundRobin::default(),
                    control: VecDeque::new(),
                }),
                handlers: Mutex::new(HashMap::new()),
                outbound: Notify::new(),
                space: Notify::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handler(&self, producer: &ProducerId) -> Option<Arc<dyn ProducerHandler>> {
        self.shared
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(producer)
            .cloned()
    }

    fn notify_status(&self, producer: &ProducerId, status: DeliveryStatus) {
        if let Some(handler) = self.handler(producer) {
            handler.on_status(status);
        }
    }

    // ── Producer-facing ─────────────────────────────────────────

    /// Attach `handler` to `producer` and return a publishing handle.
    /// A later registration under the same id replaces the handler.
    pub fn register(
        &self,
        producer: impl Into<ProducerId>,
        handler: impl ProducerHandler,
    ) -> ProducerHandle {
        let producer = producer.into();
        let previous = self
            .shared
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(producer.clone(), Arc::new(handler));
        if previous.is_some() {
            warn!(%producer, "producer re-registered; previous handler replaced");
        } else {
            debug!(%producer, "producer registered");
        }
        ProducerHandle {
            producer,
            mux: self.clone(),
        }
    }

    pub fn unregister(&self, producer: &ProducerId) -> bool {
        self.shared
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(producer)
            .is_some()
    }

    /// Queue `payload` and return its sequence number.
    ///
    /// With [`OverflowMode::Block`] a full queue waits for space; with
    /// [`OverflowMode::Reject`] it fails immediately. Fails with
    /// `Rejected { reason: Closed }` once the link is closed.
    pub async fn publish(
        &self,
        producer: impl Into<ProducerId>,
        payload: Value,
    ) -> Result<u64, TetherError> {
        let producer = producer.into();
        let mut payload = payload;
        loop {
            let space = self.shared.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.enqueue(&producer, payload) {
                Ok(sequence) => return Ok(sequence),
                Err((RejectReason::QueueFull, back))
                    if self.shared.overflow == OverflowMode::Block =>
                {
                    payload = back;
                    trace!(%producer, "queue full; waiting for space");
                    tokio::select! {
                        _ = &mut space => {}
                        _ = self.shared.closed.cancelled() => {}
                    }
                }
                Err((reason, _)) => return Err(self.reject(&producer, reason)),
            }
        }
    }

    /// Non-blocking publish: a full queue is rejected whatever the
    /// overflow mode.
    pub fn try_publish(
        &self,
        producer: impl Into<ProducerId>,
        payload: Value,
    ) -> Result<u64, TetherError> {
        let producer = producer.into();
        self.enqueue(&producer, payload)
            .map_err(|(reason, _)| self.reject(&producer, reason))
    }

    fn enqueue(&self, producer: &ProducerId, payload: Value) -> Result<u64, (RejectReason, Value)> {
        if self.is_closed() {
            return Err((RejectReason::Closed, payload));
        }
        let sequence = {
            let mut inner = self.lock();
            let queue = inner.streams.queue_mut(producer);
            if queue.len() >= self.shared.capacity {
                return Err((RejectReason::QueueFull, payload));
            }
            queue.enqueue(producer, payload, unix_millis(self.shared.clock.now()))
        };
        trace!(%producer, sequence, "queued");
        self.shared.outbound.notify_one();
        self.notify_status(producer, DeliveryStatus::Queued { sequence });
        Ok(sequence)
    }

    fn reject(&self, producer: &ProducerId, reason: RejectReason) -> TetherError {
        debug!(%producer, %reason, "publish rejected");
        self.notify_status(
            producer,
            DeliveryStatus::Rejected {
                sequence: None,
                reason,
            },
        );
        TetherError::rejected(producer, reason)
    }

    /// Messages owned for `producer`: waiting plus sent-but-unacknowledged.
    pub fn queued(&self, producer: &ProducerId) -> usize {
        self.lock().streams.queue(producer).map_or(0, |q| q.len())
    }

    /// Sent but not yet acknowledged.
    pub fn in_flight(&self, producer: &ProducerId) -> usize {
        self.lock()
            .streams
            .queue(producer)
            .map_or(0, |q| q.in_flight_len())
    }

    /// Not yet handed to the writer.
    pub fn pending(&self, producer: &ProducerId) -> usize {
        self.lock()
            .streams
            .queue(producer)
            .map_or(0, |q| q.pending_len())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled() || self.shared.state.borrow().is_closed()
    }

    // ── Session-facing ──────────────────────────────────────────

    /// Queue a control frame ahead of all data.
    pub(crate) fn send_control(&self, mut envelope: Envelope) {
        envelope.timestamp = unix_millis(self.shared.clock.now());
        self.lock().control.push_back(envelope);
        self.shared.outbound.notify_one();
    }

    /// Next frame for the writer, if one may be sent now. Data messages
    /// move to in-flight before they are returned.
    pub(crate) fn next_frame(&self) -> Option<Outbound> {
        let mut inner = self.lock();
        if let Some(env) = inner.control.pop_front() {
            return Some(Outbound::Control(env));
        }
        if !self.shared.state.borrow().accepts_data() {
            return None;
        }
        inner.streams.next().map(Outbound::Data)
    }

    /// Wait until there may be something for [`next_frame`](Self::next_frame).
    pub(crate) async fn outbound_ready(&self) {
        self.shared.outbound.notified().await
    }

    /// Wake the writer, e.g. after a state change re-opened the data gate.
    pub(crate) fn wake(&self) {
        self.shared.outbound.notify_one();
    }

    pub(crate) fn mark_sent(&self, producer: &ProducerId, sequence: u64) {
        self.notify_status(producer, DeliveryStatus::Sent { sequence });
    }

    /// The host confirmed `(producer, sequence)`.
    pub(crate) fn acknowledge(&self, producer: &ProducerId, sequence: u64) -> bool {
        let removed = self
            .lock()
            .streams
            .existing_mut(producer)
            .is_some_and(|q| q.acknowledge(sequence));
        if removed {
            self.shared.space.notify_waiters();
            self.notify_status(producer, DeliveryStatus::Acknowledged { sequence });
        } else {
            debug!(%producer, sequence, "ack for unknown or already acknowledged message");
        }
        removed
    }

    /// Drop an in-flight message that can never be sent.
    pub(crate) fn discard(&self, producer: &ProducerId, sequence: u64, reason: RejectReason) {
        let removed = self
            .lock()
            .streams
            .existing_mut(producer)
            .is_some_and(|q| q.acknowledge(sequence));
        if removed {
            warn!(%producer, sequence, %reason, "message discarded");
            self.shared.space.notify_waiters();
            self.notify_status(
                producer,
                DeliveryStatus::Rejected {
                    sequence: Some(sequence),
                    reason,
                },
            );
        }
    }

    /// Route host-to-module data to its producer. Unknown producers are
    /// logged and dropped.
    pub(crate) fn dispatch_inbound(&self, producer: &ProducerId, payload: Value) -> bool {
        match self.handler(producer) {
            Some(handler) => {
                handler.on_message(payload);
                true
            }
            None => {
                warn!(%producer, "dropping inbound data for unknown producer");
                false
            }
        }
    }

    /// Prepare for a fresh transport: unacknowledged messages go back to
    /// the front of their queues and stale control frames are dropped.
    pub(crate) fn begin_session(&self) {
        let requeued = {
            let mut inner = self.lock();
            inner.control.clear();
            inner.streams.requeue_all()
        };
        if requeued > 0 {
            debug!(requeued, "requeued unacknowledged messages for redelivery");
        }
    }

    /// Refuse all further publishes and drop whatever is still queued,
    /// reporting each dropped message as rejected.
    pub(crate) fn close(&self) {
        self.shared.closed.cancel();
        let dropped = {
            let mut inner = self.lock();
            inner.control.clear();
            inner.streams.drain_all()
        };
        self.shared.space.notify_waiters();
        self.shared.outbound.notify_one();

        let total: usize = dropped.iter().map(|(_, seqs)| seqs.len()).sum();
        if total > 0 {
            debug!(dropped = total, "multiplexer closed with undelivered messages");
        }
        for (producer, seqs) in dropped {
            let Some(handler) = self.handler(&producer) else {
                continue;
            };
            for sequence in seqs {
                handler.on_status(DeliveryStatus::Rejected {
                    sequence: Some(sequence),
                    reason: RejectReason::Closed,
                });
            }
        }
    }
}

// ── ProducerHandle ───────────────────────────────────────────────

/// Publishing handle bound to one producer id.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    producer: ProducerId,
    mux: Multiplexer,
}

impl ProducerHandle {
    pub fn id(&self) -> &ProducerId {
        &self.producer
    }

    pub async fn publish(&self, payload: Value) -> Result<u64, TetherError> {
        self.mux.publish(self.producer.clone(), payload).await
    }

    pub fn try_publish(&self, payload: Value) -> Result<u64, TetherError> {
        self.mux.try_publish(self.producer.clone(), payload)
    }

    /// Waiting plus in-flight messages for this producer.
    pub fn queued(&self) -> usize {
        self.mux.queued(&self.producer)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_unix_millis;
    use serde_json::json;
    use std::time::{Duration, SystemTime};
    use tokio_test::{assert_pending, assert_ready_ok};

    const NOW_MS: u64 = 1_700_000_000_250;

    struct FixedClock;

    impl Clock for FixedClock {
        fn now(&self) -> SystemTime {
            from_unix_millis(NOW_MS)
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        statuses: Arc<Mutex<Vec<DeliveryStatus>>>,
        messages: Arc<Mutex<Vec<Value>>>,
    }

    impl ProducerHandler for Recorder {
        fn on_message(&self, payload: Value) {
            self.messages.lock().unwrap().push(payload);
        }

        fn on_status(&self, status: DeliveryStatus) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    fn mux_with(
        capacity: usize,
        overflow: OverflowMode,
    ) -> (Multiplexer, watch::Sender<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        let config = StreamConfig {
            queue_capacity: capacity,
            overflow,
            ..StreamConfig::default()
        };
        (Multiplexer::new(&config, rx, Arc::new(FixedClock)), tx)
    }

    fn data(frame: Option<Outbound>) -> StreamMessage {
        match frame {
            Some(Outbound::Data(m)) => m,
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn control_frames_jump_the_queue() {
        let (mux, _state) = mux_with(10, OverflowMode::Reject);
        mux.try_publish("a", json!(1)).unwrap();
        mux.send_control(Envelope::heartbeat(1));
        assert!(matches!(mux.next_frame(), Some(Outbound::Control(_))));
        assert_eq!(data(mux.next_frame()).sequence, 1);
        assert!(mux.next_frame().is_none());
    }

    #[test]
    fn frames_are_stamped_by_the_injected_clock() {
        let (mux, _state) = mux_with(10, OverflowMode::Reject);
        mux.try_publish("a", json!(1)).unwrap();
        mux.send_control(Envelope::heartbeat(1));

        match mux.next_frame() {
            Some(Outbound::Control(env)) => assert_eq!(env.timestamp, NOW_MS),
            other => panic!("expected control frame, got {other:?}"),
        }
        let message = data(mux.next_frame());
        assert_eq!(message.timestamp, NOW_MS);
        assert_eq!(message.to_envelope().timestamp, NOW_MS);
    }

    #[test]
    fn acks_for_unknown_producers_leave_no_trace() {
        let (mux, _state) = mux_with(10, OverflowMode::Reject);
        for n in 0..1000u64 {
            let producer = ProducerId::from(format!("bogus-{n}"));
            assert!(!mux.acknowledge(&producer, n));
            mux.discard(&producer, n, RejectReason::TooLarge);
        }
        assert_eq!(mux.lock().streams.producer_count(), 0);

        // Known producers still get their acks.
        mux.try_publish("a", json!(1)).unwrap();
        data(mux.next_frame());
        assert!(!mux.acknowledge(&"a".into(), 99));
        assert!(mux.acknowledge(&"a".into(), 1));
        assert_eq!(mux.lock().streams.producer_count(), 1);
    }

    #[test]
    fn data_waits_for_a_connected_state() {
        let (mux, state) = mux_with(10, OverflowMode::Reject);
        state.send_replace(ConnectionState::Reconnecting);
        mux.try_publish("a", json!(1)).unwrap();
        assert!(mux.next_frame().is_none());

        // Control still flows while authenticating.
        state.send_replace(ConnectionState::Authenticating);
        mux.send_control(Envelope::auth("t".into()));
        assert!(matches!(mux.next_frame(), Some(Outbound::Control(_))));
        assert!(mux.next_frame().is_none());

        state.send_replace(ConnectionState::Degraded);
        assert_eq!(data(mux.next_frame()).sequence, 1);
    }

    #[test]
    fn reject_mode_refuses_when_full() {
        let (mux, _state) = mux_with(2, OverflowMode::Reject);
        let rec = Recorder::default();
        let handle = mux.register("a", rec.clone());
        handle.try_publish(json!(1)).unwrap();
        handle.try_publish(json!(2)).unwrap();
        let err = handle.try_publish(json!(3)).unwrap_err();
        assert!(matches!(
            err,
            TetherError::Rejected {
                reason: RejectReason::QueueFull,
                ..
            }
        ));
        // In-flight messages still count against capacity.
        data(mux.next_frame());
        assert!(handle.try_publish(json!(3)).is_err());
        assert!(mux.acknowledge(&"a".into(), 1));
        assert_eq!(handle.try_publish(json!(3)).unwrap(), 3);

        let statuses = rec.statuses.lock().unwrap();
        assert!(statuses.contains(&DeliveryStatus::Rejected {
            sequence: None,
            reason: RejectReason::QueueFull
        }));
        assert!(statuses.contains(&DeliveryStatus::Acknowledged { sequence: 1 }));
    }

    #[test]
    fn block_mode_waits_for_an_ack() {
        let (mux, _state) = mux_with(1, OverflowMode::Block);
        mux.try_publish("a", json!(1)).unwrap();
        data(mux.next_frame());

        let mut blocked = tokio_test::task::spawn(mux.publish("a", json!(2)));
        assert_pending!(blocked.poll());

        mux.acknowledge(&"a".into(), 1);
        assert!(blocked.is_woken());
        assert_eq!(assert_ready_ok!(blocked.poll()), 2);
    }

    #[tokio::test]
    async fn close_releases_blocked_publishers() {
        let (mux, _state) = mux_with(1, OverflowMode::Block);
        mux.publish("a", json!(1)).await.unwrap();
        let blocked = tokio::spawn({
            let mux = mux.clone();
            async move { mux.publish("a", json!(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        mux.close();
        let err = blocked.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            TetherError::Rejected {
                reason: RejectReason::Closed,
                ..
            }
        ));
        assert_eq!(mux.queued(&"a".into()), 0);
    }

    #[test]
    fn closed_state_rejects_publish() {
        let (mux, state) = mux_with(10, OverflowMode::Block);
        state.send_replace(ConnectionState::Closed);
        assert!(matches!(
            mux.try_publish("a", json!(1)),
            Err(TetherError::Rejected {
                reason: RejectReason::Closed,
                ..
            })
        ));
    }

    #[test]
    fn close_reports_dropped_messages() {
        let (mux, _state) = mux_with(10, OverflowMode::Reject);
        let rec = Recorder::default();
        let handle = mux.register("a", rec.clone());
        handle.try_publish(json!(1)).unwrap();
        handle.try_publish(json!(2)).unwrap();
        data(mux.next_frame());
        mux.close();

        let statuses = rec.statuses.lock().unwrap();
        let rejected: Vec<_> = statuses
            .iter()
            .filter_map(|s| match s {
                DeliveryStatus::Rejected {
                    sequence: Some(seq),
                    reason: RejectReason::Closed,
                } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(rejected, vec![1, 2]);
    }

    #[test]
    fn begin_session_redelivers_unacked_in_order() {
        let (mux, _state) = mux_with(10, OverflowMode::Reject);
        for i in 0..4 {
            mux.try_publish("a", json!(i)).unwrap();
        }
        mux.send_control(Envelope::heartbeat(7));
        let _ = mux.next_frame(); // heartbeat
        for _ in 0..3 {
            data(mux.next_frame());
        }
        mux.acknowledge(&"a".into(), 2);
        mux.send_control(Envelope::heartbeat(8));

        mux.begin_session();
        let resent: Vec<u64> = std::iter::from_fn(|| mux.next_frame())
            .map(|f| data(Some(f)).sequence)
            .collect();
        assert_eq!(resent, vec![1, 3, 4]);
        assert_eq!(mux.in_flight(&"a".into()), 3);
    }

    #[test]
    fn inbound_routing() {
        let (mux, _state) = mux_with(10, OverflowMode::Reject);
        let rec = Recorder::default();
        mux.register("cost", rec.clone());
        assert!(mux.dispatch_inbound(&"cost".into(), json!({"limit": 5})));
        assert!(!mux.dispatch_inbound(&"nobody".into(), json!(1)));
        assert_eq!(rec.messages.lock().unwrap().as_slice(), &[json!({"limit": 5})]);
    }

    #[test]
    fn closure_handlers() {
        let (mux, _state) = mux_with(10, OverflowMode::Reject);
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        mux.register("c", move |_payload: Value| {
            *counter.lock().unwrap() += 1;
        });
        mux.dispatch_inbound(&"c".into(), Value::Null);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn producer_id_is_a_plain_string_on_the_wire() {
        let id = ProducerId::from("session");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""session""#);
        assert_eq!(id.as_str(), "session");
    }
}
