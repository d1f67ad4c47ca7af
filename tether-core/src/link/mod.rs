//! The link: one owned connection context shared by every task.
//!
//! [`Link`] is a cheap, cloneable handle. Behind it sits a single
//! [`LinkShared`] holding the configuration, the credential provider,
//! the connector, the multiplexer, the health tracker and the connection
//! state. Every task is handed a clone at spawn time; there is no global.
//!
//! ```text
//!   Link::start ──► driver task ──► session (per transport)
//!                        │              ├── writer   (owns FrameSink)
//!                        │              ├── reader   (owns FrameSource)
//!                        │              └── monitor  (heartbeats)
//!                        └── backoff via ReconnectPolicy
//! ```
//!
//! All state changes go through [`LinkShared::transition`], which checks
//! the edge, records it in the transition ring, broadcasts it and wakes
//! the multiplexer's writer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::LinkConfig;
use crate::credentials::CredentialProvider;
use crate::error::TetherError;
use crate::health::{HealthSnapshot, HealthThresholds, HealthTracker};
use crate::mux::{Multiplexer, ProducerHandle, ProducerHandler, ProducerId};
use crate::state::{ConnectionState, StatusEvent, TransitionLog};
use crate::transport::{Connector, WsConnector};

mod driver;
mod session;

/// Capacity of the status event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a link reached `Closed`.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// `stop()` was called.
    Stopped,
    /// The reconnection policy gave up.
    Abandoned {
        attempts: u32,
        last_error: TetherError,
    },
    /// A configuration or security failure.
    Fatal(TetherError),
}

impl CloseReason {
    /// Whether the owning process should treat this as a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, CloseReason::Stopped)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Stopped => write!(f, "stopped"),
            CloseReason::Abandoned {
                attempts,
                last_error,
            } => write!(
                f,
                "connection abandoned after {attempts} attempts: {last_error}"
            ),
            CloseReason::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

// ── Shared context ───────────────────────────────────────────────

pub(crate) struct LinkShared {
    pub(crate) config: LinkConfig,
    pub(crate) credentials: CredentialProvider,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) mux: Multiplexer,
    pub(crate) tracker: Arc<Mutex<HealthTracker>>,
    pub(crate) cancel: CancellationToken,
    /// Consecutive failed connection attempts in the current streak.
    pub(crate) reconnect_failures: AtomicU32,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<StatusEvent>,
    log: Mutex<TransitionLog>,
    closed: watch::Sender<Option<CloseReason>>,
    driver: Mutex<Option<AbortHandle>>,
    /// Set once the driver task is gone, however it ended.
    finished: watch::Sender<bool>,
}

impl LinkShared {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// The one place the connection state changes. Returns `false` (and
    /// changes nothing) for an edge outside the state graph.
    pub(crate) fn transition(&self, next: ConnectionState, reason: &str) -> bool {
        let mut from = None;
        self.state.send_if_modified(|state| match state.transition(next) {
            Ok(previous) => {
                from = Some(previous);
                true
            }
            Err(_) => false,
        });
        let Some(from) = from else {
            debug!(to = %next, current = %self.state(), reason, "transition refused");
            return false;
        };

        info!(%from, to = %next, reason, "connection state changed");
        let event = StatusEvent {
            from,
            to: next,
            reason: reason.to_string(),
            at: self.clock.now(),
        };
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        // No subscribers is fine.
        let _ = self.events.send(event);
        self.mux.wake();
        true
    }

    /// Enter `Closed` for good. The first reason recorded wins.
    pub(crate) fn close(&self, reason: CloseReason) {
        match &reason {
            CloseReason::Stopped => info!("link stopping"),
            CloseReason::Abandoned { .. } => error!(%reason, "connection abandoned"),
            CloseReason::Fatal(_) => error!(%reason, "link closed on fatal error"),
        }
        let reason_text = reason.to_string();
        self.closed.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        });
        self.transition(ConnectionState::Closed, &reason_text);
        self.cancel.cancel();
        self.mux.close();
    }

    pub(crate) fn health_snapshot(&self) -> HealthSnapshot {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot(tokio::time::Instant::now().into_std())
    }
}

/// Flags the driver finished when its task completes or is aborted.
struct DriverDone(Arc<LinkShared>);

impl Drop for DriverDone {
    fn drop(&mut self) {
        self.0.finished.send_replace(true);
    }
}

// ── Link ─────────────────────────────────────────────────────────

/// Handle to one logical connection to the remote host.
#[derive(Clone)]
pub struct Link {
    shared: Arc<LinkShared>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("endpoint", &self.shared.config.endpoint.url)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// A link over WebSocket/TLS, as configured.
    pub fn connect(config: LinkConfig) -> Result<Self, TetherError> {
        let connector = WsConnector::new().allow_insecure(config.endpoint.allow_insecure);
        Self::new(config, connector)
    }

    /// A link over any connector. Fails with `Configuration` if the
    /// configuration is invalid.
    pub fn new(config: LinkConfig, connector: impl Connector) -> Result<Self, TetherError> {
        Self::with_clock(config, connector, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new), with an explicit wall clock for token
    /// issuance and expiry.
    pub fn with_clock(
        config: LinkConfig,
        connector: impl Connector,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TetherError> {
        config.validate()?;

        let credentials = CredentialProvider::with_clock(
            &config.auth.secret,
            config.token_lifetime(),
            Arc::clone(&clock),
        );
        let (state, state_rx) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (closed, _) = watch::channel(None);
        let mux = Multiplexer::new(&config.stream, state_rx, Arc::clone(&clock));
        let tracker = HealthTracker::new(
            HealthThresholds {
                latency: config.latency_threshold(),
                failure_threshold: config.health.failure_threshold,
            },
            config.error_window(),
        );
        let log = TransitionLog::new(config.stream.history_capacity);

        Ok(Self {
            shared: Arc::new(LinkShared {
                config,
                credentials,
                connector: Arc::new(connector),
                clock,
                mux,
                tracker: Arc::new(Mutex::new(tracker)),
                cancel: CancellationToken::new(),
                reconnect_failures: AtomicU32::new(0),
                state,
                events,
                log: Mutex::new(log),
                closed,
                driver: Mutex::new(None),
                finished: watch::channel(false).0,
            }),
        })
    }

    /// Leave `Idle` and start connecting in the background.
    pub fn start(&self) -> Result<(), TetherError> {
        let mut driver = self
            .shared
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if driver.is_some() || self.shared.state() != ConnectionState::Idle {
            return Err(TetherError::Protocol(format!(
                "link cannot start from {}",
                self.shared.state()
            )));
        }
        info!(endpoint = %self.shared.config.endpoint.url, "starting link");
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let _done = DriverDone(Arc::clone(&shared));
            driver::run(shared).await;
        });
        *driver = Some(task.abort_handle());
        Ok(())
    }

    /// Close the link and wait for every task to finish.
    ///
    /// The state becomes `Closed` immediately, queued messages are
    /// rejected and no further frames are sent. Tasks still running
    /// after the configured grace period are aborted. Safe to call from
    /// any task, any number of times; every caller returns only once the
    /// driver is gone.
    pub async fn stop(&self) {
        self.request_stop();
        if self.driver_lock().is_none() {
            return;
        }
        let mut finished = self.shared.finished.subscribe();
        // The driver joins its own session tasks within the same grace,
        // so allow it twice that before aborting.
        let grace = self.shared.config.stop_grace() * 2;
        if tokio::time::timeout(grace, finished.wait_for(|done| *done))
            .await
            .is_ok()
        {
            debug!("link driver finished");
            return;
        }
        warn!(?grace, "link driver overran stop grace; aborting");
        if let Some(handle) = self.driver_lock().as_ref() {
            handle.abort();
        }
        let _ = finished.wait_for(|done| *done).await;
    }

    fn driver_lock(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        self.shared
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Close the link without waiting for tasks to unwind.
    pub fn request_stop(&self) {
        if self.shared.state().is_closed() {
            return;
        }
        self.shared.close(CloseReason::Stopped);
    }

    /// Resolves once the link is closed, with the reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.closed.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::Stopped;
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.shared.health_snapshot()
    }

    /// Recent transitions, oldest first.
    pub fn transitions(&self) -> Vec<StatusEvent> {
        self.shared
            .log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .recent()
    }

    /// Live stream of transitions from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.events.subscribe()
    }

    /// Failed connection attempts since the last successful session.
    pub fn reconnect_failures(&self) -> u32 {
        self.shared.reconnect_failures.load(Ordering::Relaxed)
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.shared.mux
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Shortcut for [`Multiplexer::register`].
    pub fn register(
        &self,
        producer: impl Into<ProducerId>,
        handler: impl ProducerHandler,
    ) -> ProducerHandle {
        self.shared.mux.register(producer, handler)
    }

    /// Shortcut for [`Multiplexer::publish`].
    pub async fn publish(
        &self,
        producer: impl Into<ProducerId>,
        payload: Value,
    ) -> Result<u64, TetherError> {
        self.shared.mux.publish(producer, payload).await
    }

    /// Grace period applied by [`stop`](Self::stop).
    pub fn stop_grace(&self) -> Duration {
        self.shared.config.stop_grace()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;

    fn config() -> LinkConfig {
        let mut config = LinkConfig::default();
        config.auth.secret = "0123456789abcdef-test".into();
        config
    }

    #[test]
    fn invalid_config_is_refused() {
        let (connector, _host) = MemoryConnector::new();
        let err = Link::new(LinkConfig::default(), connector).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn stop_before_start_closes() {
        let (connector, _host) = MemoryConnector::new();
        let link = Link::new(config(), connector).unwrap();
        assert_eq!(link.state(), ConnectionState::Idle);
        link.stop().await;
        assert_eq!(link.state(), ConnectionState::Closed);
        assert!(matches!(link.closed().await, CloseReason::Stopped));
        assert!(link.start().is_err());

        let events = link.transitions();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from, ConnectionState::Idle);
        assert_eq!(events[0].to, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn start_twice_is_refused() {
        let (connector, _host) = MemoryConnector::new();
        let link = Link::new(config(), connector).unwrap();
        link.start().unwrap();
        assert!(link.start().is_err());
        link.stop().await;
    }

    #[test]
    fn close_reason_display() {
        let reason = CloseReason::Abandoned {
            attempts: 10,
            last_error: TetherError::Connect("refused".into()),
        };
        assert!(reason.to_string().contains("abandoned after 10 attempts"));
        assert!(reason.is_failure());
        assert!(!CloseReason::Stopped.is_failure());
    }
}
