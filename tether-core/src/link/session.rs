//! One session: a single transport from open to teardown.
//!
//! A session opens the transport, authenticates, and then supervises
//! the writer, reader and heartbeat tasks until something ends it. Its
//! tasks live in one [`TaskGroup`] which is shut down before `run`
//! returns, and the writer closes the sink on its way out, so the old
//! transport is gone before the driver opens the next one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::LinkShared;
use crate::codec;
use crate::credentials::{AuthToken, CredentialProvider};
use crate::error::{RejectReason, TetherError};
use crate::health::{DegradeReason, HealthMonitor, HealthSignal, ProbeTable};
use crate::message::{Envelope, Inbound};
use crate::mux::{Multiplexer, Outbound};
use crate::state::ConnectionState;
use crate::task::TaskGroup;
use crate::transport::{FrameSink, FrameSource};

pub(crate) struct SessionOutcome {
    /// The host accepted our token during this session.
    pub(crate) authenticated: bool,
    pub(crate) end: SessionEnd,
}

pub(crate) enum SessionEnd {
    /// The link is shutting down.
    Stopped,
    Failed(TetherError),
}

/// What the session's tasks report back.
#[derive(Debug)]
enum SessionEvent {
    AuthAccepted,
    HostError(String),
    TransportLost(TetherError),
}

/// The token currently presented on this session.
#[derive(Debug, Clone)]
struct TokenCell(Arc<Mutex<AuthToken>>);

impl TokenCell {
    fn new(token: AuthToken) -> Self {
        Self(Arc::new(Mutex::new(token)))
    }

    fn get(&self) -> AuthToken {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn replace(&self, token: AuthToken) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }
}

/// An in-place token refresh waiting for the host's reply. The fresh
/// token only becomes current once the host accepts it.
struct PendingRefresh {
    token: AuthToken,
    deadline: Instant,
}

pub(crate) async fn run(shared: &Arc<LinkShared>) -> SessionOutcome {
    let cancel = shared.cancel.clone();
    let failed = |err| SessionOutcome {
        authenticated: false,
        end: SessionEnd::Failed(err),
    };

    // ── Open ─────────────────────────────────────────────────────
    let token = match shared.credentials.issue(&shared.config.auth.subject) {
        Ok(token) => token,
        Err(e) => return failed(e),
    };
    let connect_timeout = shared.config.connect_timeout();
    let opened = tokio::select! {
        _ = cancel.cancelled() => {
            return SessionOutcome { authenticated: false, end: SessionEnd::Stopped };
        }
        r = tokio::time::timeout(
            connect_timeout,
            shared.connector.open(&shared.config.endpoint.url, &token),
        ) => r,
    };
    let transport = match opened {
        Ok(Ok(transport)) => transport,
        Ok(Err(e)) => {
            warn!(error = %e, "transport open failed");
            return failed(e);
        }
        Err(_) => {
            warn!(timeout = ?connect_timeout, "transport open timed out");
            return failed(TetherError::Timeout(connect_timeout));
        }
    };

    if !shared.transition(ConnectionState::Authenticating, "transport open") {
        let mut sink = transport.sink;
        let _ = sink.close().await;
        return SessionOutcome {
            authenticated: false,
            end: SessionEnd::Stopped,
        };
    }

    // ── Spawn tasks ──────────────────────────────────────────────
    shared.mux.begin_session();
    let tokens = TokenCell::new(token);
    let probes = ProbeTable::default();
    let (event_tx, events) = mpsc::unbounded_channel();
    let mut group = TaskGroup::child_of(&cancel);

    group.spawn("writer", {
        let writer = Writer {
            sink: transport.sink,
            mux: shared.mux.clone(),
            tokens: tokens.clone(),
            credentials: shared.credentials.clone(),
            send_timeout: shared.config.send_timeout(),
            events: event_tx.clone(),
        };
        move |cancel| writer.run(cancel)
    });
    group.spawn("reader", {
        let reader = Reader {
            source: transport.source,
            mux: shared.mux.clone(),
            probes: probes.clone(),
            receive_timeout: shared.config.receive_timeout(),
            max_malformed: shared.config.health.max_malformed_frames,
            events: event_tx,
        };
        move |cancel| reader.run(cancel)
    });

    let mut session = Session {
        shared,
        tokens,
        probes,
        group,
        events,
        authenticated: false,
    };
    let end = session.supervise().await;
    let authenticated = session.authenticated;
    session.teardown().await;

    SessionOutcome { authenticated, end }
}

struct Session<'a> {
    shared: &'a Arc<LinkShared>,
    tokens: TokenCell,
    probes: ProbeTable,
    group: TaskGroup,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    authenticated: bool,
}

impl Session<'_> {
    async fn supervise(&mut self) -> SessionEnd {
        if let Err(end) = self.authenticate().await {
            return end;
        }
        self.authenticated = true;
        self.shared
            .reconnect_failures
            .store(0, std::sync::atomic::Ordering::Relaxed);
        self.shared
            .tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .session_started(Instant::now().into_std());
        if !self
            .shared
            .transition(ConnectionState::Connected, "token accepted")
        {
            return SessionEnd::Stopped;
        }
        self.connected().await
    }

    /// Send the auth frame and wait for the host's verdict.
    async fn authenticate(&mut self) -> Result<(), SessionEnd> {
        let auth_timeout = self.shared.config.auth_timeout();
        let cancel = self.group.token();
        self.shared
            .mux
            .send_control(Envelope::auth(self.tokens.get().encode()));

        tokio::select! {
            _ = cancel.cancelled() => Err(SessionEnd::Stopped),
            _ = tokio::time::sleep(auth_timeout) => {
                warn!(timeout = ?auth_timeout, "no authentication reply");
                Err(SessionEnd::Failed(TetherError::Timeout(auth_timeout)))
            }
            event = self.events.recv() => match event {
                Some(SessionEvent::AuthAccepted) => {
                    debug!("authentication accepted");
                    Ok(())
                }
                Some(SessionEvent::HostError(reason)) => {
                    warn!(%reason, "authentication rejected");
                    Err(SessionEnd::Failed(TetherError::AuthRejected(reason)))
                }
                Some(SessionEvent::TransportLost(e)) => Err(SessionEnd::Failed(e)),
                None => Err(SessionEnd::Failed(TetherError::Closed(
                    "session tasks ended".into(),
                ))),
            },
        }
    }

    /// Supervise an authenticated session until it ends.
    async fn connected(&mut self) -> SessionEnd {
        let config = &self.shared.config;
        let cancel = self.group.token();

        let (signal_tx, mut signals) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::new(
            config.heartbeat_interval(),
            config.heartbeat_timeout(),
            Arc::clone(&self.shared.tracker),
            self.probes.clone(),
            self.shared.mux.clone(),
            Arc::clone(&self.shared.clock),
        );
        self.group
            .spawn("heartbeat", move |cancel| monitor.run(cancel, signal_tx));

        let refresh_every = config.refresh_interval();
        let mut refresh_ticker =
            tokio::time::interval_at(Instant::now() + refresh_every, refresh_every);
        refresh_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut pending: Option<PendingRefresh> = None;
        let mut refresh_failed = false;

        loop {
            let refresh_deadline = pending.as_ref().map(|p| p.deadline);
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Stopped,

                event = self.events.recv() => match event {
                    Some(SessionEvent::AuthAccepted) => {
                        if let Some(refresh) = pending.take() {
                            info!(expires_at = ?refresh.token.expires_at(), "token refreshed");
                            self.tokens.replace(refresh.token);
                            if std::mem::take(&mut refresh_failed) {
                                self.recover("token refreshed");
                            }
                        } else {
                            debug!("unsolicited auth ack ignored");
                        }
                    }
                    Some(SessionEvent::HostError(reason)) => {
                        if pending.take().is_some() {
                            refresh_failed = true;
                            self.degrade(DegradeReason::TokenRefreshFailed(reason));
                        } else {
                            warn!(%reason, "host reported an error");
                        }
                    }
                    Some(SessionEvent::TransportLost(e)) => {
                        warn!(error = %e, "transport lost");
                        return SessionEnd::Failed(e);
                    }
                    None => {
                        return SessionEnd::Failed(TetherError::Closed("session tasks ended".into()));
                    }
                },

                signal = signals.recv() => match signal {
                    Some(HealthSignal::Healthy | HealthSignal::Recovered) => {
                        if !refresh_failed {
                            self.recover("heartbeat recovered");
                        }
                    }
                    Some(HealthSignal::Degraded(reason)) => self.degrade(reason),
                    Some(HealthSignal::Unhealthy { consecutive }) => {
                        warn!(consecutive, "heartbeat failure threshold reached");
                        return SessionEnd::Failed(TetherError::Closed(format!(
                            "{consecutive} consecutive heartbeat failures"
                        )));
                    }
                    None => {
                        return SessionEnd::Failed(TetherError::Closed("heartbeat monitor ended".into()));
                    }
                },

                _ = refresh_ticker.tick() => {
                    if let Err(e) = self.maybe_refresh(&mut pending, &mut refresh_failed) {
                        return SessionEnd::Failed(e);
                    }
                }

                _ = sleep_until_opt(refresh_deadline) => {
                    pending = None;
                    refresh_failed = true;
                    self.degrade(DegradeReason::TokenRefreshFailed(format!(
                        "no reply within {:?}",
                        self.shared.config.auth_timeout()
                    )));
                }
            }
        }
    }

    /// Issue and present a new token once the current one is close to
    /// expiry. An expired token ends the session.
    fn maybe_refresh(
        &self,
        pending: &mut Option<PendingRefresh>,
        refresh_failed: &mut bool,
    ) -> Result<(), TetherError> {
        let now = self.shared.credentials.now();
        let current = self.tokens.get();
        if !current.is_live(now) {
            return Err(TetherError::Closed("token expired before refresh".into()));
        }
        if pending.is_some() || !current.needs_refresh(now, self.shared.config.auth.refresh_fraction)
        {
            return Ok(());
        }

        match self.shared.credentials.issue(&self.shared.config.auth.subject) {
            Ok(fresh) => {
                debug!(remaining = ?current.remaining(now), "refreshing token in place");
                self.shared.mux.send_control(Envelope::auth(fresh.encode()));
                *pending = Some(PendingRefresh {
                    token: fresh,
                    deadline: Instant::now() + self.shared.config.auth_timeout(),
                });
            }
            Err(e) => {
                *refresh_failed = true;
                self.degrade(DegradeReason::TokenRefreshFailed(e.to_string()));
            }
        }
        Ok(())
    }

    fn degrade(&self, reason: DegradeReason) {
        if self.shared.state() == ConnectionState::Connected {
            self.shared
                .transition(ConnectionState::Degraded, &reason.to_string());
        } else {
            debug!(%reason, "already degraded");
        }
    }

    fn recover(&self, reason: &str) {
        if self.shared.state() == ConnectionState::Degraded {
            self.shared.transition(ConnectionState::Connected, reason);
        }
    }

    async fn teardown(self) {
        self.shared
            .tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .session_ended();
        let aborted = self.group.shutdown(self.shared.config.stop_grace()).await;
        if aborted > 0 {
            warn!(aborted, "session tasks had to be aborted");
        }
        trace!("session torn down");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Writer ───────────────────────────────────────────────────────

/// Sole owner of the sink. Pulls frames from the multiplexer.
struct Writer {
    sink: Box<dyn FrameSink>,
    mux: Multiplexer,
    tokens: TokenCell,
    credentials: CredentialProvider,
    send_timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Writer {
    async fn run(mut self, cancel: CancellationToken) {
        let result = self.pump(&cancel).await;
        if let Err(e) = tokio::time::timeout(self.send_timeout, self.sink.close()).await {
            debug!(error = %e, "sink close timed out");
        }
        if let Err(e) = result {
            let _ = self.events.send(SessionEvent::TransportLost(e));
        }
    }

    async fn pump(&mut self, cancel: &CancellationToken) -> Result<(), TetherError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let frame = match self.mux.next_frame() {
                Some(frame) => frame,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = self.mux.outbound_ready() => {}
                    }
                    continue;
                }
            };

            // Never present an expired token.
            let now = self.credentials.now();
            if !self.tokens.get().is_live(now) {
                return Err(TetherError::Closed("token expired; refusing to send".into()));
            }

            let (envelope, data) = match frame {
                Outbound::Control(env) => (env, None),
                Outbound::Data(msg) => {
                    let env = msg.to_envelope();
                    (env, Some((msg.producer, msg.sequence)))
                }
            };
            let text = match codec::encode(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    match &data {
                        Some((producer, sequence)) => {
                            self.mux.discard(producer, *sequence, RejectReason::TooLarge)
                        }
                        None => warn!(error = %e, kind = %envelope.kind, "control frame dropped"),
                    }
                    continue;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = tokio::time::timeout(self.send_timeout, self.sink.send(text)) => match sent {
                    Ok(Ok(())) => {
                        trace!(kind = %envelope.kind, "frame sent");
                        if let Some((producer, sequence)) = &data {
                            self.mux.mark_sent(producer, *sequence);
                        }
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(TetherError::Timeout(self.send_timeout)),
                },
            }
        }
    }
}

// ── Reader ───────────────────────────────────────────────────────

/// Sole owner of the source. Decodes frames and routes them.
struct Reader {
    source: Box<dyn FrameSource>,
    mux: Multiplexer,
    probes: ProbeTable,
    receive_timeout: Duration,
    max_malformed: u32,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Reader {
    async fn run(mut self, cancel: CancellationToken) {
        let mut malformed: u32 = 0;
        let err = loop {
            let decoded = tokio::select! {
                _ = cancel.cancelled() => return,
                r = tokio::time::timeout(self.receive_timeout, self.source.receive()) => match r {
                    Ok(Ok(raw)) => codec::decode(&raw),
                    // A frame the transport could read but not interpret.
                    Ok(Err(e @ TetherError::Protocol(_))) => Err(e),
                    Ok(Err(e)) => break e,
                    Err(_) => break TetherError::Timeout(self.receive_timeout),
                },
            };

            let inbound = match decoded {
                Ok(inbound) => {
                    malformed = 0;
                    inbound
                }
                Err(e) => {
                    malformed += 1;
                    warn!(error = %e, malformed, "dropping malformed frame");
                    if malformed > self.max_malformed {
                        break TetherError::Closed(format!(
                            "{malformed} consecutive malformed frames"
                        ));
                    }
                    continue;
                }
            };

            match inbound {
                Inbound::AuthAck => {
                    let _ = self.events.send(SessionEvent::AuthAccepted);
                }
                Inbound::Error { reason } => {
                    let _ = self.events.send(SessionEvent::HostError(reason));
                }
                Inbound::HeartbeatAck { sequence } => {
                    if !self.probes.resolve(sequence, Instant::now()) {
                        debug!(sequence, "late or unknown heartbeat reply");
                    }
                }
                Inbound::DeliveryAck { producer, sequence } => {
                    self.mux.acknowledge(&producer, sequence);
                }
                Inbound::ModuleData { producer, payload } => {
                    self.mux.dispatch_inbound(&producer, payload);
                }
            }
        };
        let _ = self.events.send(SessionEvent::TransportLost(err));
    }
}
