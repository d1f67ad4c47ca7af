//! The connection lifecycle state and its transition table.
//!
//! ```text
//!  Idle ──► Connecting ──► Authenticating ──► Connected ◄──► Degraded
//!               ▲   │              │              │              │
//!               │   ▼              ▼              ▼              ▼
//!               └─ Reconnecting ◄──┴──────────────┴──────────────┘
//!
//!  any state ──stop()──► Closed   (terminal)
//! ```

use std::fmt;

use crate::error::TetherError;

/// Lifecycle state of the single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Built, not started.
    #[default]
    Idle,
    /// Opening the transport.
    Connecting,
    /// Transport is open; waiting for the host to accept the token.
    Authenticating,
    /// Authenticated and healthy.
    Connected,
    /// Authenticated, but heartbeats are slow or failing.
    Degraded,
    /// Waiting out a backoff before the next attempt.
    Reconnecting,
    /// Terminal. Reached only by `stop()`, a fatal error, or giving up.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ConnectionState {
    /// Data frames may be written in this state.
    pub fn accepts_data(&self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    /// A transport is installed in this state.
    pub fn has_transport(&self) -> bool {
        matches!(self, Self::Authenticating | Self::Connected | Self::Degraded)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether `self → next` is an edge of the state graph.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Connecting) => true,
            (Connecting, Authenticating | Reconnecting) => true,
            (Authenticating, Connected | Reconnecting) => true,
            (Connected, Degraded | Reconnecting) => true,
            (Degraded, Connected | Reconnecting) => true,
            (Reconnecting, Connecting) => true,
            _ => false,
        }
    }

    /// Move to `next`, refusing edges outside the graph.
    pub fn transition(&mut self, next: ConnectionState) -> Result<ConnectionState, TetherError> {
        if !self.can_transition_to(next) {
            return Err(TetherError::Protocol(format!(
                "invalid state transition {self} -> {next}"
            )));
        }
        let previous = *self;
        *self = next;
        Ok(previous)
    }
}

// ── Tests ────────────────────────────────────────────────────────
