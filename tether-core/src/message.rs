//! Wire envelope and typed inbound messages.
//!
//! Every frame exchanged with the host is one JSON envelope:
//!
//! ```text
//! { "type": "module_data", "producerId": "cost", "sequence": 7,
//!   "timestamp": 1700000000000, "payload": { ... } }
//! ```
//!
//! Outbound frames are built with the `Envelope` constructors.
//! Inbound frames are converted into [`Inbound`], a closed set of
//! variants, before anything acts on them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::unix_millis;
use crate::error::TetherError;
use crate::mux::ProducerId;

// ── FrameKind ────────────────────────────────────────────────────

/// The `type` tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Auth,
    Heartbeat,
    ModuleData,
    Ack,
    Error,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Auth => "auth",
            FrameKind::Heartbeat => "heartbeat",
            FrameKind::ModuleData => "module_data",
            FrameKind::Ack => "ack",
            FrameKind::Error => "error",
        };
        f.write_str(name)
    }
}

// ── Envelope ─────────────────────────────────────────────────────

/// The structured frame carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<ProducerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Unix milliseconds at creation.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Envelope {
    fn bare(kind: FrameKind) -> Self {
        Self {
            kind,
            producer_id: None,
            sequence: None,
            timestamp: unix_millis(std::time::SystemTime::now()),
            payload: None,
            token: None,
            reason: None,
        }
    }

    /// `{type: auth, token}`: first frame after the transport opens,
    /// and again on every in-place token refresh.
    pub fn auth(token: String) -> Self {
        Self {
            token: Some(token),
            ..Self::bare(FrameKind::Auth)
        }
    }

    /// Heartbeat probe carrying its probe sequence.
    pub fn heartbeat(sequence: u64) -> Self {
        Self {
            sequence: Some(sequence),
            ..Self::bare(FrameKind::Heartbeat)
        }
    }

    /// A producer's data message.
    pub fn module_data(producer: ProducerId, sequence: u64, timestamp: u64, payload: Value) -> Self {
        Self {
            producer_id: Some(producer),
            sequence: Some(sequence),
            timestamp,
            payload: Some(payload),
            ..Self::bare(FrameKind::ModuleData)
        }
    }

    /// Plain acknowledgement; with no fields it accepts an auth handshake.
    pub fn ack(producer: Option<ProducerId>, sequence: Option<u64>) -> Self {
        Self {
            producer_id: producer,
            sequence,
            ..Self::bare(FrameKind::Ack)
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::bare(FrameKind::Error)
        }
    }
}

// ── Inbound ──────────────────────────────────────────────────────

/// A decoded inbound frame, one variant per thing the connector acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The host accepted the presented token.
    AuthAck,
    /// Reply to heartbeat probe `sequence`.
    HeartbeatAck { sequence: u64 },
    /// The host received `(producer, sequence)`.
    DeliveryAck { producer: ProducerId, sequence: u64 },
    /// Host-to-module data.
    ModuleData { producer: ProducerId, payload: Value },
    /// The host reported an error (auth rejection during the handshake).
    Error { reason: String },
}

impl TryFrom<Envelope> for Inbound {
    type Error = TetherError;

    fn try_from(env: Envelope) -> Result<Self, TetherError> {
        match (env.kind, env.producer_id, env.sequence) {
            (FrameKind::Ack, None, None) => Ok(Inbound::AuthAck),
            (FrameKind::Ack, None, Some(sequence)) => Ok(Inbound::HeartbeatAck { sequence }),
            (FrameKind::Ack, Some(producer), Some(sequence)) => {
                Ok(Inbound::DeliveryAck { producer, sequence })
            }
            (FrameKind::Heartbeat, None, Some(sequence)) => Ok(Inbound::HeartbeatAck { sequence }),
            (FrameKind::ModuleData, Some(producer), _) => Ok(Inbound::ModuleData {
                producer,
                payload: env.payload.unwrap_or(Value::Null),
            }),
            (FrameKind::Error, _, _) => Ok(Inbound::Error {
                reason: env.reason.unwrap_or_else(|| "unspecified".into()),
            }),
            (kind, _, _) => Err(TetherError::Protocol(format!(
                "unexpected inbound {kind} frame shape"
            ))),
        }
    }
}
