//! Domain-specific error types for the tether connector.
//!
//! All fallible operations return `Result<T, TetherError>`.
//! Variants follow the connector's failure taxonomy: fatal errors
//! (`Configuration`, `Security`) close the link for good, transient
//! ones are absorbed by the reconnection policy, and `Rejected` is
//! handed straight back to the producer that caused it.

use std::time::Duration;
use thiserror::Error;

use crate::mux::ProducerId;

/// The canonical error type for the tether connector.
#[derive(Debug, Clone, Error)]
pub enum TetherError {
    // ── Fatal ────────────────────────────────────────────────────
    /// Bad or missing configuration (secret, endpoint, limits).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Certificate / identity failure, or repeated auth rejection.
    #[error("security error: {0}")]
    Security(String),

    // ── Transient ────────────────────────────────────────────────
    /// The transport could not be opened.
    #[error("connect error: {0}")]
    Connect(String),

    /// A frame could not be written to the transport.
    #[error("send error: {0}")]
    Send(String),

    /// The transport (or the link) is closed.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The remote host rejected a single authentication attempt.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Local ────────────────────────────────────────────────────
    /// A publish was refused locally (backpressure or closed link).
    #[error("publish rejected for producer {producer}: {reason}")]
    Rejected {
        producer: ProducerId,
        reason: RejectReason,
    },

    /// A malformed inbound frame.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Why a publish was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The producer's outbound queue is at capacity.
    QueueFull,
    /// The link has been closed.
    Closed,
    /// The encoded frame would exceed the transport's size limit.
    TooLarge,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::Closed => write!(f, "link closed"),
            Self::TooLarge => write!(f, "message too large"),
        }
    }
}

impl TetherError {
    /// Errors the reconnection policy is allowed to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_)
                | Self::Send(_)
                | Self::Closed(_)
                | Self::AuthRejected(_)
                | Self::Timeout(_)
        )
    }

    /// Errors that close the link without any retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Security(_))
    }

    pub(crate) fn rejected(producer: &ProducerId, reason: RejectReason) -> Self {
        Self::Rejected {
            producer: producer.clone(),
            reason,
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(e: serde_json::Error) -> Self {
        TetherError::Protocol(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TetherError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TetherError::Closed("channel closed".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(TetherError::Connect("refused".into()).is_retryable());
        assert!(TetherError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(TetherError::AuthRejected("bad token".into()).is_retryable());
        assert!(!TetherError::Security("cert".into()).is_retryable());
        assert!(TetherError::Security("cert".into()).is_fatal());
        assert!(TetherError::Configuration("secret".into()).is_fatal());
        assert!(!TetherError::Protocol("junk".into()).is_fatal());
    }

    #[test]
    fn rejected_display_names_producer() {
        let e = TetherError::rejected(&ProducerId::from("cost"), RejectReason::QueueFull);
        let text = e.to_string();
        assert!(text.contains("cost"));
        assert!(text.contains("queue full"));
        assert!(!e.is_retryable());
    }

    #[test]
    fn from_json_error_is_protocol() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let e: TetherError = err.into();
        assert!(matches!(e, TetherError::Protocol(_)));
    }
}
