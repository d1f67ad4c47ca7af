//! Transport: one bidirectional stream of text frames to the host.
//!
//! A [`Connector`] opens a [`Transport`], which is immediately split
//! into a [`FrameSink`] (owned by the single writer task) and a
//! [`FrameSource`] (owned by the reader task). A transport is never
//! reused: reconnecting opens a new one.
//!
//! Implementations:
//! - [`WsConnector`]: WebSocket over TLS, for real hosts.
//! - [`MemoryConnector`]: in-process loopback with a scriptable host.

use async_trait::async_trait;

use crate::credentials::AuthToken;
use crate::error::TetherError;

pub mod memory;
pub mod websocket;

pub use memory::{HostConnection, MemoryConnector, MemoryHost, OpenOutcome};
pub use websocket::WsConnector;

/// Opens transports to an endpoint.
///
/// Failures must be classified: certificate or identity problems are
/// `TetherError::Security` (never retried), unreachable endpoints are
/// `TetherError::Connect`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, endpoint: &str, token: &AuthToken) -> Result<Transport, TetherError>;
}

/// Write half. `send` on a closed sink fails with `TetherError::Closed`.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), TetherError>;
    async fn close(&mut self) -> Result<(), TetherError>;
}

/// Read half. Returns `TetherError::Closed` once the peer is gone.
#[async_trait]
pub trait FrameSource: Send {
    async fn receive(&mut self) -> Result<String, TetherError>;
}

/// An open transport, already split into its halves.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Transport {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}
