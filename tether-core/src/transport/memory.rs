//! In-process loopback transport.
//!
//! [`MemoryConnector`] hands each opened transport's far end to a
//! [`MemoryHost`], which plays the remote host. Each `open` consumes the
//! next scripted [`OpenOutcome`]; once the script runs out every open
//! is accepted. Open instants are recorded on the tokio clock so
//! backoff schedules can be checked under a paused runtime.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Connector, FrameSink, FrameSource, Transport};
use crate::codec;
use crate::credentials::AuthToken;
use crate::error::TetherError;
use crate::message::Envelope;

/// Scripted result of one `open` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Accept,
    /// Transient refusal (`ConnectError`).
    Refuse,
    /// Identity failure (`SecurityError`).
    CertificateMismatch,
}

/// A frame on the host-to-client path. Binary frames must hold UTF-8
/// text, as on a WebSocket.
#[derive(Debug)]
enum HostFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug)]
struct Inner {
    script: VecDeque<OpenOutcome>,
    opens: Vec<Instant>,
    accepted: mpsc::UnboundedSender<HostConnection>,
}

/// Client-side connector.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    inner: Arc<Mutex<Inner>>,
}

/// Host side: receives accepted connections.
#[derive(Debug)]
pub struct MemoryHost {
    inner: Arc<Mutex<Inner>>,
    accepted: mpsc::UnboundedReceiver<HostConnection>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryHost) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Mutex::new(Inner {
            script: VecDeque::new(),
            opens: Vec::new(),
            accepted: tx,
        }));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            MemoryHost {
                inner,
                accepted: rx,
            },
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, _endpoint: &str, token: &AuthToken) -> Result<Transport, TetherError> {
        let mut inner = self.lock();
        inner.opens.push(Instant::now());
        match inner.script.pop_front().unwrap_or(OpenOutcome::Accept) {
            OpenOutcome::Refuse => Err(TetherError::Connect("connection refused".into())),
            OpenOutcome::CertificateMismatch => {
                Err(TetherError::Security("certificate does not match host identity".into()))
            }
            OpenOutcome::Accept => {
                let (to_host, from_client) = mpsc::unbounded_channel();
                let (to_client, from_host) = mpsc::unbounded_channel();
                let conn = HostConnection {
                    token: token.clone(),
                    to_client,
                    from_client,
                };
                inner
                    .accepted
                    .send(conn)
                    .map_err(|_| TetherError::Connect("host is gone".into()))?;
                Ok(Transport::new(
                    MemorySink { tx: Some(to_host) },
                    MemorySource { rx: from_host },
                ))
            }
        }
    }
}

impl MemoryHost {
    /// Queue outcomes for the next `open` calls.
    pub fn script(&self, outcomes: impl IntoIterator<Item = OpenOutcome>) {
        self.lock().script.extend(outcomes);
    }

    /// Instants of every `open` call so far.
    pub fn open_times(&self) -> Vec<Instant> {
        self.lock().opens.clone()
    }

    /// Next accepted connection.
    pub async fn accept(&mut self) -> Option<HostConnection> {
        self.accepted.recv().await
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── HostConnection ───────────────────────────────────────────────

/// The host's end of one transport. Dropping it closes the transport.
#[derive(Debug)]
pub struct HostConnection {
    /// Token presented at open time.
    pub token: AuthToken,
    to_client: mpsc::UnboundedSender<HostFrame>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl HostConnection {
    /// Next raw frame from the client; `None` once the client closed.
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame from the client, parsed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let raw = self.recv_raw().await?;
        serde_json::from_str(&raw).ok()
    }

    /// Send an envelope to the client.
    pub fn send(&self, envelope: &Envelope) -> Result<(), TetherError> {
        let frame = codec::encode(envelope)?;
        self.send_raw(frame)
    }

    /// Send raw text (e.g. a malformed frame) to the client.
    pub fn send_raw(&self, frame: impl Into<String>) -> Result<(), TetherError> {
        self.push(HostFrame::Text(frame.into()))
    }

    /// Send a binary frame; the client rejects bytes that are not UTF-8.
    pub fn send_binary(&self, bytes: impl Into<Vec<u8>>) -> Result<(), TetherError> {
        self.push(HostFrame::Binary(bytes.into()))
    }

    fn push(&self, frame: HostFrame) -> Result<(), TetherError> {
        self.to_client
            .send(frame)
            .map_err(|_| TetherError::Closed("client gone".into()))
    }
}

// ── Halves ───────────────────────────────────────────────────────

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), TetherError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TetherError::Closed("sink closed".into()))?;
        tx.send(frame)
            .map_err(|_| TetherError::Closed("host dropped connection".into()))
    }

    async fn close(&mut self) -> Result<(), TetherError> {
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<HostFrame>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn receive(&mut self) -> Result<String, TetherError> {
        match self.rx.recv().await {
            Some(HostFrame::Text(text)) => Ok(text),
            Some(HostFrame::Binary(bytes)) => String::from_utf8(bytes)
                .map_err(|e| TetherError::Protocol(format!("binary frame not utf-8: {e}"))),
            None => Err(TetherError::Closed("host dropped connection".into())),
        }
    }
}
