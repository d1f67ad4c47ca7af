//! WebSocket transport over TLS.
//!
//! `wss://` endpoints are verified against the webpki root store by
//! rustls before the stream is handed back; a certificate or identity
//! mismatch fails fast as `TetherError::Security`. The token is also
//! presented in the upgrade request's `Authorization` header.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use super::{Connector, FrameSink, FrameSource, Transport};
use crate::credentials::AuthToken;
use crate::error::TetherError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket transports.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    allow_insecure: bool,
}

impl WsConnector {
    /// TLS-only connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also accept plain `ws://` endpoints.
    pub fn allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &str, token: &AuthToken) -> Result<Transport, TetherError> {
        if endpoint.starts_with("ws://") && !self.allow_insecure {
            return Err(TetherError::Configuration(format!(
                "refusing unencrypted endpoint {endpoint}"
            )));
        }

        let mut request = endpoint.into_client_request().map_err(classify)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.encode()))
            .map_err(|e| TetherError::Configuration(format!("token not header-safe: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!(endpoint, "opening websocket");
        let (stream, response) = connect_async(request).await.map_err(classify)?;
        debug!(status = %response.status(), "websocket upgraded");

        let (sink, source) = stream.split();
        Ok(Transport::new(WsSink { inner: sink }, WsSource { inner: source }))
    }
}

/// Map a handshake failure onto the connector's error taxonomy.
fn classify(err: tungstenite::Error) -> TetherError {
    use tungstenite::Error;
    match err {
        Error::Tls(e) => TetherError::Security(format!("tls: {e}")),
        // rustls reports handshake and certificate failures as InvalidData.
        Error::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            TetherError::Security(format!("tls handshake: {e}"))
        }
        Error::Io(e) => TetherError::Connect(e.to_string()),
        Error::Url(e) => TetherError::Configuration(format!("endpoint: {e}")),
        Error::Http(response) => match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                TetherError::AuthRejected(format!("upgrade refused: {}", response.status()))
            }
            status => TetherError::Connect(format!("upgrade failed: {status}")),
        },
        Error::ConnectionClosed | Error::AlreadyClosed => {
            TetherError::Closed("closed during handshake".into())
        }
        other => TetherError::Connect(other.to_string()),
    }
}

// ── Halves ───────────────────────────────────────────────────────

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), TetherError> {
        self.inner
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    TetherError::Closed("websocket closed".into())
                }
                other => TetherError::Send(other.to_string()),
            })
    }

    async fn close(&mut self) -> Result<(), TetherError> {
        match self.inner.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(TetherError::Send(e.to_string())),
        }
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn receive(&mut self) -> Result<String, TetherError> {
        loop {
            match self.inner.next().await {
                None => return Err(TetherError::Closed("websocket stream ended".into())),
                Some(Err(e)) => return Err(TetherError::Closed(e.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec())
                        .map_err(|e| TetherError::Protocol(format!("binary frame not utf-8: {e}")));
                }
                Some(Ok(Message::Close(frame))) => {
                    let why = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "no close frame".into());
                    return Err(TetherError::Closed(format!("host closed: {why}")));
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            }
        }
    }
}
