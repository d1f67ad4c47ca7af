//! Agent service core logic.
//!
//! Owns the link to the GUI host and the built-in modules, logs every
//! connection status change, and runs until shutdown is requested or the
//! link closes on its own.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tether_core::task::TaskGroup;
use tether_core::{CloseReason, ConnectionState, Connector, Link, StatusEvent, TetherError};

use crate::config::AgentConfig;
use crate::modules::system;

// ── AgentService ─────────────────────────────────────────────────

/// The top-level agent service.
pub struct AgentService {
    config: AgentConfig,
    link: Link,
}

impl AgentService {
    /// Build the service over the configured WebSocket endpoint.
    pub fn new(config: AgentConfig) -> Result<Self, TetherError> {
        let link = Link::connect(config.link.clone())?;
        Ok(Self { config, link })
    }

    /// Build the service over an explicit connector.
    pub fn with_connector(
        config: AgentConfig,
        connector: impl Connector,
    ) -> Result<Self, TetherError> {
        let link = Link::new(config.link.clone(), connector)?;
        Ok(Self { config, link })
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Run until `shutdown` resolves or the link closes by itself.
    ///
    /// 1. Starts the status logger and the enabled modules.
    /// 2. Starts the link.
    /// 3. On shutdown, stops the link within its grace period.
    /// 4. Stops the modules and returns why the link closed.
    pub async fn run(
        &self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<CloseReason, TetherError> {
        let root = CancellationToken::new();
        let mut tasks = TaskGroup::child_of(&root);

        let events = self.link.subscribe();
        tasks.spawn("status-log", move |cancel| log_status(events, cancel));

        if self.config.modules.system_enabled {
            let link = self.link.clone();
            let interval = Duration::from_secs(self.config.modules.system_interval_secs.max(1));
            tasks.spawn("system", move |cancel| system::run(link, interval, cancel));
        }

        self.link.start()?;

        let reason = tokio::select! {
            _ = shutdown => {
                info!("shutdown requested");
                self.link.stop().await;
                self.link.closed().await
            }
            reason = self.link.closed() => {
                // Join the driver even though it already gave up.
                self.link.stop().await;
                reason
            }
        };

        tasks.shutdown(self.link.stop_grace()).await;
        match &reason {
            CloseReason::Stopped => info!("agent stopped"),
            other => error!(reason = %other, "link closed"),
        }
        Ok(reason)
    }
}

/// Log every state change; impaired states at `warn`.
async fn log_status(mut events: broadcast::Receiver<StatusEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(ev) => match ev.to {
                ConnectionState::Degraded | ConnectionState::Reconnecting => {
                    warn!(from = %ev.from, to = %ev.to, reason = %ev.reason, "link status")
                }
                _ => info!(from = %ev.from, to = %ev.to, reason = %ev.reason, "link status"),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "status log lagging; events skipped")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::message::Envelope;
    use tether_core::{FrameKind, MemoryConnector};

    fn config() -> AgentConfig {
        let mut cfg = AgentConfig::default();
        cfg.link.auth.secret = "agent-test-secret-0123".into();
        cfg.modules.system_interval_secs = 1;
        cfg
    }

    #[tokio::test]
    async fn invalid_secret_is_refused_up_front() {
        let (connector, _host) = MemoryConnector::new();
        let err = AgentService::with_connector(AgentConfig::default(), connector)
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn streams_system_samples_until_shutdown() {
        let (connector, mut host) = MemoryConnector::new();
        let service = AgentService::with_connector(config(), connector).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let host_task = tokio::spawn(async move {
            let mut conn = host.accept().await.unwrap();
            let auth = conn.recv().await.unwrap();
            assert_eq!(auth.kind, FrameKind::Auth);
            conn.send(&Envelope::ack(None, None)).unwrap();

            loop {
                let env = conn.recv().await.unwrap();
                if env.kind == FrameKind::ModuleData {
                    assert_eq!(env.producer_id.unwrap().as_str(), system::PRODUCER_ID);
                    let payload = env.payload.unwrap();
                    assert!(payload["state"].is_string());
                    assert!(payload.get("consecutiveFailures").is_some());
                    let _ = stop_tx.send(());
                    return;
                }
            }
        });

        let reason = service
            .run(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
        assert!(matches!(reason, CloseReason::Stopped));
        assert_eq!(service.link().state(), ConnectionState::Closed);
        host_task.await.unwrap();
    }
}
