//! Link configuration.
//!
//! Every knob of the connector lives in [`LinkConfig`]. Sections are
//! `#[serde(default)]` so a TOML file only needs to name what it
//! overrides. Call [`LinkConfig::validate`] before building a link;
//! problems surface as `TetherError::Configuration`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TetherError;

/// Minimum accepted signing secret length in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// Top-level connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Remote host endpoint and transport security.
    pub endpoint: EndpointConfig,
    /// Token identity and lifetime.
    pub auth: AuthConfig,
    /// Heartbeat cadence and degradation thresholds.
    pub health: HealthConfig,
    /// Backoff parameters for reconnection.
    pub reconnect: ReconnectConfig,
    /// Multiplexer queueing.
    pub stream: StreamConfig,
    /// Network operation deadlines.
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// `wss://host:port/path` of the GUI host.
    pub url: String,
    /// Permit plain `ws://` endpoints (loopback development only).
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Subject id presented in issued tokens.
    pub subject: String,
    /// Pre-shared signing secret.
    pub secret: String,
    /// Token lifetime in seconds.
    pub token_lifetime_secs: u64,
    /// How often the live token is checked for refresh.
    pub refresh_interval_secs: u64,
    /// Refresh once this fraction of the lifetime (or less) remains.
    pub refresh_fraction: f64,
    /// Consecutive handshake rejections before the link gives up as a
    /// security failure.
    pub max_auth_rejections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Round-trips slower than this degrade the link.
    pub latency_threshold_ms: u64,
    /// Consecutive probe failures that trigger a reconnect.
    pub failure_threshold: u32,
    /// Rolling window for the error count.
    pub error_window_secs: u64,
    /// Consecutive malformed inbound frames tolerated before the
    /// transport is treated as closed.
    pub max_malformed_frames: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Failed attempts before giving up; `0` retries forever.
    pub max_attempts: u32,
    /// Give up once a failure streak is this old; `0` disables.
    pub max_elapsed_secs: u64,
}

/// What `publish` does when a producer's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowMode {
    /// Suspend the caller until space frees up or the link closes.
    Block,
    /// Return `RejectedError` immediately.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-producer bound on queued plus unacknowledged messages.
    pub queue_capacity: usize,
    pub overflow: OverflowMode,
    /// Number of recent state transitions kept for observers.
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Idle read deadline; silence longer than this closes the transport.
    pub receive_timeout_ms: u64,
    /// Grace period for tasks to unwind on stop or reconnect.
    pub stop_grace_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            auth: AuthConfig::default(),
            health: HealthConfig::default(),
            reconnect: ReconnectConfig::default(),
            stream: StreamConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: "wss://127.0.0.1:9980/tether".into(),
            allow_insecure: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            subject: "tether-agent".into(),
            secret: String::new(),
            token_lifetime_secs: 3600,
            refresh_interval_secs: 300,
            refresh_fraction: 0.1,
            max_auth_rejections: 3,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 5_000,
            latency_threshold_ms: 1_000,
            failure_threshold: 3,
            error_window_secs: 300,
            max_malformed_frames: 5,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            max_attempts: 10,
            max_elapsed_secs: 0,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            overflow: OverflowMode::Block,
            history_capacity: 64,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            auth_timeout_ms: 5_000,
            send_timeout_ms: 5_000,
            receive_timeout_ms: 90_000,
            stop_grace_ms: 2_000,
        }
    }
}

// ── Accessors ────────────────────────────────────────────────────

impl LinkConfig {
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.auth.token_lifetime_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.auth.refresh_interval_secs)
    }

    /// Remaining lifetime at which a token becomes due for refresh.
    pub fn refresh_margin(&self) -> Duration {
        self.token_lifetime().mul_f64(self.auth.refresh_fraction)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.health.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.health.heartbeat_timeout_ms)
    }

    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.health.latency_threshold_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_secs(self.health.error_window_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.auth_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.receive_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.timeouts.stop_grace_ms)
    }

    // ── Validation ───────────────────────────────────────────────

    /// Check the configuration for values no retry could fix.
    pub fn validate(&self) -> Result<(), TetherError> {
        let url = self.endpoint.url.trim();
        if url.is_empty() {
            return Err(config_err("endpoint url is empty"));
        }
        if url.starts_with("ws://") {
            if !self.endpoint.allow_insecure {
                return Err(config_err(
                    "plain ws:// endpoint requires endpoint.allow_insecure = true",
                ));
            }
        } else if !url.starts_with("wss://") {
            return Err(config_err("endpoint url must use the wss:// scheme"));
        }

        if self.auth.secret.len() < MIN_SECRET_LEN {
            return Err(config_err(&format!(
                "signing secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.auth.subject.is_empty() || self.auth.subject.contains('.') {
            return Err(config_err("subject must be non-empty and contain no '.'"));
        }
        if self.auth.token_lifetime_secs == 0 || self.auth.refresh_interval_secs == 0 {
            return Err(config_err("token lifetime and refresh interval must be non-zero"));
        }
        if !(self.auth.refresh_fraction > 0.0 && self.auth.refresh_fraction < 1.0) {
            return Err(config_err("refresh_fraction must be in (0, 1)"));
        }
        // A check interval longer than the margin could miss the window.
        if self.refresh_interval() >= self.refresh_margin() {
            return Err(config_err(
                "refresh interval must be shorter than the refresh margin",
            ));
        }

        if self.health.heartbeat_interval_ms == 0 || self.health.heartbeat_timeout_ms == 0 {
            return Err(config_err("heartbeat interval and timeout must be non-zero"));
        }
        if self.health.heartbeat_timeout_ms >= self.health.heartbeat_interval_ms {
            return Err(config_err("heartbeat timeout must be shorter than the interval"));
        }
        if self.health.failure_threshold == 0 {
            return Err(config_err("failure_threshold must be at least 1"));
        }

        if self.reconnect.multiplier < 1.0 {
            return Err(config_err("backoff multiplier must be >= 1.0"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(config_err("max_delay_ms must be >= base_delay_ms"));
        }

        if self.stream.queue_capacity == 0 {
            return Err(config_err("queue_capacity must be non-zero"));
        }
        if self.timeouts.connect_timeout_ms == 0
            || self.timeouts.auth_timeout_ms == 0
            || self.timeouts.send_timeout_ms == 0
            || self.timeouts.receive_timeout_ms == 0
        {
            return Err(config_err("network timeouts must be non-zero"));
        }
        Ok(())
    }
}

fn config_err(msg: &str) -> TetherError {
    TetherError::Configuration(msg.to_string())
}

// ── Tests ────────────────────────────────────────────────────────
