//! Configuration for the tether agent.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tether_core::{LinkConfig, TetherError};

/// Environment variable that overrides `link.auth.secret`.
pub const SECRET_ENV: &str = "TETHER_SECRET";

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Connection to the GUI host.
    pub link: LinkConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Built-in producer modules.
    pub modules: ModulesConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. "info" or
    /// "tether_core=debug,info".
    pub level: String,
}

/// Built-in modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Stream the link's own state and health as the `system` producer.
    pub system_enabled: bool,
    /// Seconds between `system` samples.
    pub system_interval_secs: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            system_enabled: true,
            system_interval_secs: 10,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AgentConfig {
    /// Load configuration from a TOML file. A missing file yields the
    /// defaults; an unreadable or invalid one is a `Configuration` error.
    pub fn load(path: &Path) -> Result<Self, TetherError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config at {}; using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(TetherError::Configuration(format!(
                    "cannot read config {}: {e}",
                    path.display()
                )));
            }
        };
        toml::from_str(&contents).map_err(|e| {
            TetherError::Configuration(format!("invalid config {}: {e}", path.display()))
        })
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Apply overrides from the environment.
    pub fn apply_env(&mut self) {
        self.apply_secret(std::env::var(SECRET_ENV).ok());
    }

    /// Replace the signing secret if `secret` is non-empty.
    pub fn apply_secret(&mut self, secret: Option<String>) {
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            self.link.auth.secret = secret;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&AgentConfig::default()).unwrap();
        assert!(text.contains("[link.endpoint]"));
        assert!(text.contains("heartbeat_interval_ms"));
        assert!(text.contains("system_interval_secs"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let text = r#"
            [link.endpoint]
            url = "wss://gui.local:9443/tether"

            [link.reconnect]
            max_attempts = 0

            [modules]
            system_interval_secs = 2
        "#;
        let cfg: AgentConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.link.endpoint.url, "wss://gui.local:9443/tether");
        assert_eq!(cfg.link.reconnect.max_attempts, 0);
        assert_eq!(cfg.link.reconnect.base_delay_ms, 1000);
        assert_eq!(cfg.modules.system_interval_secs, 2);
        assert!(cfg.modules.system_enabled);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = AgentConfig::load(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(cfg.link.stream.queue_capacity, 1000);
    }

    #[test]
    fn invalid_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("tether-agent-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[link.reconnect]\nmax_attempts = \"many\"\n").unwrap();
        let err = AgentConfig::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, TetherError::Configuration(_)), "{err:?}");
        assert!(err.to_string().contains("invalid config"), "{err}");
    }

    #[test]
    fn unreadable_path_is_rejected() {
        // A directory exists but cannot be read as a file.
        let err = AgentConfig::load(&std::env::temp_dir()).unwrap_err();
        assert!(matches!(err, TetherError::Configuration(_)), "{err:?}");
    }

    #[test]
    fn write_default_then_load() {
        let path = std::env::temp_dir().join(format!("tether-agent-{}.toml", std::process::id()));
        AgentConfig::write_default(&path).unwrap();
        let cfg = AgentConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.link.health.failure_threshold, 3);
    }

    #[test]
    fn secret_override() {
        let mut cfg = AgentConfig::default();
        cfg.apply_secret(Some(String::new()));
        assert!(cfg.link.auth.secret.is_empty());
        cfg.apply_secret(Some("from-the-environment".into()));
        assert_eq!(cfg.link.auth.secret, "from-the-environment");
        cfg.apply_secret(None);
        assert_eq!(cfg.link.auth.secret, "from-the-environment");
    }
}
