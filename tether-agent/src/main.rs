//! tether agent: entry point.
//!
//! ```text
//! tether-agent                    Run in the foreground
//! tether-agent --config <path>    Load a custom config TOML
//! tether-agent --endpoint <url>   Override link.endpoint.url
//! tether-agent --gen-config       Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tether_agent::config::AgentConfig;
use tether_agent::service::AgentService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-agent", about = "Streams module data to the GUI host")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tether-agent.toml")]
    config: PathBuf,

    /// Override the host endpoint URL.
    #[arg(long)]
    endpoint: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&AgentConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config. A broken file stops startup rather than running on defaults.
    let mut config = AgentConfig::load(&cli.config)?;
    config.apply_env();
    if let Some(endpoint) = cli.endpoint {
        config.link.endpoint.url = endpoint;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tether-agent v{}", env!("CARGO_PKG_VERSION"));
    info!("endpoint: {}", config.link.endpoint.url);
    info!("subject: {}", config.link.auth.subject);
    info!(
        "heartbeat: every {} ms, timeout {} ms",
        config.link.health.heartbeat_interval_ms, config.link.health.heartbeat_timeout_ms
    );

    let service = AgentService::new(config)?;

    // Ctrl-C stops the link.
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received; shutting down");
    };

    let reason = service.run(shutdown).await?;
    if reason.is_failure() {
        error!("exiting: {reason}");
        std::process::exit(1);
    }

    Ok(())
}
