//! OCPP Gateway CLI server
//!
//! Headless OCPP 1.6 WebSocket gateway suitable for deployment as a systemd
//! service, Docker container, or standalone process. Domain events are
//! written to the log as JSON lines.
//!
//! ```sh
//! # Run with default config (~/.config/ocpp-gateway/config.toml)
//! ocpp-gateway
//!
//! # Custom config path
//! ocpp-gateway --config /etc/ocpp-gateway/config.toml
//!
//! # Override ports
//! ocpp-gateway --api-port 8080 --ws-port 9000
//!
//! # Validate config without starting
//! ocpp-gateway --check
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};

use ocpp_gateway::config::{resolve_config_path, AppConfig, CONFIG_ENV_VAR};
use ocpp_gateway::server::{init_tracing, ServerHandle, ServerOptions};

/// OCPP Gateway: WebSocket front end for OCPP 1.6 charge points.
#[derive(Parser, Debug)]
#[command(
    name = "ocpp-gateway",
    version,
    about = "OCPP 1.6 WebSocket gateway for EV charging stations",
    long_about = "OCPP Gateway terminates OCPP 1.6 JSON WebSocket connections \
                  and publishes charge point activity as domain events.\n\n\
                  Default config: ~/.config/ocpp-gateway/config.toml"
)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Override the HTTP API listen port.
    #[arg(long)]
    api_port: Option<u16>,

    /// Override the WebSocket listen port.
    #[arg(long)]
    ws_port: Option<u16>,

    /// Override the instance id used in the connection registry.
    #[arg(long)]
    instance_id: Option<String>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration file and exit without starting the server.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // ── Load configuration ─────────────────────────────────────
    let config_path = resolve_config_path(cli.config);

    let mut config = match AppConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) if cli.check => {
            eprintln!("❌ Failed to load config from {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .init();
            error!("Failed to load config from {}: {}", config_path.display(), e);
            return Err(e.into());
        }
    };

    // ── Apply CLI overrides ────────────────────────────────────
    if let Some(port) = cli.api_port {
        config.server.api_port = port;
    }
    if let Some(port) = cli.ws_port {
        config.server.ws_port = port;
    }
    if let Some(ref id) = cli.instance_id {
        config.server.instance_id = id.clone();
    }
    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }

    // ── Config validation mode ─────────────────────────────────
    if cli.check {
        if let Err(e) = config.check() {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
        println!("✅ Configuration is valid");
        println!("   Config file : {}", config_path.display());
        println!("   API address : {}", config.server.api_address());
        println!("   WS address  : {}", config.server.ws_address());
        println!("   Instance id : {}", config.server.instance_id);
        println!("   Auth        : {}", config.security.require_auth);
        println!("   Log level   : {}", config.logging.level);
        return Ok(());
    }

    init_tracing(&config);
    info!("Configuration loaded from {}", config_path.display());

    // ── Start server ───────────────────────────────────────────
    let handle = ServerHandle::start(ServerOptions {
        config,
        ..ServerOptions::default()
    })
    .await?;

    if let Some(mut events) = handle.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => info!(target: "ocpp_gateway::events", "{}", line),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                }
            }
        });
    }

    // Install OS signal handlers (SIGTERM, SIGINT)
    handle.install_signal_handler();

    info!("🚀 Press Ctrl+C to shutdown gracefully.");

    handle.wait().await;

    Ok(())
}
