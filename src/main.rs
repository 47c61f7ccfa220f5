//! Socket Feli Server
//!
//! Run with: cargo run --bin feli
//!
//! Serves the WebSocket endpoint and relays `temperatura` events to the
//! configured webhook. See `feli --print-config` for every setting.

use anyhow::Context;
use clap::Parser;
use feli::config::{generate_default_config, Config, LoggingConfig};
use feli::webhook::{install_temperature_relay, WebhookClient};
use feli::{serve, AppState, Registry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Bidirectional event messaging over WebSocket
#[derive(Debug, Parser)]
#[command(name = "feli", version, about)]
struct Args {
    /// Path to a TOML config file (defaults to the standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default config file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_default(),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    init_tracing(&config.logging);

    tracing::info!("Starting Socket Feli v{}", env!("CARGO_PKG_VERSION"));

    let registry = Registry::start();

    if config.webhook.enabled {
        let client = WebhookClient::new(&config.webhook).context("building webhook client")?;
        install_temperature_relay(&registry, Arc::new(client))?;
    } else {
        tracing::info!("Temperature relay disabled (set FELI_WEBHOOK_ENABLED=true to enable)");
    }

    serve(AppState::new(registry, config)).await?;

    tracing::info!("Socket Feli stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("feli={},tower_http=info", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
