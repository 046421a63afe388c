//! kiosk-agent - Main entry point
//!
//! Loads `agent.toml`, builds the agent, starts its background loops and the
//! local status server, and runs until Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kiosk_agent::agent::{Agent, AgentSettings};
use kiosk_agent::api;
use kiosk_agent::player::TracingSink;
use kiosk_common::config::{default_data_root, resolve_dir, TomlConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for kiosk-agent
#[derive(Parser, Debug)]
#[command(name = "kiosk-agent")]
#[command(about = "Edge agent for digital signage kiosks")]
#[command(version)]
struct Args {
    /// Directory holding agent.toml and local state
    #[arg(long, env = "KIOSK_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory holding synced media files
    #[arg(long, env = "KIOSK_MEDIA_DIR")]
    media_dir: Option<PathBuf>,

    /// Local status server port
    #[arg(short, long, env = "KIOSK_PORT")]
    port: Option<u16>,

    /// Authority base URL
    #[arg(long, env = "KIOSK_AUTHORITY_URL")]
    authority_url: Option<String>,

    /// Fixed device identifier
    #[arg(long, env = "KIOSK_DEVICE_ID")]
    device_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_dir = args
        .config_dir
        .clone()
        .unwrap_or_else(|| default_data_root().join("config"));
    // Config is read before tracing so the [logging] level can seed the filter
    let config_result = TomlConfig::load(&config_dir);
    let level = config_result
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("kiosk_agent={level},kiosk_common={level},tower_http=info").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting kiosk-agent v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config_result
        .with_context(|| format!("Failed to load config from {}", config_dir.display()))?;
    if let Some(url) = args.authority_url {
        config.authority.base_url = url;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let media_dir = resolve_dir(args.media_dir.as_deref(), config.media_dir.as_deref(), "media");
    info!("Config directory: {}", config_dir.display());
    info!("Media directory: {}", media_dir.display());
    info!("Authority: {}", config.authority.base_url);

    let port = config.server.port;
    let settings = AgentSettings {
        config,
        config_dir,
        media_dir,
        device_id: args.device_id,
    };
    let agent = Arc::new(
        Agent::build(settings, Arc::new(TracingSink)).context("Failed to initialize agent")?,
    );

    let cancel = CancellationToken::new();
    let handles = agent.spawn(cancel.clone());
    tokio::spawn(shutdown_signal(cancel.clone()));

    let served = api::serve(agent, port, cancel.clone()).await;
    // Server exit for any reason stops the background loops too
    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    served.context("Server error")?;
    info!("Shutdown complete");
    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
