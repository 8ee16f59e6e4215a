use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::HttpServer;
use turnstile::ratelimit::LimiterStore;

/// Per-key token bucket admission control in front of an HTTP router.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    config.validate()?;
    info!(addr = %config.server.addr, "Configuration loaded");

    // The store lives for the whole process; dropping it stops the sweeper
    let store = Arc::new(LimiterStore::with_cleanup(
        config.rate_limiting.cleanup_interval(),
    )?);

    let server = HttpServer::from_config(&config, Arc::clone(&store))?;
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!(tracked_keys = store.len(), "Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
