//! tfstate-backend -- Terraform http remote state server.
//!
//! The process is stateless: all state lives in the object store, so a
//! restart needs no recovery.  SIGTERM/SIGINT stop accepting connections
//! and wait for in-flight requests up to `server.shutdown_timeout`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use tfstate_backend::config::{Config, LoggingConfig};
use tfstate_backend::AppState;

/// Command-line arguments for the state server.
#[derive(Parser, Debug)]
#[command(
    name = "tfstate-backend",
    version,
    about = "Terraform http remote state backend"
)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => tfstate_backend::config::load_config(path)?,
        None => Config::default(),
    };

    init_tracing(&config.logging);
    match &cli.config {
        Some(path) => info!("Loaded configuration from {}", path),
        None => info!("No configuration file given, using defaults"),
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    let admin_addr = config
        .observability
        .admin_listener_enabled()
        .then(|| config.observability.listen.clone());
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);

    if config.observability.metrics {
        tfstate_backend::metrics::init_metrics()?;
        tfstate_backend::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    info!(
        "Collaborators: store={} auth={} authorization={}",
        config.store.backend, config.auth.provider, config.authorization.provider
    );
    if !config.state.compress {
        warn!("State compression is disabled; existing compressed objects will not decode");
    }

    let state = Arc::new(AppState::from_config(config)?);

    match admin_addr {
        Some(admin_addr) => {
            let admin_listener = tokio::net::TcpListener::bind(&admin_addr).await?;
            info!("Admin endpoints listening on {}", admin_addr);
            tokio::spawn(async move {
                if let Err(e) = axum::serve(admin_listener, tfstate_backend::server::admin_app()).await {
                    warn!("admin listener failed: {}", e);
                }
            });
        }
        None => info!("Admin listener disabled"),
    }

    let app = tfstate_backend::server::app(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("tfstate-backend listening on {}", bind_addr);

    let (stopping_tx, mut stopping_rx) = tokio::sync::watch::channel(false);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = stopping_tx.send(true);
    });
    let deadline = async move {
        if stopping_rx.changed().await.is_ok() {
            tokio::time::sleep(shutdown_timeout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server => result?,
        _ = deadline => warn!("Shutdown timeout elapsed with requests still in flight"),
    }

    info!("tfstate-backend shut down");

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
