//! Arena Server - lobby and authoritative match session backend
//!
//! One binary, two roles selected by `SERVER_ROLE`:
//! - `lobby`: accounts, rooms and match launch over the `/lobby` WebSocket
//! - `match`: lockstep match sessions at `/match?roomId=` plus the signed
//!   lobby -> match RPC endpoint

mod app;
mod config;
mod error;
mod game;
mod http;
mod lobby;
mod store;
mod transport;
mod util;
mod ws;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::{Config, ServerRole};
use crate::http::build_router;
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level, config.log_json);

    // Initialize server time tracking
    init_server_time();

    info!(role = config.role.as_str(), "Starting Arena Server");
    info!("Server address: {}", config.server_addr);
    info!("Data root: {}", config.data_root.display());

    // Open stores and start the coordinator threads
    let state = AppState::new(config.clone())?;

    // Build router
    let router = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    match config.role {
        ServerRole::Lobby => info!("WebSocket endpoint: ws://{}/lobby", addr),
        ServerRole::Match => info!("WebSocket endpoint: ws://{}/match?roomId=<id>", addr),
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Joins the transport threads
    tokio::task::spawn_blocking(move || state.shutdown()).await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Structured logs go to stdout; `RUST_LOG` overrides `LOG_LEVEL`
fn init_tracing(log_level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_thread_names(true))
            .init();
    }
}

/// Resolves on Ctrl+C or SIGTERM. A handler that fails to install never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, draining connections"),
        _ = terminate => info!("SIGTERM received, draining connections"),
    }
}
