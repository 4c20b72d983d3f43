//! Arena Match Server - authoritative multiplayer arena match core
//!
//! This is the main entry point for the server. It handles:
//! - WebSocket connections, one per participant, carrying the replication stream
//! - The round state machine and the fixed-rate simulation loop
//! - HTTP endpoints for health and match status

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arena_match_server::app::AppState;
use arena_match_server::config::Config;
use arena_match_server::game::run_simulation;
use arena_match_server::http::build_router;
use arena_match_server::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Arena Match Server");
    info!("Server address: {}", config.server_addr);
    info!(
        rounds_to_win = config.game.rounds_to_win,
        spawn_slots = config.game.spawn_slots.len(),
        min_participants = config.game.min_participants,
        "Game configuration loaded"
    );

    // Create application state
    let state = AppState::new(config.clone())?;

    // Background loops stop when this flips to true
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = tokio::spawn(state.orchestrator.clone().run(shutdown_rx.clone()));
    let simulation = tokio::spawn(run_simulation(state.arena.clone(), shutdown_rx));

    // Build router
    let router = build_router(state);

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for (name, task) in [("orchestrator", orchestrator), ("simulation", simulation)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task failed");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
