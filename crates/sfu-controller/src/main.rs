//! SFU Controller
//!
//! Control plane for a selective-forwarding media server.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3016)
//! - HTTP server for health, stats and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Create the worker pool and start supervision
//! 4. Start health HTTP server (liveness, readiness, stats, metrics)
//! 5. Start signaling server
//! 6. Wait for a shutdown signal or a fatal worker death

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sfu_controller::config::Config;
use sfu_controller::controller::SfuController;
use sfu_controller::engine::loopback::LoopbackEngine;
use sfu_controller::observability::metrics::init_metrics_recorder;
use sfu_controller::observability::{health_router, stats_router, HealthState};
use sfu_controller::store::InMemorySessionStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to servers to drain before workers are closed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_controller=debug,sfu=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU Controller");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    info!(config = ?config, "Configuration loaded successfully");

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    // The media engine binding is pluggable; the in-process engine keeps a
    // standalone controller runnable end to end.
    let engine = Arc::new(LoopbackEngine::new());
    let store = Arc::new(InMemorySessionStore::with_open_rooms());

    info!(workers = config.num_workers, "Creating worker pool...");
    let controller = SfuController::start(&config, engine, store, shutdown_token.child_token())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create worker pool");
            e
        })?;
    let fatal_token = controller.fatal_token();

    // Health server: bind before spawning to fail fast on bind errors
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state))
        .merge(stats_router(controller.stats_sources()))
        .merge(metrics_router);

    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_app = controller
        .signaling_router()
        .layer(tower_http::trace::TraceLayer::new_for_http());
    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("SFU Controller running - press Ctrl+C to shutdown");

    let fatal = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            false
        }
        () = fatal_token.cancelled() => {
            error!("Media worker died, shutting down");
            true
        }
    };

    // Mark as not ready immediately so traffic stops
    health_state.set_not_ready();
    shutdown_token.cancel();

    tokio::time::sleep(DRAIN_TIMEOUT).await;
    controller.shutdown().await;

    if fatal {
        warn!("SFU Controller exited after fatal worker death");
        return Err("media worker died".into());
    }
    info!("SFU Controller shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
