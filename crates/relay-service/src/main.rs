//! Broadcast Relay
//!
//! Signaling relay for one-to-many broadcasts.
//!
//! # Servers
//!
//! - WebSocket signaling server (`GET /signaling`, default: 0.0.0.0:3000)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing
//! 3. Initialize Prometheus metrics recorder
//! 4. Spawn the relay actor
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start signaling server, mark ready
//! 7. Wait for shutdown signal, then drain

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::config::ObservabilityConfig;
use relay_service::actors::{ActorMetrics, ActorType, RelayActor, RelaySettings};
use relay_service::config::Config;
use relay_service::observability::{health_router, init_metrics_recorder, HealthState};
use relay_service::transport::signaling_router;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for the relay actor and servers to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration decides the log format, so it is read before tracing
    // is up; a failure is logged once tracing is initialized.
    let config = Config::from_env();
    let observability = config
        .as_ref()
        .map(|c| c.observability.clone())
        .unwrap_or_else(|_| ObservabilityConfig::default());

    // Initialize tracing
    let json_logs = observability.json_logs;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| observability.log_level.clone().into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting Broadcast Relay");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        relay_id = %config.relay_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        duplicate_start = %config.duplicate_start,
        max_broadcasts = config.max_broadcasts,
        max_viewers_per_broadcast = config.max_viewers_per_broadcast,
        negotiation_timeout_seconds = config.negotiation_timeout_seconds,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    // Initialize health state
    let health_state = Arc::new(HealthState::new());

    // Initialize actor system. This binary only relays signaling; media is
    // peer-to-peer between the browsers.
    info!("Initializing relay actor...");
    let actor_metrics = ActorMetrics::new();
    let (relay, relay_task) = RelayActor::spawn(
        config.relay_id.clone(),
        RelaySettings::from(&config),
        None,
        Arc::clone(&actor_metrics),
    );
    info!("Relay actor initialized");

    // Servers run on children of the relay's token, so relay shutdown stops them
    let shutdown_token = relay.child_token();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    // Add /metrics endpoint served by Prometheus exporter
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

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

    // Start signaling server
    let signaling_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    info!(addr = %signaling_addr, "Signaling server bound successfully");

    let signaling_app = signaling_router(relay.clone());
    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_task = tokio::spawn(async move {
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
    info!("Broadcast Relay running - press Ctrl+C to shutdown");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        () = shutdown_token.cancelled() => {
            warn!("Relay actor stopped unexpectedly, shutting down");
        }
    }

    // Readiness drops immediately so load balancers stop sending traffic
    health_state.set_draining();

    // Ends every broadcast, then cancels the root token (stops the servers)
    if let Err(e) = relay.shutdown().await {
        warn!(error = %e, "Relay shutdown request failed");
        relay.cancel();
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, relay_task).await {
        Ok(Ok(())) => info!("Relay actor stopped"),
        Ok(Err(e)) if e.is_panic() => {
            actor_metrics.record_panic(ActorType::Relay);
            error!(error = %e, "Relay actor panicked");
        }
        Ok(Err(e)) => warn!(error = %e, "Relay actor task failed"),
        Err(_) => warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Relay actor did not stop in time"
        ),
    }

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, signaling_task)
        .await
        .is_err()
    {
        warn!("Signaling server did not stop in time");
    }

    info!("Broadcast Relay shutdown complete");
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
