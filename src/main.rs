//! Order-flow recorder
//!
//! Connects to the exchange's full-detail feed, reconciles level-3 snapshots
//! into storage, and persists trades and order-state intervals in batches.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderflow_recorder::{AppState, Config, Metrics, Persister, RecorderManager, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting order-flow recorder");

    // Load configuration
    let config = Arc::new(Config::load()?);
    info!(
        products = ?config.products,
        batch_size = config.batch_size,
        db_max_connections = config.db_max_connections,
        "Configuration loaded"
    );

    let store = Store::connect(&config.database_url, config.db_max_connections).await?;
    let metrics = Arc::new(Metrics::new()?);

    let state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        metrics: metrics.clone(),
    });

    // Storage-bound stage
    let (persister, persister_task) =
        Persister::new(store.clone(), config.flush_max_retries, metrics.clone())
            .spawn(config.channel_capacity);

    // Start health check server
    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested, draining pipeline");
        let _ = shutdown_tx.send(true);
    });

    // I/O-bound stage; returns once stopped, dropping its persister handle
    let manager = RecorderManager::new(state, persister, shutdown_rx)?;
    let run_result = manager.run().await;

    let persist_result = persister_task.await?;
    store.close().await;

    if let Err(e) = &persist_result {
        error!(error = %e, "Persister failed");
    }
    run_result?;
    persist_result?;

    info!("Recorder stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let storage_ok = state.store.ping().await.is_ok();
    let (status, label) = if storage_ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(serde_json::json!({
            "status": label,
            "component": "orderflow-recorder",
            "products": state.config.products,
            "batches_flushed": state.metrics.batches_flushed.get(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, StatusCode> {
    state
        .metrics
        .encode()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
