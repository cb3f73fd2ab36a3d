use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::DivergenceMonitor;

/// Starts the monitor's HTTP server: status, per-family detail, manual
/// compute trigger, and metrics exposition.
pub async fn serve(
    addr: &str,
    monitor: Arc<DivergenceMonitor>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/families", get(families_handler))
        .route("/compute", post(compute_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(monitor);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("listening on {addr}"))?;
    let local_addr = listener.local_addr().context("getting local address")?;

    tokio::spawn(async move {
        tracing::info!(addr = %local_addr, "monitor HTTP server started");

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "monitor HTTP server error");
        }
    });

    Ok(())
}

/// GET /health - liveness.
async fn health_handler() -> &'static str {
    "OK"
}

/// GET /status - monitor summary.
async fn status_handler(State(monitor): State<Arc<DivergenceMonitor>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "families": monitor.family_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /families - per-family status array.
async fn families_handler(State(monitor): State<Arc<DivergenceMonitor>>) -> impl IntoResponse {
    Json(monitor.family_summaries())
}

/// POST /compute - trigger an out-of-band divergence pass.
async fn compute_handler(State(monitor): State<Arc<DivergenceMonitor>>) -> impl IntoResponse {
    tokio::task::spawn_blocking(move || monitor.compute_all());
    (StatusCode::ACCEPTED, "divergence computation triggered")
}

/// GET /metrics - Prometheus text format from the monitor registry.
async fn metrics_handler(State(monitor): State<Arc<DivergenceMonitor>>) -> impl IntoResponse {
    match crate::export::render_registry(monitor.metrics().registry()) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding monitor metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}
