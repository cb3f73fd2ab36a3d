use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::WorkerState;

/// Starts the worker's health/readiness/status HTTP server.
pub async fn serve(addr: &str, state: Arc<WorkerState>, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("listening on {addr}"))?;
    let local_addr = listener.local_addr().context("getting local address")?;

    tokio::spawn(async move {
        tracing::info!(addr = %local_addr, "worker HTTP server started");

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "worker HTTP server error");
        }
    });

    Ok(())
}

/// GET /health - 200 once an assignment is active with loaded
/// synthesizers and no endpoint pool stuck reconnecting.
async fn health_handler(State(state): State<Arc<WorkerState>>) -> impl IntoResponse {
    if !state.has_assignment() || state.synthesizer_count() == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "no assignment or synthesizers",
        );
    }
    if state.pools_stuck() {
        return (StatusCode::SERVICE_UNAVAILABLE, "connections reconnecting");
    }
    (StatusCode::OK, "OK")
}

/// GET /ready - 200 after startup.
async fn ready_handler() -> &'static str {
    "READY"
}

/// GET /status - worker state summary as JSON.
async fn status_handler(State(state): State<Arc<WorkerState>>) -> impl IntoResponse {
    let assignment = state.assignment();

    let mut status = serde_json::json!({
        "worker_id": state.worker_id,
        "has_assignment": assignment.is_some(),
        "synthesizers": state.synthesizer_count(),
        "buffer_size": state.buffer_len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    if let Some(assignment) = assignment {
        status["assignment"] = serde_json::json!(assignment);
    }

    Json(status)
}
