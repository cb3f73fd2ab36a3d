use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for the worker's emission path.
///
/// All metrics use the "replayoor" namespace. The registry is per-instance
/// so tests can run multiple workers in one process.
pub struct WorkerMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Lines synthesized and accepted into the batch buffer, per family.
    pub lines_emitted: CounterVec,
    /// Exact bytes (line + newline) accepted into the buffer, per family.
    pub bytes_emitted: CounterVec,
    /// Lines dropped because the buffer refused them twice, per family.
    pub lines_dropped: CounterVec,
    /// Control-plane and emission errors, per endpoint label.
    pub http_errors: CounterVec,
    /// Batches successfully flushed downstream.
    pub batches_flushed: Counter,
    /// Batches dropped after exhausting write attempts.
    pub batches_dropped: Counter,
    /// Lines currently sitting in the batch buffer.
    pub buffer_lines: Gauge,
    /// Recipe fetch/validation failures, per family.
    pub recipe_load_errors: CounterVec,
    /// Assignment polls by outcome (success/none/error).
    pub assignment_polls: CounterVec,
    /// Whether each endpoint connection is usable (1) or rebuilding (0).
    pub connection_healthy: GaugeVec,
    /// Connection build attempts that failed, per endpoint.
    pub reconnect_attempts: CounterVec,
    /// Exact bytes written through each endpoint's socket.
    pub endpoint_bytes: CounterVec,
    /// Current governor rate per family.
    pub target_rate: GaugeVec,
    /// Time spent flushing one batch to all endpoints.
    pub flush_duration: Histogram,
    /// Lines per flushed batch.
    pub batch_lines: Histogram,
}

impl WorkerMetrics {
    /// Creates the worker metrics with all collectors registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let lines_emitted = CounterVec::new(
            Opts::new("lines_emitted_total", "Total lines emitted per family.")
                .namespace("replayoor"),
            &["family_id"],
        )?;
        let bytes_emitted = CounterVec::new(
            Opts::new("bytes_emitted_total", "Total bytes emitted per family.")
                .namespace("replayoor"),
            &["family_id"],
        )?;
        let lines_dropped = CounterVec::new(
            Opts::new(
                "lines_dropped_total",
                "Lines dropped after the batch buffer refused them twice.",
            )
            .namespace("replayoor"),
            &["family_id"],
        )?;
        let http_errors = CounterVec::new(
            Opts::new(
                "http_errors_total",
                "Control-plane and emission errors by endpoint.",
            )
            .namespace("replayoor"),
            &["endpoint"],
        )?;
        let batches_flushed = Counter::with_opts(
            Opts::new("batches_flushed_total", "Batches flushed downstream.")
                .namespace("replayoor"),
        )?;
        let batches_dropped = Counter::with_opts(
            Opts::new(
                "batches_dropped_total",
                "Batches dropped after exhausting write attempts.",
            )
            .namespace("replayoor"),
        )?;
        let buffer_lines = Gauge::with_opts(
            Opts::new("buffer_lines", "Lines currently buffered for emission.")
                .namespace("replayoor"),
        )?;
        let recipe_load_errors = CounterVec::new(
            Opts::new(
                "recipe_load_errors_total",
                "Recipe fetch or validation failures by family.",
            )
            .namespace("replayoor"),
            &["family_id"],
        )?;
        let assignment_polls = CounterVec::new(
            Opts::new(
                "assignment_polls_total",
                "Assignment polls by outcome (success/none/error).",
            )
            .namespace("replayoor"),
            &["status"],
        )?;
        let connection_healthy = GaugeVec::new(
            Opts::new(
                "connection_healthy",
                "Whether the endpoint connection is usable (1=yes, 0=rebuilding).",
            )
            .namespace("replayoor"),
            &["endpoint"],
        )?;
        let reconnect_attempts = CounterVec::new(
            Opts::new(
                "reconnect_attempts_total",
                "Failed connection build attempts by endpoint.",
            )
            .namespace("replayoor"),
            &["endpoint"],
        )?;
        let endpoint_bytes = CounterVec::new(
            Opts::new(
                "endpoint_bytes_total",
                "Exact bytes written through each endpoint socket.",
            )
            .namespace("replayoor"),
            &["endpoint"],
        )?;
        let target_rate = GaugeVec::new(
            Opts::new("target_rate", "Current governor rate per family (lines/sec).")
                .namespace("replayoor"),
            &["family_id"],
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to flush one batch to all endpoints.",
            )
            .namespace("replayoor")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let batch_lines = Histogram::with_opts(
            HistogramOpts::new("batch_lines", "Lines per flushed batch.")
                .namespace("replayoor")
                .buckets(vec![10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;

        registry.register(Box::new(lines_emitted.clone()))?;
        registry.register(Box::new(bytes_emitted.clone()))?;
        registry.register(Box::new(lines_dropped.clone()))?;
        registry.register(Box::new(http_errors.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(batches_dropped.clone()))?;
        registry.register(Box::new(buffer_lines.clone()))?;
        registry.register(Box::new(recipe_load_errors.clone()))?;
        registry.register(Box::new(assignment_polls.clone()))?;
        registry.register(Box::new(connection_healthy.clone()))?;
        registry.register(Box::new(reconnect_attempts.clone()))?;
        registry.register(Box::new(endpoint_bytes.clone()))?;
        registry.register(Box::new(target_rate.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(batch_lines.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            lines_emitted,
            bytes_emitted,
            lines_dropped,
            http_errors,
            batches_flushed,
            batches_dropped,
            buffer_lines,
            recipe_load_errors,
            assignment_polls,
            connection_healthy,
            reconnect_attempts,
            endpoint_bytes,
            target_rate,
            flush_duration,
            batch_lines,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let registry = self.registry.clone();
        let state = Arc::new(MetricsState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "worker metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "worker metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

/// Prometheus gauges for the divergence monitor.
///
/// The monitor's HTTP router serves this registry on its own port, so no
/// server lives here.
pub struct MonitorMetrics {
    registry: Registry,

    /// JS divergence per family and distribution (source, tag_<k>, tags_average).
    pub divergence_js: GaugeVec,
    /// Quantile-matched Wasserstein distance on values, per family.
    pub divergence_wasserstein: GaugeVec,
    /// Quantile-matched KS statistic on line sizes, per family.
    pub divergence_ks: GaugeVec,
    /// Pearson correlation between windowed per-minute counts and the
    /// recipe intensity curve.
    pub temporal_correlation: GaugeVec,
    /// Family status: 0=green, 1=amber, 2=red.
    pub family_status: GaugeVec,
    /// Active alerts by severity and type.
    pub alerts_active: GaugeVec,
    /// Samples tee'd into each family's sliding window.
    pub samples_ingested: CounterVec,
    /// Compute ticks skipped (insufficient samples or NaN scores).
    pub compute_skips: CounterVec,
}

impl MonitorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let divergence_js = GaugeVec::new(
            Opts::new(
                "divergence_jensen_shannon",
                "Jensen-Shannon divergence for categorical distributions.",
            )
            .namespace("replayoor"),
            &["family_id", "distribution_type"],
        )?;
        let divergence_wasserstein = GaugeVec::new(
            Opts::new(
                "divergence_wasserstein",
                "Wasserstein distance for value distributions.",
            )
            .namespace("replayoor"),
            &["family_id"],
        )?;
        let divergence_ks = GaugeVec::new(
            Opts::new(
                "divergence_kolmogorov_smirnov",
                "Kolmogorov-Smirnov statistic for size distributions.",
            )
            .namespace("replayoor"),
            &["family_id"],
        )?;
        let temporal_correlation = GaugeVec::new(
            Opts::new(
                "temporal_correlation",
                "Pearson correlation between emission counts and the intensity curve.",
            )
            .namespace("replayoor"),
            &["family_id"],
        )?;
        let family_status = GaugeVec::new(
            Opts::new("family_status", "Family status: 0=green, 1=amber, 2=red.")
                .namespace("replayoor"),
            &["family_id", "metric_name"],
        )?;
        let alerts_active = GaugeVec::new(
            Opts::new("alerts_active", "Active alerts by severity and type.")
                .namespace("replayoor"),
            &["severity", "type"],
        )?;
        let samples_ingested = CounterVec::new(
            Opts::new("samples_ingested_total", "Samples ingested per family.")
                .namespace("replayoor"),
            &["family_id"],
        )?;
        let compute_skips = CounterVec::new(
            Opts::new(
                "compute_skips_total",
                "Divergence compute ticks skipped per family.",
            )
            .namespace("replayoor"),
            &["family_id"],
        )?;

        registry.register(Box::new(divergence_js.clone()))?;
        registry.register(Box::new(divergence_wasserstein.clone()))?;
        registry.register(Box::new(divergence_ks.clone()))?;
        registry.register(Box::new(temporal_correlation.clone()))?;
        registry.register(Box::new(family_status.clone()))?;
        registry.register(Box::new(alerts_active.clone()))?;
        registry.register(Box::new(samples_ingested.clone()))?;
        registry.register(Box::new(compute_skips.clone()))?;

        Ok(Self {
            registry,
            divergence_js,
            divergence_wasserstein,
            divergence_ks,
            temporal_correlation,
            family_status,
            alerts_active,
            samples_ingested,
            compute_skips,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Shared state for the metrics handlers.
struct MetricsState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    match super::render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple liveness check.
async fn healthz_handler() -> &'static str {
    "ok"
}
