pub mod buffer;
pub mod conn;
pub mod emit;
pub mod http;
pub mod rate;

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use prometheus::{Counter, Gauge};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::{Assignment, ControlPlaneClient};
use crate::export::health::{MonitorMetrics, WorkerMetrics};
use crate::monitor::DivergenceMonitor;
use crate::synth::FamilySynthesizer;

use buffer::BatchBuffer;
use conn::ConnectionManager;
use emit::Emitter;
use rate::RateGovernor;

/// Per-assignment knobs that reach running family tasks without
/// restarting them.
#[derive(Debug, Clone)]
pub struct EmitParams {
    pub multiplier: f64,
    pub burst_factor: f64,
    pub schema_drift: f64,
    pub error_injection: f64,
}

impl Default for EmitParams {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            burst_factor: 1.0,
            schema_drift: 0.0,
            error_injection: 0.0,
        }
    }
}

/// State shared between the worker core and its HTTP handlers.
pub struct WorkerState {
    pub worker_id: String,
    assignment: parking_lot::RwLock<Option<Assignment>>,
    synthesizers: AtomicUsize,
    buffer: Arc<BatchBuffer>,
    pools: parking_lot::RwLock<Vec<Arc<ConnectionManager>>>,
    reconnect_deadline: Duration,
}

impl WorkerState {
    fn new(worker_id: String, buffer: Arc<BatchBuffer>, reconnect_deadline: Duration) -> Self {
        Self {
            worker_id,
            assignment: parking_lot::RwLock::new(None),
            synthesizers: AtomicUsize::new(0),
            buffer,
            pools: parking_lot::RwLock::new(Vec::new()),
            reconnect_deadline,
        }
    }

    pub fn assignment(&self) -> Option<Assignment> {
        self.assignment.read().clone()
    }

    pub fn has_assignment(&self) -> bool {
        self.assignment.read().is_some()
    }

    pub fn synthesizer_count(&self) -> usize {
        self.synthesizers.load(Ordering::Relaxed)
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// True when any endpoint pool has been rebuilding for longer than
    /// the readiness deadline.
    pub fn pools_stuck(&self) -> bool {
        self.pools
            .read()
            .iter()
            .any(|pool| match pool.reconnecting_for() {
                Some(for_duration) => for_duration > self.reconnect_deadline,
                None => false,
            })
    }
}

struct FamilyHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct EmitterHandle {
    cancel: CancellationToken,
    endpoints: Vec<String>,
    handle: JoinHandle<()>,
}

/// Worker core: polls assignments, materializes one synthesizer task per
/// family, and drives emission through the shared batch buffer.
pub struct Worker {
    core: Arc<WorkerCore>,
}

struct WorkerCore {
    cfg: Config,
    metrics: Arc<WorkerMetrics>,
    state: Arc<WorkerState>,
    buffer: Arc<BatchBuffer>,
    control: ControlPlaneClient,
    monitor: Option<Arc<DivergenceMonitor>>,
    families: parking_lot::Mutex<HashMap<String, FamilyHandle>>,
    params: watch::Sender<EmitParams>,
    emitter: parking_lot::Mutex<Option<EmitterHandle>>,
    cancel: CancellationToken,
}

impl Worker {
    /// Creates a worker, wiring metrics into the control-plane client and
    /// the optional in-process divergence monitor.
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics = Arc::new(
            WorkerMetrics::new(&format!("0.0.0.0:{}", cfg.metrics_port))
                .context("creating worker metrics")?,
        );

        let buffer = Arc::new(BatchBuffer::new(cfg.batch_size, cfg.batch_bytes));
        let state = Arc::new(WorkerState::new(
            cfg.worker_id.clone(),
            Arc::clone(&buffer),
            cfg.reconnect_deadline,
        ));

        let error_counter = metrics.http_errors.clone();
        let control = ControlPlaneClient::new(&cfg.control_plane_url, Duration::from_secs(10))
            .context("creating control plane client")?
            .with_metrics(Box::new(move |endpoint, status| {
                if status == "error" {
                    error_counter.with_label_values(&[endpoint]).inc();
                }
            }));

        let monitor = if cfg.monitor.enabled {
            let monitor_metrics =
                Arc::new(MonitorMetrics::new().context("creating monitor metrics")?);
            Some(Arc::new(DivergenceMonitor::new(
                &cfg.monitor,
                monitor_metrics,
            )))
        } else {
            None
        };

        let (params, _) = watch::channel(EmitParams::default());

        Ok(Self {
            core: Arc::new(WorkerCore {
                metrics,
                state,
                buffer,
                control,
                monitor,
                families: parking_lot::Mutex::new(HashMap::new()),
                params,
                emitter: parking_lot::Mutex::new(None),
                cancel: CancellationToken::new(),
                cfg,
            }),
        })
    }

    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.core.state)
    }

    /// Start all components and begin polling for work.
    pub async fn start(&self) -> Result<()> {
        let core = &self.core;

        // 1. Metrics server, so probes respond before the first assignment.
        core.metrics
            .start()
            .await
            .context("starting metrics server")?;

        // 2. Health/status endpoints.
        http::serve(
            &format!("0.0.0.0:{}", core.cfg.port),
            Arc::clone(&core.state),
            core.cancel.child_token(),
        )
        .await
        .context("starting worker HTTP server")?;

        // 3. In-process divergence monitor.
        if let Some(monitor) = &core.monitor {
            if !core.cfg.monitor.reference_path.is_empty() {
                match monitor.load_references(std::path::Path::new(&core.cfg.monitor.reference_path))
                {
                    Ok(count) => info!(count, "loaded reference recipes"),
                    Err(e) => warn!(error = %e, "loading reference recipes failed"),
                }
            }

            monitor.run(core.cancel.child_token());
            crate::monitor::http::serve(
                &format!("0.0.0.0:{}", core.cfg.monitor.port),
                Arc::clone(monitor),
                core.cancel.child_token(),
            )
            .await
            .context("starting monitor HTTP server")?;
        }

        // 4. Log the catalog size; purely informational.
        {
            let core = Arc::clone(core);
            tokio::spawn(async move {
                match core.control.list_recipes().await {
                    Ok(recipes) => info!(count = recipes.len(), "recipe catalog reachable"),
                    Err(e) => debug!(error = %e, "recipe catalog listing failed"),
                }
            });
        }

        // 5. Assignment poller; the first tick fires immediately.
        spawn_poller(Arc::clone(core));

        info!(worker_id = %core.state.worker_id, "worker started");

        Ok(())
    }

    /// Gracefully stop: cancel every loop, let the emitter run its final
    /// flush, and drain tasks within the grace period.
    pub async fn stop(&self) -> Result<()> {
        let core = &self.core;
        core.cancel.cancel();

        let deadline = Instant::now() + Duration::from_secs(30);

        let family_handles: Vec<FamilyHandle> = {
            let mut families = core.families.lock();
            families.drain().map(|(_, handle)| handle).collect()
        };
        for family in family_handles {
            join_until(family.handle, deadline, "family task").await;
        }

        let emitter = core.emitter.lock().take();
        if let Some(emitter) = emitter {
            join_until(emitter.handle, deadline, "emitter").await;
        }

        core.metrics.stop().await?;

        info!("worker stopped");
        Ok(())
    }
}

async fn join_until(handle: JoinHandle<()>, deadline: Instant, what: &str) {
    if tokio::time::timeout_at(deadline, handle).await.is_err() {
        warn!(what, "task did not drain within the grace period");
    }
}

/// Spawns the assignment poll loop.
fn spawn_poller(core: Arc<WorkerCore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(core.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = core.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match core.control.fetch_assignment(&core.state.worker_id).await {
                        Ok(Some(assignment)) => {
                            core.metrics
                                .assignment_polls
                                .with_label_values(&["success"])
                                .inc();
                            apply_assignment(&core, assignment).await;
                        }
                        Ok(None) => {
                            core.metrics
                                .assignment_polls
                                .with_label_values(&["none"])
                                .inc();
                            debug!("no assignment yet");
                        }
                        Err(e) => {
                            // Keep emitting under the previous assignment.
                            core.metrics
                                .assignment_polls
                                .with_label_values(&["error"])
                                .inc();
                            warn!(error = %e, "assignment poll failed");
                        }
                    }
                }
            }
        }
    });
}

/// Applies a freshly polled assignment: reconfigures endpoints, updates
/// emission parameters, and reconciles the family task set. Unchanged
/// families keep their synthesizer (and so their RNG and delta state).
async fn apply_assignment(core: &Arc<WorkerCore>, assignment: Assignment) {
    let unchanged = {
        let current = core.state.assignment.read();
        current
            .as_ref()
            .is_some_and(|c| c.same_work(&assignment) && c.endpoints == assignment.endpoints)
    };
    if unchanged {
        return;
    }

    info!(
        families = assignment.families.len(),
        multiplier = assignment.multiplier,
        burst_factor = assignment.burst_factor,
        "applying assignment",
    );

    core.control.set_auth_token(assignment.auth_token.clone());

    ensure_emitter(core, &assignment.endpoints).await;

    core.params.send_replace(EmitParams {
        multiplier: assignment.multiplier,
        burst_factor: assignment.burst_factor,
        schema_drift: assignment.schema_drift,
        error_injection: assignment.error_injection,
    });

    let assigned: HashSet<&str> = assignment.families.iter().map(String::as_str).collect();

    // Drop families no longer assigned.
    let removed: Vec<String> = {
        let families = core.families.lock();
        families
            .keys()
            .filter(|id| !assigned.contains(id.as_str()))
            .cloned()
            .collect()
    };
    for family_id in removed {
        if let Some(handle) = core.families.lock().remove(&family_id) {
            handle.cancel.cancel();
            core.state.synthesizers.fetch_sub(1, Ordering::Relaxed);
            info!(family = %family_id, "removed synthesizer");
        }
    }

    // Load recipes and start tasks for newly assigned families. A failed
    // load skips the family; it stays missing and is retried next poll.
    for family_id in &assignment.families {
        if core.families.lock().contains_key(family_id) {
            continue;
        }

        let recipe = match core.control.fetch_recipe(family_id).await {
            Ok(recipe) => Arc::new(recipe),
            Err(e) => {
                core.metrics
                    .recipe_load_errors
                    .with_label_values(&[family_id])
                    .inc();
                warn!(family = %family_id, error = %e, "recipe load failed");
                continue;
            }
        };

        let seed = family_seed(core.cfg.seed, family_id);
        let synthesizer = match FamilySynthesizer::new(Arc::clone(&recipe), seed) {
            Ok(s) => s,
            Err(e) => {
                core.metrics
                    .recipe_load_errors
                    .with_label_values(&[family_id])
                    .inc();
                warn!(family = %family_id, error = %e, "synthesizer construction failed");
                continue;
            }
        };

        if let Some(monitor) = &core.monitor {
            monitor.register_family(&recipe);
        }

        let handle = spawn_family(core, family_id.clone(), synthesizer);
        core.families.lock().insert(family_id.clone(), handle);
        core.state.synthesizers.fetch_add(1, Ordering::Relaxed);
        info!(family = %family_id, metric = %recipe.metric_name, "loaded synthesizer");
    }

    *core.state.assignment.write() = Some(assignment);
}

/// Rebuilds the endpoint pools and emitter when the endpoint set changes.
async fn ensure_emitter(core: &Arc<WorkerCore>, endpoints: &[String]) {
    {
        let current = core.emitter.lock();
        if let Some(handle) = current.as_ref() {
            if handle.endpoints == endpoints {
                return;
            }
        }
    }

    if let Some(old) = core.emitter.lock().take() {
        old.cancel.cancel();
    }

    if endpoints.is_empty() {
        core.state.pools.write().clear();
        return;
    }

    let cancel = core.cancel.child_token();
    let mut pools = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        pools.push(
            ConnectionManager::connect(
                endpoint.clone(),
                core.cfg.connection_buffer_bytes,
                core.cfg.reconnect_initial,
                core.cfg.reconnect_max,
                Some(Arc::clone(&core.metrics)),
                cancel.clone(),
            )
            .await,
        );
    }

    *core.state.pools.write() = pools.clone();

    let emitter = Emitter::new(
        pools,
        Arc::clone(&core.buffer),
        Arc::clone(&core.metrics),
        core.cfg.flush_interval,
        core.cfg.max_write_attempts,
    );
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        emitter.run(run_cancel).await;
    });

    *core.emitter.lock() = Some(EmitterHandle {
        cancel,
        endpoints: endpoints.to_vec(),
        handle,
    });

    info!(endpoints = endpoints.len(), "emitter configured");
}

/// Spawns the ~10 Hz emission loop for one family.
fn spawn_family(
    core: &Arc<WorkerCore>,
    family_id: String,
    mut synthesizer: FamilySynthesizer,
) -> FamilyHandle {
    let cancel = core.cancel.child_token();
    let task_cancel = cancel.clone();
    let params_rx = core.params.subscribe();
    let buffer = Arc::clone(&core.buffer);
    let metrics = Arc::clone(&core.metrics);
    let monitor = core.monitor.clone();

    let base_rate = synthesizer
        .recipe()
        .temporal
        .base_rate
        .unwrap_or(core.cfg.base_rate);
    let governor = RateGovernor::new(
        0.0,
        0.0,
        core.cfg.rate_acceleration,
        core.cfg.rate_refresh,
    );
    let emit_tick = core.cfg.emit_tick;

    let lines_counter = metrics.lines_emitted.with_label_values(&[&family_id]);
    let bytes_counter = metrics.bytes_emitted.with_label_values(&[&family_id]);
    let dropped_counter = metrics.lines_dropped.with_label_values(&[&family_id]);
    let rate_gauge = metrics.target_rate.with_label_values(&[&family_id]);

    let handle = tokio::spawn(async move {
        family_loop(
            family_id,
            &mut synthesizer,
            governor,
            base_rate,
            emit_tick,
            params_rx,
            buffer,
            monitor,
            lines_counter,
            bytes_counter,
            dropped_counter,
            rate_gauge,
            metrics,
            task_cancel,
        )
        .await;
    });

    FamilyHandle { cancel, handle }
}

#[allow(clippy::too_many_arguments)]
async fn family_loop(
    family_id: String,
    synthesizer: &mut FamilySynthesizer,
    governor: RateGovernor,
    base_rate: f64,
    emit_tick: Duration,
    params_rx: watch::Receiver<EmitParams>,
    buffer: Arc<BatchBuffer>,
    monitor: Option<Arc<DivergenceMonitor>>,
    lines_counter: Counter,
    bytes_counter: Counter,
    dropped_counter: Counter,
    rate_gauge: Gauge,
    metrics: Arc<WorkerMetrics>,
    cancel: CancellationToken,
) {
    debug!(family = %family_id, "family task started");

    let mut ticker = tokio::time::interval(emit_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(family = %family_id, "family task stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let params = params_rx.borrow().clone();
        let now = SystemTime::now();

        let target = synthesizer.target_rate(
            now,
            base_rate,
            params.multiplier,
            params.burst_factor,
        );
        governor.set_target(target);
        let rate = governor.current_rate();
        rate_gauge.set(rate);

        let elapsed = last_tick.elapsed().as_secs_f64();
        last_tick = Instant::now();

        let expected = rate * elapsed;
        let mut lines_to_emit = expected.floor() as u64;
        if synthesizer.bernoulli(expected.fract()) {
            lines_to_emit += 1;
        }

        synthesizer.set_policies(params.schema_drift, params.error_injection);

        for _ in 0..lines_to_emit {
            governor.acquire().await;

            let emission = synthesizer.next_record(SystemTime::now(), params.multiplier);
            let size = emission.sample.line_size;

            if let Some(monitor) = &monitor {
                monitor.ingest(&family_id, emission.sample);
            }

            let mut line = emission.text;
            if let Err(refused) = buffer.add(line) {
                // Buffer full: force a flush, then retry exactly once.
                buffer.kick();
                tokio::task::yield_now().await;
                line = refused;
                if buffer.add(line).is_err() {
                    dropped_counter.inc();
                    continue;
                }
            }

            lines_counter.inc();
            bytes_counter.inc_by((size + 1) as f64);
        }

        metrics.buffer_lines.set(buffer.len() as f64);
    }
}

/// Derives a per-family seed; a zero base seed falls back to entropy.
fn family_seed(base: u64, family_id: &str) -> u64 {
    if base == 0 {
        return rand::random();
    }

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    base.hash(&mut hasher);
    family_id.hash(&mut hasher);
    hasher.finish()
}
