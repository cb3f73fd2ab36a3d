use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::WorkerMetrics;

/// A long-lived byte-stream connection with a monotonic id.
///
/// The id is how the manager tells whether a connection is stale: any
/// connection with `id < first_good_id` must be replaced.
pub struct Conn {
    id: u64,
    writer: BufWriter<TcpStream>,
}

impl Conn {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Writes one newline-terminated line into the buffered writer.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await
    }

    /// Pushes any buffered bytes through the socket.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }
}

pub type SharedConn = Arc<tokio::sync::Mutex<Conn>>;

struct PoolState {
    current: Option<SharedConn>,
    /// Id of the handed-out connection; 0 before the first build succeeds.
    current_id: u64,
    /// Connections with a smaller id are stale and scheduled for
    /// replacement. The watermark only ever advances.
    first_good_id: u64,
    reconnecting_since: Option<Instant>,
}

/// Manages the single handed-out connection for one endpoint.
///
/// Writers never block on `get()`: they receive the current connection,
/// possibly stale, and detect staleness by the next write failing. A
/// failed writer calls `invalidate`, which advances the watermark and
/// wakes the reconciler; concurrent invalidations of the same connection
/// collapse into one rebuild because the watermark comparison is the sole
/// source of truth.
pub struct ConnectionManager {
    endpoint: String,
    buffer_bytes: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    state: parking_lot::Mutex<PoolState>,
    rebuild: Notify,
    health: Option<Arc<WorkerMetrics>>,
}

impl ConnectionManager {
    /// Builds the first connection synchronously with id 1 and starts the
    /// background reconciler. If the endpoint is dead at startup the
    /// manager begins in the reconnecting state and the reconciler takes
    /// over with backoff.
    pub async fn connect(
        endpoint: String,
        buffer_bytes: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        health: Option<Arc<WorkerMetrics>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let first = match build_conn(&endpoint, buffer_bytes, 1).await {
            Ok(conn) => Some(Arc::new(tokio::sync::Mutex::new(conn))),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "initial connection failed");
                if let Some(h) = &health {
                    h.http_errors.with_label_values(&[&endpoint]).inc();
                    h.reconnect_attempts.with_label_values(&[&endpoint]).inc();
                }
                None
            }
        };

        let connected = first.is_some();
        let manager = Arc::new(Self {
            buffer_bytes,
            initial_backoff,
            max_backoff,
            state: parking_lot::Mutex::new(PoolState {
                current_id: if connected { 1 } else { 0 },
                first_good_id: 1,
                current: first,
                reconnecting_since: if connected { None } else { Some(Instant::now()) },
            }),
            rebuild: Notify::new(),
            health,
            endpoint,
        });

        manager.set_healthy_gauge(connected);

        let reconciler = Arc::clone(&manager);
        tokio::spawn(async move {
            reconciler.reconcile(cancel).await;
        });

        manager
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the currently handed-out connection, possibly stale, or
    /// `None` before the first successful build. Never blocks.
    pub fn get(&self) -> Option<SharedConn> {
        self.state.lock().current.clone()
    }

    /// Marks a connection as bad. Idempotent: invalidating an
    /// already-stale id is a no-op.
    pub fn invalidate(&self, conn_id: u64) {
        {
            let mut state = self.state.lock();
            if conn_id < state.first_good_id {
                return;
            }
            state.first_good_id = conn_id + 1;
            if state.reconnecting_since.is_none() {
                state.reconnecting_since = Some(Instant::now());
            }
        }

        self.set_healthy_gauge(false);
        self.rebuild.notify_one();
    }

    /// True when the handed-out connection is at or above the watermark.
    pub fn is_healthy(&self) -> bool {
        let state = self.state.lock();
        state.current.is_some() && state.current_id >= state.first_good_id
    }

    /// How long the pool has been rebuilding, if it currently is.
    pub fn reconnecting_for(&self) -> Option<Duration> {
        self.state
            .lock()
            .reconnecting_since
            .map(|since| Instant::now().duration_since(since))
    }

    /// Background loop: waits until the handed-out connection is stale,
    /// then rebuilds at the watermark id with exponential backoff.
    async fn reconcile(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            loop {
                {
                    let state = self.state.lock();
                    if state.first_good_id > state.current_id {
                        break;
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = self.rebuild.notified() => {}
                }
            }

            let target_id = self.state.lock().first_good_id;
            let Some(conn) = self.build_with_backoff(target_id, &cancel).await else {
                return; // cancelled
            };

            {
                let mut state = self.state.lock();
                state.current = Some(Arc::new(tokio::sync::Mutex::new(conn)));
                state.current_id = target_id;
                if state.current_id >= state.first_good_id {
                    state.reconnecting_since = None;
                    drop(state);
                    self.set_healthy_gauge(true);
                }
            }

            info!(endpoint = %self.endpoint, id = target_id, "connection rebuilt");
        }
    }

    async fn build_with_backoff(&self, id: u64, cancel: &CancellationToken) -> Option<Conn> {
        let mut delay = self.initial_backoff;

        loop {
            match build_conn(&self.endpoint, self.buffer_bytes, id).await {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    if let Some(h) = &self.health {
                        h.http_errors.with_label_values(&[&self.endpoint]).inc();
                        h.reconnect_attempts
                            .with_label_values(&[&self.endpoint])
                            .inc();
                    }
                    debug!(endpoint = %self.endpoint, error = %e, "connection build failed");
                }
            }

            let jitter = rand::thread_rng().gen_range(Duration::ZERO..self.initial_backoff.max(Duration::from_millis(1)));
            let wait = delay + jitter;
            info!(endpoint = %self.endpoint, ?wait, "reconnect failed, backing off");

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(wait) => {}
            }

            delay = (delay * 2).min(self.max_backoff);
        }
    }

    fn set_healthy_gauge(&self, healthy: bool) {
        if let Some(h) = &self.health {
            h.connection_healthy
                .with_label_values(&[&self.endpoint])
                .set(if healthy { 1.0 } else { 0.0 });
        }
    }
}

async fn build_conn(endpoint: &str, buffer_bytes: usize, id: u64) -> Result<Conn> {
    let stream = TcpStream::connect(endpoint)
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;

    Ok(Conn {
        id,
        writer: BufWriter::with_capacity(buffer_bytes, stream),
    })
}
