use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::export::health::WorkerMetrics;

use super::buffer::BatchBuffer;
use super::conn::ConnectionManager;

/// Pause between write attempts so the reconciler has a chance to swap in
/// a fresh connection.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Drains the batch buffer through the per-endpoint connection managers.
///
/// Runs on a flush-interval timer and eagerly when a producer kicks the
/// buffer. A failed write invalidates the connection and retries the same
/// batch up to `max_attempts` times before dropping it with a counter.
pub struct Emitter {
    pools: Vec<Arc<ConnectionManager>>,
    buffer: Arc<BatchBuffer>,
    health: Arc<WorkerMetrics>,
    flush_interval: Duration,
    max_attempts: u32,
}

impl Emitter {
    pub fn new(
        pools: Vec<Arc<ConnectionManager>>,
        buffer: Arc<BatchBuffer>,
        health: Arc<WorkerMetrics>,
        flush_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            pools,
            buffer,
            health,
            flush_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Flush loop. On cancellation one final flush pushes out whatever is
    /// still buffered.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush_once().await;
                    debug!("emitter stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.flush_once().await;
                    self.flush_partials().await;
                }
                _ = self.buffer.kicked() => {
                    self.flush_once().await;
                }
            }
        }
    }

    /// Takes the buffered lines and writes them to every endpoint.
    pub async fn flush_once(&self) {
        let lines = self.buffer.flush();
        self.health.buffer_lines.set(0.0);
        if lines.is_empty() {
            return;
        }

        let start = Instant::now();
        self.health.batch_lines.observe(lines.len() as f64);

        for pool in &self.pools {
            self.write_batch(pool, &lines).await;
        }

        self.health.batches_flushed.inc();
        self.health
            .flush_duration
            .observe(start.elapsed().as_secs_f64());
    }

    /// Writes one batch to one endpoint, invalidating and retrying on
    /// failure. Batches are dropped, not reordered: FIFO per endpoint.
    async fn write_batch(&self, pool: &Arc<ConnectionManager>, lines: &[String]) {
        let deadline = self.flush_interval.max(Duration::from_millis(200));
        let endpoint = pool.endpoint().to_string();

        for attempt in 1..=self.max_attempts {
            let Some(conn) = pool.get() else {
                self.health.http_errors.with_label_values(&[&endpoint]).inc();
                if attempt < self.max_attempts {
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                continue;
            };

            let mut conn = conn.lock().await;
            let conn_id = conn.id();
            let write = async {
                let mut bytes = 0usize;
                for line in lines {
                    conn.write_line(line).await?;
                    bytes += line.len() + 1;
                }
                conn.flush().await?;
                Ok::<usize, std::io::Error>(bytes)
            };

            match tokio::time::timeout(deadline, write).await {
                Ok(Ok(bytes)) => {
                    self.health
                        .endpoint_bytes
                        .with_label_values(&[&endpoint])
                        .inc_by(bytes as f64);
                    return;
                }
                Ok(Err(e)) => {
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        error = %e,
                        "batch write failed",
                    );
                }
                Err(_) => {
                    warn!(endpoint = %endpoint, attempt, "batch write deadline exceeded");
                }
            }

            drop(conn);
            pool.invalidate(conn_id);
            self.health.http_errors.with_label_values(&[&endpoint]).inc();
            if attempt < self.max_attempts {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }

        self.health.batches_dropped.inc();
        error!(
            endpoint = %endpoint,
            lines = lines.len(),
            attempts = self.max_attempts,
            "batch dropped after exhausting write attempts",
        );
    }

    /// Pushes any partially buffered socket writes through, even when no
    /// batches turned over this tick.
    async fn flush_partials(&self) {
        for pool in &self.pools {
            let Some(conn) = pool.get() else {
                continue;
            };
            // Skip rather than contend with an in-flight batch write.
            let Ok(mut conn) = conn.try_lock() else {
                continue;
            };
            let conn_id = conn.id();
            if let Err(e) = conn.flush().await {
                debug!(endpoint = pool.endpoint(), error = %e, "partial flush failed");
                drop(conn);
                pool.invalidate(conn_id);
            }
        }
    }
}
