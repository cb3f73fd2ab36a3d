use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for a replayoor worker process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identity reported to the control plane. Falls back to $WORKER_ID,
    /// then $HOSTNAME.
    #[serde(default)]
    pub worker_id: String,

    /// Control plane base URL (e.g. "http://loadgen-control-plane:8080").
    #[serde(default)]
    pub control_plane_url: String,

    /// Health/status HTTP listener. Default: ":8080".
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prometheus metrics listener. Default: ":9090".
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Assignment poll cadence. Default: 30s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Per-family emission loop cadence. Default: 100ms (~10 Hz).
    #[serde(default = "default_emit_tick", with = "humantime_serde")]
    pub emit_tick: Duration,

    /// Baseline lines/sec used when a recipe omits temporal.base_rate.
    #[serde(default = "default_base_rate")]
    pub base_rate: f64,

    /// Maximum lines per batch. Default: 1000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum bytes per batch. Default: 1 MiB.
    #[serde(default = "default_batch_bytes")]
    pub batch_bytes: usize,

    /// Periodic buffer flush cadence. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Socket writer buffer per connection. Default: 8 KiB.
    #[serde(default = "default_connection_buffer_bytes")]
    pub connection_buffer_bytes: usize,

    /// Initial reconnect backoff. Default: 1s.
    #[serde(default = "default_reconnect_initial", with = "humantime_serde")]
    pub reconnect_initial: Duration,

    /// Reconnect backoff ceiling. Default: 60s.
    #[serde(default = "default_reconnect_max", with = "humantime_serde")]
    pub reconnect_max: Duration,

    /// How long a pool may stay reconnecting before /health reports 503.
    /// Default: 60s.
    #[serde(default = "default_reconnect_deadline", with = "humantime_serde")]
    pub reconnect_deadline: Duration,

    /// Write attempts per batch per endpoint before the batch is dropped.
    /// Default: 3.
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,

    /// Rate governor adjustment cadence. Default: 1s.
    #[serde(default = "default_rate_refresh", with = "humantime_serde")]
    pub rate_refresh: Duration,

    /// Rate governor acceleration in lines/sec per second; 0 disables
    /// smoothing so the rate follows the target directly.
    #[serde(default)]
    pub rate_acceleration: f64,

    /// Synthesis seed; 0 draws from entropy, any other value makes the
    /// emitted stream deterministic per family.
    #[serde(default)]
    pub seed: u64,

    /// Divergence monitor configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Divergence monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Enable the in-process divergence monitor. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Monitor HTTP listener port. Default: 9100.
    #[serde(default = "default_monitor_port")]
    pub port: u16,

    /// Sliding window duration. Default: 5m.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Element cap per sliding window. Default: 10000.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    /// Jensen-Shannon red threshold. Default: 0.05.
    #[serde(default = "default_js_threshold")]
    pub js_threshold: f64,

    /// Wasserstein red threshold. Default: 0.1.
    #[serde(default = "default_wasserstein_threshold")]
    pub wasserstein_threshold: f64,

    /// Kolmogorov-Smirnov red threshold. Default: 0.05.
    #[serde(default = "default_ks_threshold")]
    pub ks_threshold: f64,

    /// Consecutive red minutes before the critical alert. Default: 15.
    #[serde(default = "default_red_minutes")]
    pub red_minutes: u32,

    /// Optional directory of recipe JSON files loaded as references at
    /// startup, for families outside the live assignment.
    #[serde(default)]
    pub reference_path: String,
}

// --- Default value functions ---

fn default_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_emit_tick() -> Duration {
    Duration::from_millis(100)
}

fn default_base_rate() -> f64 {
    1.0
}

fn default_batch_size() -> usize {
    1000
}

fn default_batch_bytes() -> usize {
    1024 * 1024
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_connection_buffer_bytes() -> usize {
    8 * 1024
}

fn default_reconnect_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(60)
}

fn default_reconnect_deadline() -> Duration {
    Duration::from_secs(60)
}

fn default_max_write_attempts() -> u32 {
    3
}

fn default_rate_refresh() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_monitor_port() -> u16 {
    9100
}

fn default_window() -> Duration {
    Duration::from_secs(300)
}

fn default_max_samples() -> usize {
    10_000
}

fn default_js_threshold() -> f64 {
    0.05
}

fn default_wasserstein_threshold() -> f64 {
    0.1
}

fn default_ks_threshold() -> f64 {
    0.05
}

fn default_red_minutes() -> u32 {
    15
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            control_plane_url: String::new(),
            port: default_port(),
            metrics_port: default_metrics_port(),
            poll_interval: default_poll_interval(),
            emit_tick: default_emit_tick(),
            base_rate: default_base_rate(),
            batch_size: default_batch_size(),
            batch_bytes: default_batch_bytes(),
            flush_interval: default_flush_interval(),
            connection_buffer_bytes: default_connection_buffer_bytes(),
            reconnect_initial: default_reconnect_initial(),
            reconnect_max: default_reconnect_max(),
            reconnect_deadline: default_reconnect_deadline(),
            max_write_attempts: default_max_write_attempts(),
            rate_refresh: default_rate_refresh(),
            rate_acceleration: 0.0,
            seed: 0,
            monitor: MonitorConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_monitor_port(),
            window: default_window(),
            max_samples: default_max_samples(),
            js_threshold: default_js_threshold(),
            wasserstein_threshold: default_wasserstein_threshold(),
            ks_threshold: default_ks_threshold(),
            red_minutes: default_red_minutes(),
            reference_path: String::new(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file, filling the worker id from
    /// the environment when absent.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        if cfg.worker_id.is_empty() {
            cfg.worker_id = std::env::var("WORKER_ID")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_default();
        }

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.control_plane_url.is_empty() {
            bail!("control_plane_url is required");
        }

        if self.worker_id.is_empty() {
            bail!("worker_id is required (flag, config, $WORKER_ID, or $HOSTNAME)");
        }

        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }

        if self.batch_bytes == 0 {
            bail!("batch_bytes must be positive");
        }

        if self.emit_tick.is_zero() {
            bail!("emit_tick must be positive");
        }

        if self.monitor.enabled {
            if self.monitor.max_samples == 0 {
                bail!("monitor.max_samples must be positive when enabled");
            }

            if self.monitor.js_threshold <= 0.0
                || self.monitor.wasserstein_threshold <= 0.0
                || self.monitor.ks_threshold <= 0.0
            {
                bail!("monitor thresholds must be positive when enabled");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            worker_id: "w-1".to_string(),
            control_plane_url: "http://cp:8080".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.metrics_port, 9090);
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.emit_tick, Duration::from_millis(100));
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.batch_bytes, 1024 * 1024);
        assert_eq!(cfg.connection_buffer_bytes, 8192);
        assert_eq!(cfg.max_write_attempts, 3);
        assert!(cfg.monitor.enabled);
        assert_eq!(cfg.monitor.red_minutes, 15);
        assert_eq!(cfg.monitor.window, Duration::from_secs(300));
    }

    #[test]
    fn test_validate_requires_control_plane_url() {
        let cfg = Config {
            worker_id: "w-1".to_string(),
            ..Default::default()
        };
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("control_plane_url"));
    }

    #[test]
    fn test_validate_requires_worker_id() {
        let cfg = Config {
            control_plane_url: "http://cp:8080".to_string(),
            ..Default::default()
        };
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("worker_id"));
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut cfg = valid();
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threshold_when_enabled() {
        let mut cfg = valid();
        cfg.monitor.js_threshold = 0.0;
        assert!(cfg.validate().is_err());

        cfg.monitor.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_with_humantime_durations() {
        let yaml = r#"
worker_id: w-1
control_plane_url: http://cp:8080
poll_interval: 10s
flush_interval: 250ms
monitor:
  window: 2m
  red_minutes: 5
"#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).expect("write");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.flush_interval, Duration::from_millis(250));
        assert_eq!(cfg.monitor.window, Duration::from_secs(120));
        assert_eq!(cfg.monitor.red_minutes, 5);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.batch_size, 1000);
    }
}
