pub mod http;
pub mod stats;
pub mod window;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::export::health::MonitorMetrics;
use crate::recipe::Recipe;
use crate::synth::Sample;

use stats::COMPARE_PROBS;
use window::SlidingWindow;

/// Minimum window samples before a divergence pass runs for a family.
const MIN_SAMPLES: usize = 10;

/// Health classification for one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyHealth {
    Green,
    Amber,
    Red,
}

impl FamilyHealth {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Green => 0.0,
            Self::Amber => 1.0,
            Self::Red => 2.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Amber => "amber",
            Self::Red => "red",
        }
    }
}

/// Red thresholds for the three divergence metrics; amber fires at half.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub js: f64,
    pub wasserstein: f64,
    pub ks: f64,
    pub red_minutes: u32,
}

/// Reference statistics extracted from a family's recipe.
pub struct ReferenceStats {
    pub source_distribution: HashMap<String, f64>,
    pub tag_distributions: HashMap<String, HashMap<String, f64>>,
    pub value_quantiles: Vec<f64>,
    pub size_quantiles: Vec<f64>,
    pub intensity_curve: Vec<f64>,
}

impl From<&Recipe> for ReferenceStats {
    fn from(recipe: &Recipe) -> Self {
        Self {
            source_distribution: recipe.statistics.source_distribution.probabilities(),
            tag_distributions: recipe
                .statistics
                .tag_distributions
                .iter()
                .map(|(key, dist)| (key.clone(), dist.probabilities()))
                .collect(),
            value_quantiles: recipe
                .statistics
                .value_distribution
                .as_ref()
                .map(|d| d.quantiles.as_vec())
                .unwrap_or_default(),
            size_quantiles: recipe.statistics.size_quantiles.clone(),
            intensity_curve: recipe.temporal.intensity_curve.clone(),
        }
    }
}

/// Latest divergence scores for one family.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DivergenceScores {
    pub js_categorical: f64,
    pub wasserstein_value: f64,
    pub ks_size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal_correlation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_computed: Option<chrono::DateTime<chrono::Utc>>,
}

struct FamilyState {
    scores: DivergenceScores,
    status: FamilyHealth,
    consecutive_red: u32,
}

/// Divergence tracking for one family: its reference, its window, and the
/// latest classification.
pub struct FamilyMonitor {
    pub family_id: String,
    pub metric_name: String,
    reference: ReferenceStats,
    window: SlidingWindow,
    state: parking_lot::Mutex<FamilyState>,
}

impl FamilyMonitor {
    pub fn status(&self) -> FamilyHealth {
        self.state.lock().status
    }

    pub fn scores(&self) -> DivergenceScores {
        self.state.lock().scores.clone()
    }

    pub fn consecutive_red(&self) -> u32 {
        self.state.lock().consecutive_red
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }
}

/// Ingests tee'd samples per family and periodically scores how far the
/// synthetic stream has drifted from its reference statistics.
pub struct DivergenceMonitor {
    families: DashMap<String, Arc<FamilyMonitor>>,
    thresholds: Thresholds,
    window_duration: Duration,
    max_samples: usize,
    metrics: Arc<MonitorMetrics>,
}

impl DivergenceMonitor {
    pub fn new(cfg: &MonitorConfig, metrics: Arc<MonitorMetrics>) -> Self {
        Self {
            families: DashMap::new(),
            thresholds: Thresholds {
                js: cfg.js_threshold,
                wasserstein: cfg.wasserstein_threshold,
                ks: cfg.ks_threshold,
                red_minutes: cfg.red_minutes,
            },
            window_duration: cfg.window,
            max_samples: cfg.max_samples,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MonitorMetrics> {
        &self.metrics
    }

    pub fn family_count(&self) -> usize {
        self.families.len()
    }

    /// Registers a family's recipe as its reference. Re-registration of a
    /// known family keeps the existing window.
    pub fn register_family(&self, recipe: &Recipe) {
        if self.families.contains_key(&recipe.family_id) {
            return;
        }

        let monitor = Arc::new(FamilyMonitor {
            family_id: recipe.family_id.clone(),
            metric_name: recipe.metric_name.clone(),
            reference: ReferenceStats::from(recipe),
            window: SlidingWindow::new(self.window_duration, self.max_samples),
            state: parking_lot::Mutex::new(FamilyState {
                scores: DivergenceScores::default(),
                status: FamilyHealth::Green,
                consecutive_red: 0,
            }),
        });

        self.families.insert(recipe.family_id.clone(), monitor);
        debug!(family = %recipe.family_id, "registered reference statistics");
    }

    /// Loads reference recipes from a directory of JSON files.
    pub fn load_references(&self, dir: &Path) -> Result<usize> {
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;

        let mut loaded = 0;
        for entry in entries {
            let path = entry.context("reading directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let data = std::fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            match Recipe::from_json(&data) {
                Ok(recipe) => {
                    self.register_family(&recipe);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping bad reference recipe");
                }
            }
        }

        Ok(loaded)
    }

    /// Accepts one tee'd sample. Samples for unregistered families are
    /// dropped silently; registration follows recipe loading.
    pub fn ingest(&self, family_id: &str, sample: Sample) {
        let Some(family) = self.families.get(family_id) else {
            return;
        };
        family.window.add(sample);
        self.metrics
            .samples_ingested
            .with_label_values(&[family_id])
            .inc();
    }

    /// Spawns the minute compute loop.
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first interval tick is immediate and would score empty
            // windows; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        monitor.compute_all();
                    }
                }
            }
        });
    }

    /// Runs one divergence pass over every family and refreshes the
    /// aggregate alert gauges.
    pub fn compute_all(&self) {
        let families: Vec<Arc<FamilyMonitor>> =
            self.families.iter().map(|f| Arc::clone(f.value())).collect();

        for family in &families {
            self.compute_family(family);
        }

        self.update_alerts(&families);
    }

    fn compute_family(&self, family: &FamilyMonitor) {
        let samples = family.window.snapshot();
        if samples.len() < MIN_SAMPLES {
            self.metrics
                .compute_skips
                .with_label_values(&[&family.family_id])
                .inc();
            return;
        }

        let family_id = family.family_id.as_str();

        // Categorical JS: source plus every reference tag distribution.
        let js_source = stats::js_divergence(
            &family.reference.source_distribution,
            &stats::source_distribution(&samples),
        );

        let mut js_tag_sum = 0.0;
        let mut tag_count = 0usize;
        for (tag_key, reference) in &family.reference.tag_distributions {
            let current = stats::tag_distribution(&samples, tag_key);
            let js_tag = stats::js_divergence(reference, &current);
            js_tag_sum += js_tag;
            tag_count += 1;

            self.metrics
                .divergence_js
                .with_label_values(&[family_id, &format!("tag_{tag_key}")])
                .set(js_tag);
        }
        let js_tag_avg = if tag_count > 0 {
            js_tag_sum / tag_count as f64
        } else {
            0.0
        };

        self.metrics
            .divergence_js
            .with_label_values(&[family_id, "source"])
            .set(js_source);
        self.metrics
            .divergence_js
            .with_label_values(&[family_id, "tags_average"])
            .set(js_tag_avg);

        // Numeric Wasserstein over matched quantiles.
        let current_values = stats::quantiles(&stats::values(&samples), &COMPARE_PROBS);
        let wasserstein =
            stats::wasserstein_distance(&family.reference.value_quantiles, &current_values);

        // Size KS over matched quantiles.
        let current_sizes = stats::quantiles(&stats::line_sizes(&samples), &COMPARE_PROBS);
        let ks = stats::ks_statistic(&family.reference.size_quantiles, &current_sizes);

        let js_categorical = (js_source + js_tag_avg) / 2.0;
        if js_categorical.is_nan() || wasserstein.is_nan() || ks.is_nan() {
            self.metrics
                .compute_skips
                .with_label_values(&[family_id])
                .inc();
            return;
        }

        self.metrics
            .divergence_wasserstein
            .with_label_values(&[family_id])
            .set(wasserstein);
        self.metrics
            .divergence_ks
            .with_label_values(&[family_id])
            .set(ks);

        // Optional temporal correlation against the intensity curve.
        let (observed, expected) =
            stats::minute_counts(&samples, &family.reference.intensity_curve);
        let temporal = stats::pearson(&observed, &expected);
        if let Some(r) = temporal {
            self.metrics
                .temporal_correlation
                .with_label_values(&[family_id])
                .set(r);
        }

        let scores = DivergenceScores {
            js_categorical,
            wasserstein_value: wasserstein,
            ks_size: ks,
            temporal_correlation: temporal,
            last_computed: Some(chrono::Utc::now()),
        };
        let status = self.classify(&scores);

        {
            let mut state = family.state.lock();
            if status == FamilyHealth::Red {
                state.consecutive_red += 1;
            } else {
                state.consecutive_red = 0;
            }
            state.scores = scores;
            state.status = status;
        }

        self.metrics
            .family_status
            .with_label_values(&[family_id, &family.metric_name])
            .set(status.as_f64());

        info!(
            family = %family_id,
            js = js_categorical,
            wasserstein,
            ks,
            status = status.as_str(),
            "divergence computed",
        );
    }

    fn classify(&self, scores: &DivergenceScores) -> FamilyHealth {
        let t = &self.thresholds;

        if scores.js_categorical > t.js
            || scores.wasserstein_value > t.wasserstein
            || scores.ks_size > t.ks
        {
            return FamilyHealth::Red;
        }

        if scores.js_categorical > t.js * 0.5
            || scores.wasserstein_value > t.wasserstein * 0.5
            || scores.ks_size > t.ks * 0.5
        {
            return FamilyHealth::Amber;
        }

        FamilyHealth::Green
    }

    fn update_alerts(&self, families: &[Arc<FamilyMonitor>]) {
        let mut red = 0usize;
        let mut amber = 0usize;
        let mut critical = 0usize;

        for family in families {
            let state = family.state.lock();
            match state.status {
                FamilyHealth::Red => {
                    red += 1;
                    if state.consecutive_red >= self.thresholds.red_minutes {
                        critical += 1;
                    }
                }
                FamilyHealth::Amber => amber += 1,
                FamilyHealth::Green => {}
            }
        }

        let alerts = &self.metrics.alerts_active;
        alerts
            .with_label_values(&["critical", "divergence"])
            .set(critical as f64);
        alerts
            .with_label_values(&["warning", "divergence"])
            .set(amber as f64);
        alerts
            .with_label_values(&["info", "divergence"])
            .set(red as f64);
    }

    /// Per-family summaries for the /families endpoint.
    pub fn family_summaries(&self) -> Vec<serde_json::Value> {
        self.families
            .iter()
            .map(|entry| {
                let family = entry.value();
                let state = family.state.lock();
                serde_json::json!({
                    "family_id": family.family_id,
                    "metric_name": family.metric_name,
                    "status": state.status,
                    "consecutive_red": state.consecutive_red,
                    "samples": family.window.len(),
                    "divergence": state.scores,
                })
            })
            .collect()
    }
}

/// Builds a monitor sample directly; test and replay hook.
pub fn sample(
    timestamp: SystemTime,
    value: f64,
    source: &str,
    tags: &[(&str, &str)],
    line_size: usize,
) -> Sample {
    Sample {
        timestamp,
        value,
        source: source.to_string(),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        line_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Categorical, TagSchema, WeightedValue};
    use std::time::UNIX_EPOCH;

    fn monitor_with(cfg: MonitorConfig) -> DivergenceMonitor {
        let metrics = Arc::new(MonitorMetrics::new().expect("metrics"));
        DivergenceMonitor::new(&cfg, metrics)
    }

    fn reference_recipe() -> Recipe {
        let json = crate::recipe::tests::minimal_json("metric");
        let mut recipe = Recipe::from_json(json.as_bytes()).expect("decode");
        recipe.schema.tags.insert(
            "env".to_string(),
            TagSchema {
                presence: 1.0,
                value_type: String::new(),
            },
        );
        recipe.statistics.tag_distributions.insert(
            "env".to_string(),
            Categorical {
                top_values: vec![
                    WeightedValue {
                        value: "prod".to_string(),
                        frequency: 0.7,
                    },
                    WeightedValue {
                        value: "staging".to_string(),
                        frequency: 0.2,
                    },
                    WeightedValue {
                        value: "dev".to_string(),
                        frequency: 0.1,
                    },
                ],
            },
        );
        recipe.statistics.source_distribution = Categorical {
            top_values: vec![WeightedValue {
                value: "host-01".to_string(),
                frequency: 1.0,
            }],
        };
        recipe.statistics.size_quantiles = vec![80.0, 120.0, 200.0, 350.0, 500.0];
        recipe
    }

    fn feed(monitor: &DivergenceMonitor, family_id: &str, count: usize, env: &str) {
        for i in 0..count {
            monitor.ingest(
                family_id,
                sample(
                    UNIX_EPOCH + Duration::from_secs(1_700_000_000 + i as u64),
                    42.0,
                    "host-01",
                    &[("env", env)],
                    200,
                ),
            );
        }
    }

    #[test]
    fn test_ingest_unregistered_family_is_dropped() {
        let monitor = monitor_with(MonitorConfig::default());
        monitor.ingest(
            "ghost",
            sample(UNIX_EPOCH, 1.0, "h", &[], 10),
        );
        assert_eq!(monitor.family_count(), 0);
    }

    #[test]
    fn test_register_family_idempotent() {
        let monitor = monitor_with(MonitorConfig::default());
        let recipe = reference_recipe();
        monitor.register_family(&recipe);
        feed(&monitor, "fam-1", 5, "prod");
        monitor.register_family(&recipe);

        // Window survives re-registration.
        let family = monitor.families.get("fam-1").expect("family");
        assert_eq!(family.sample_count(), 5);
    }

    #[test]
    fn test_insufficient_samples_skips_tick() {
        let monitor = monitor_with(MonitorConfig::default());
        monitor.register_family(&reference_recipe());
        feed(&monitor, "fam-1", MIN_SAMPLES - 1, "prod");

        monitor.compute_all();

        let family = monitor.families.get("fam-1").expect("family");
        assert_eq!(family.status(), FamilyHealth::Green);
        assert!(family.scores().last_computed.is_none());
        assert!(
            monitor
                .metrics
                .compute_skips
                .with_label_values(&["fam-1"])
                .get()
                >= 1.0,
        );
    }

    #[test]
    fn test_collapsed_tag_distribution_goes_red() {
        // 1000 samples of 100% env=prod against a 0.7/0.2/0.1 reference
        // must turn the family red on the first pass.
        let monitor = monitor_with(MonitorConfig::default());
        monitor.register_family(&reference_recipe());
        feed(&monitor, "fam-1", 1000, "prod");

        monitor.compute_all();

        let family = monitor.families.get("fam-1").expect("family");
        assert_eq!(family.status(), FamilyHealth::Red);
        assert_eq!(family.consecutive_red(), 1);

        let js_env = monitor
            .metrics
            .divergence_js
            .with_label_values(&["fam-1", "tag_env"])
            .get();
        assert!((js_env - 0.1692).abs() < 0.001, "js_env={js_env}");
    }

    #[test]
    fn test_matching_stream_stays_green() {
        let monitor = monitor_with(MonitorConfig::default());
        monitor.register_family(&reference_recipe());

        // Match the reference: 70% prod, 20% staging, 10% dev; values at
        // the median; sizes at the median reference quantile.
        for i in 0..1000usize {
            let env = match i % 10 {
                0..=6 => "prod",
                7 | 8 => "staging",
                _ => "dev",
            };
            monitor.ingest(
                "fam-1",
                sample(
                    UNIX_EPOCH + Duration::from_secs(1_700_000_000 + i as u64),
                    42.0,
                    "host-01",
                    &[("env", env)],
                    200,
                ),
            );
        }

        monitor.compute_all();

        let family = monitor.families.get("fam-1").expect("family");
        // Values are constant at p50 but the reference spans 1..99, so
        // some numeric drift is expected; only the tag stream is exact.
        let scores = family.scores();
        assert!(scores.js_categorical < 0.05, "js={}", scores.js_categorical);
    }

    #[test]
    fn test_consecutive_red_accumulates_and_resets() {
        let mut cfg = MonitorConfig::default();
        cfg.red_minutes = 2;
        let monitor = monitor_with(cfg);
        monitor.register_family(&reference_recipe());
        feed(&monitor, "fam-1", 1000, "prod");

        monitor.compute_all();
        monitor.compute_all();

        let family = monitor.families.get("fam-1").expect("family");
        assert_eq!(family.consecutive_red(), 2);

        let critical = monitor
            .metrics
            .alerts_active
            .with_label_values(&["critical", "divergence"])
            .get();
        assert_eq!(critical, 1.0);
    }

    #[test]
    fn test_classify_amber_at_half_threshold() {
        let monitor = monitor_with(MonitorConfig::default());
        let scores = DivergenceScores {
            js_categorical: 0.03, // above 0.025, below 0.05
            wasserstein_value: 0.0,
            ks_size: 0.0,
            temporal_correlation: None,
            last_computed: None,
        };
        assert_eq!(monitor.classify(&scores), FamilyHealth::Amber);
    }

    #[test]
    fn test_classify_any_metric_turns_red() {
        let monitor = monitor_with(MonitorConfig::default());
        let scores = DivergenceScores {
            js_categorical: 0.0,
            wasserstein_value: 0.2,
            ks_size: 0.0,
            temporal_correlation: None,
            last_computed: None,
        };
        assert_eq!(monitor.classify(&scores), FamilyHealth::Red);
    }

    #[test]
    fn test_load_references_from_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("fam.json"),
            crate::recipe::tests::minimal_json("metric"),
        )
        .expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");
        std::fs::write(dir.path().join("bad.json"), "{").expect("write");

        let monitor = monitor_with(MonitorConfig::default());
        let loaded = monitor
            .load_references(dir.path())
            .expect("load references");
        assert_eq!(loaded, 1);
        assert_eq!(monitor.family_count(), 1);
    }

    #[test]
    fn test_family_summaries_shape() {
        let monitor = monitor_with(MonitorConfig::default());
        monitor.register_family(&reference_recipe());
        let summaries = monitor.family_summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0]["family_id"], "fam-1");
        assert_eq!(summaries[0]["status"], "green");
    }
}
