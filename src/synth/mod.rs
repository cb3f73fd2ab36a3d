pub mod samplers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp1};

use crate::clock;
use crate::recipe::{Recipe, RecipeError, RecordKind};
use crate::wire::{self, Centroid, Granularity, HistogramRecord, MetricRecord, Record, SpanRecord};

use samplers::{
    CategoricalSampler, IntervalSampler, QuantileSampler, StringPatternSampler, WeightedItem,
    WeightedPattern,
};

/// One synthesized observation, tee'd to the divergence monitor.
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: SystemTime,
    pub value: f64,
    pub source: String,
    pub tags: HashMap<String, String>,
    pub line_size: usize,
}

/// One synthesized record: the wire text plus its monitor sample.
#[derive(Debug, Clone)]
pub struct Emission {
    pub text: String,
    pub sample: Sample,
}

/// Synthesizes protocol-conformant records for one metric family.
///
/// Owns its samplers, its seeded random source, and the per-minute delta
/// accumulator. All sampling paths are infallible once construction
/// succeeds; a malformed recipe fails construction with `RecipeError`.
pub struct FamilySynthesizer {
    recipe: Arc<Recipe>,
    rng: StdRng,
    value_sampler: QuantileSampler,
    source_sampler: Option<CategoricalSampler>,
    tag_samplers: HashMap<String, CategoricalSampler>,
    pattern_samplers: HashMap<String, StringPatternSampler>,
    interval_sampler: IntervalSampler,
    tag_keys: Vec<String>,
    delta_bucket: u64,
    delta_totals: HashMap<String, f64>,
    schema_drift: f64,
    error_injection: f64,
}

impl FamilySynthesizer {
    pub fn new(recipe: Arc<Recipe>, seed: u64) -> Result<Self, RecipeError> {
        recipe.validate()?;

        let quantiles = recipe
            .statistics
            .value_distribution
            .as_ref()
            .map(|d| d.quantiles.as_vec())
            .unwrap_or_default();
        let value_sampler = QuantileSampler::new(quantiles);

        let source_sampler = if recipe.statistics.source_distribution.is_empty() {
            None
        } else {
            Some(categorical_from(&recipe.statistics.source_distribution))
        };

        let tag_samplers = recipe
            .statistics
            .tag_distributions
            .iter()
            .filter(|(_, dist)| !dist.is_empty())
            .map(|(key, dist)| (key.clone(), categorical_from(dist)))
            .collect();

        let mut pattern_samplers = HashMap::new();
        if let Some(patterns) = &recipe.patterns {
            if !patterns.source_patterns.is_empty() {
                pattern_samplers.insert(
                    "source".to_string(),
                    pattern_sampler_from(&patterns.source_patterns),
                );
            }
            for (key, specs) in &patterns.tag_value_patterns {
                if !specs.is_empty() {
                    pattern_samplers.insert(key.clone(), pattern_sampler_from(specs));
                }
            }
        }

        let interval_sampler = IntervalSampler::new(
            recipe.temporal.arrival_pattern,
            recipe.temporal.burstiness.mean,
        );

        // Stable tag order keeps encoded lines and delta keys deterministic.
        let mut tag_keys: Vec<String> = recipe.schema.tags.keys().cloned().collect();
        tag_keys.sort();

        Ok(Self {
            recipe,
            rng: StdRng::seed_from_u64(seed),
            value_sampler,
            source_sampler,
            tag_samplers,
            pattern_samplers,
            interval_sampler,
            tag_keys,
            delta_bucket: 0,
            delta_totals: HashMap::new(),
            schema_drift: 0.0,
            error_injection: 0.0,
        })
    }

    pub fn family_id(&self) -> &str {
        &self.recipe.family_id
    }

    pub fn metric_name(&self) -> &str {
        &self.recipe.metric_name
    }

    pub fn recipe(&self) -> &Arc<Recipe> {
        &self.recipe
    }

    /// Updates the drift and error-injection probabilities from the
    /// current assignment.
    pub fn set_policies(&mut self, schema_drift: f64, error_injection: f64) {
        self.schema_drift = schema_drift;
        self.error_injection = error_injection;
    }

    /// Draws from the synthesizer's own random source; used by the
    /// worker for probabilistic rounding so a fixed seed pins the whole
    /// emission sequence.
    pub fn bernoulli(&mut self, p: f64) -> bool {
        self.rng.gen::<f64>() < p
    }

    /// Produces the next record at the given virtual time.
    pub fn next_record(&mut self, now: SystemTime, multiplier: f64) -> Emission {
        let kind = self.recipe.schema.kind;
        let source = self.sample_source();
        let mut tags = self.sample_tags();
        self.apply_schema_drift(&mut tags);

        let (record, value) = match kind {
            RecordKind::Histogram if self.rng.gen::<f64>() < 0.1 => {
                self.compose_histogram(now, multiplier, source.clone(), tags.clone())
            }
            RecordKind::Span => self.compose_span(now, source.clone(), tags.clone()),
            _ => self.compose_metric(
                now,
                multiplier,
                kind == RecordKind::Delta,
                source.clone(),
                tags.clone(),
            ),
        };

        let mut text = wire::encode(&record);
        text = self.inject_errors(text);

        let sample = Sample {
            timestamp: now,
            value,
            source,
            tags: tags.into_iter().collect(),
            line_size: text.len(),
        };

        Emission { text, sample }
    }

    /// Current target emission rate in records/second.
    ///
    /// With probability 0.1 a burst factor above 1 inflates the intensity,
    /// approximating Hawkes-style clustering.
    pub fn target_rate(
        &mut self,
        now: SystemTime,
        base: f64,
        multiplier: f64,
        burst_factor: f64,
    ) -> f64 {
        let mut intensity = self.recipe.intensity_at(clock::minute_of_day(now));
        if burst_factor > 1.0 && self.rng.gen::<f64>() < 0.1 {
            intensity *= 1.0 + (burst_factor - 1.0) * self.rng.gen::<f64>();
        }
        base * intensity * multiplier
    }

    /// Suggested inter-arrival in seconds from the recipe's temporal
    /// pattern at the given virtual time.
    pub fn next_interval(&mut self, now: SystemTime) -> f64 {
        let minute = clock::minute_of_day(now);
        self.interval_sampler
            .next(&mut self.rng, minute, &self.recipe.temporal.intensity_curve)
    }

    fn compose_metric(
        &mut self,
        now: SystemTime,
        multiplier: f64,
        delta: bool,
        source: String,
        tags: Vec<(String, String)>,
    ) -> (Record, f64) {
        let mut value = self.value_sampler.sample(&mut self.rng) * multiplier;
        if delta {
            value = self.accumulate_delta(now, &source, &tags, value);
        }

        let record = Record::Metric(MetricRecord {
            name: self.recipe.metric_name.clone(),
            value,
            timestamp: Some(clock::unix_seconds(now)),
            source,
            tags,
            delta,
        });
        (record, value)
    }

    fn compose_histogram(
        &mut self,
        now: SystemTime,
        multiplier: f64,
        source: String,
        tags: Vec<(String, String)>,
    ) -> (Record, f64) {
        let granularity = if self.rng.gen::<f64>() < 0.2 {
            Granularity::Hour
        } else if self.rng.gen::<f64>() < 0.05 {
            Granularity::Day
        } else {
            Granularity::Minute
        };

        let centroid_count = self.rng.gen_range(1..=5usize);
        let base_count = 10 + self.rng.gen_range(0..90u64);
        let total = ((multiplier * base_count as f64) as u64).max(centroid_count as u64);

        let per = total / centroid_count as u64;
        let mut centroids = Vec::with_capacity(centroid_count);
        for i in 0..centroid_count {
            let count = if i == centroid_count - 1 {
                total - per * (centroid_count as u64 - 1)
            } else {
                per
            };
            centroids.push(Centroid {
                count,
                mean: self.value_sampler.sample(&mut self.rng),
            });
        }

        let weighted_mean = centroids
            .iter()
            .map(|c| c.mean * c.count as f64)
            .sum::<f64>()
            / total as f64;

        let record = Record::Histogram(HistogramRecord {
            granularity,
            timestamp: clock::unix_seconds(now),
            centroids,
            name: self.recipe.metric_name.clone(),
            source,
            tags,
        });
        (record, weighted_mean)
    }

    fn compose_span(
        &mut self,
        now: SystemTime,
        source: String,
        tags: Vec<(String, String)>,
    ) -> (Record, f64) {
        let draw: f64 = Exp1.sample(&mut self.rng);
        let duration_ms = (draw * 1000.0) as u64 + 1;

        let record = Record::Span(SpanRecord {
            operation: self.recipe.metric_name.clone(),
            source,
            tags,
            start_ms: clock::unix_millis(now),
            duration_ms,
        });
        (record, duration_ms as f64)
    }

    /// Adds a delta increment to the per-minute accumulator and returns
    /// the running minute total. The whole accumulator resets when the
    /// record timestamp crosses a minute boundary.
    fn accumulate_delta(
        &mut self,
        now: SystemTime,
        source: &str,
        tags: &[(String, String)],
        increment: f64,
    ) -> f64 {
        let bucket = clock::minute_bucket(now);
        if bucket != self.delta_bucket {
            self.delta_totals.clear();
            self.delta_bucket = bucket;
        }

        let mut key =
            String::with_capacity(self.recipe.metric_name.len() + source.len() + tags.len() * 16);
        key.push_str(&self.recipe.metric_name);
        key.push('\u{1f}');
        key.push_str(source);
        for (k, v) in tags {
            key.push('\u{1f}');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }

        let total = self.delta_totals.entry(key).or_insert(0.0);
        *total += increment;
        *total
    }

    fn sample_source(&mut self) -> String {
        if let Some(sampler) = &self.source_sampler {
            return sampler.sample(&mut self.rng);
        }
        if let Some(sampler) = self.pattern_samplers.get("source") {
            return sampler.generate(&mut self.rng);
        }
        format!("host-{}", self.rng.gen_range(0..1000))
    }

    fn sample_tags(&mut self) -> Vec<(String, String)> {
        let recipe = Arc::clone(&self.recipe);
        let keys = self.tag_keys.clone();
        let mut tags = Vec::new();

        for key in keys {
            let Some(schema) = recipe.schema.tags.get(&key) else {
                continue;
            };
            if self.rng.gen::<f64>() >= schema.presence {
                continue;
            }
            let value = self.sample_tag_value(&key);
            if !value.is_empty() {
                tags.push((key, value));
            }
        }

        tags
    }

    fn sample_tag_value(&mut self, key: &str) -> String {
        if let Some(sampler) = self.tag_samplers.get(key) {
            return sampler.sample(&mut self.rng);
        }
        if let Some(sampler) = self.pattern_samplers.get(key) {
            return sampler.generate(&mut self.rng);
        }
        self.default_tag_value(key)
    }

    /// Heuristic fallback values keyed on the tag key name.
    fn default_tag_value(&mut self, key: &str) -> String {
        let lower = key.to_ascii_lowercase();
        if lower.contains("env") {
            const ENVS: [&str; 4] = ["prod", "staging", "dev", "test"];
            return ENVS[self.rng.gen_range(0..ENVS.len())].to_string();
        }
        if lower.contains("region") {
            const REGIONS: [&str; 4] = ["us-east-1", "us-west-2", "eu-west-1", "ap-southeast-1"];
            return REGIONS[self.rng.gen_range(0..REGIONS.len())].to_string();
        }
        if lower.contains("service") {
            return format!("service-{}", self.rng.gen_range(0..100));
        }
        if lower.contains("version") {
            return format!(
                "v{}.{}.{}",
                self.rng.gen_range(0..10),
                self.rng.gen_range(0..20),
                self.rng.gen_range(0..100),
            );
        }
        format!("value-{}", self.rng.gen_range(0..1000))
    }

    fn apply_schema_drift(&mut self, tags: &mut Vec<(String, String)>) {
        if self.schema_drift <= 0.0 || self.rng.gen::<f64>() >= self.schema_drift {
            return;
        }

        if self.rng.gen::<f64>() < 0.5 {
            tags.push((
                format!("drift_tag_{}", self.rng.gen_range(0..10)),
                format!("value_{}", self.rng.gen_range(0..100)),
            ));
        }

        if !tags.is_empty() && self.rng.gen::<f64>() < 0.3 {
            let idx = self.rng.gen_range(0..tags.len());
            tags[idx].1 = format!("drift_{}", tags[idx].1);
        }
    }

    /// Corrupts the encoded line with one of five policies, each chosen
    /// uniformly once the error-injection gate fires.
    fn inject_errors(&mut self, line: String) -> String {
        if self.error_injection <= 0.0 || self.rng.gen::<f64>() >= self.error_injection {
            return line;
        }

        match self.rng.gen_range(0..5) {
            0 => line.replacen(&self.recipe.metric_name, "invalid metric name", 1),
            1 => strip_source(&line),
            2 => replace_value_with_nan(&line),
            3 => truncate_half(line),
            _ => line.replacen('=', "==", 1),
        }
    }
}

fn categorical_from(dist: &crate::recipe::Categorical) -> CategoricalSampler {
    CategoricalSampler::new(
        dist.top_values
            .iter()
            .map(|v| WeightedItem {
                value: v.value.clone(),
                weight: v.frequency,
            })
            .collect(),
    )
}

fn pattern_sampler_from(specs: &[crate::recipe::PatternSpec]) -> StringPatternSampler {
    StringPatternSampler::new(
        specs
            .iter()
            .map(|s| WeightedPattern {
                pattern: s.pattern.clone(),
                weight: s.frequency,
            })
            .collect(),
    )
}

fn strip_source(line: &str) -> String {
    let Some(start) = line.find("source=") else {
        return line.to_string();
    };
    let end = line[start..]
        .find(' ')
        .map(|i| start + i + 1)
        .unwrap_or(line.len());

    let mut out = String::with_capacity(line.len());
    out.push_str(&line[..start]);
    out.push_str(&line[end..]);
    out
}

fn replace_value_with_nan(line: &str) -> String {
    let mut parts = line.splitn(3, ' ');
    let (Some(head), Some(value)) = (parts.next(), parts.next()) else {
        return line.to_string();
    };
    if value.parse::<f64>().is_err() {
        return line.to_string();
    }
    match parts.next() {
        Some(rest) => format!("{head} NaN {rest}"),
        None => format!("{head} NaN"),
    }
}

fn truncate_half(mut line: String) -> String {
    if line.len() <= 10 {
        return line;
    }
    let mut cut = line.len() / 2;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    line.truncate(cut);
    line
}
