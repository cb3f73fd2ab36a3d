use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::clock::MINUTES_PER_DAY;
use crate::synth::samplers::IntervalPattern;

/// Recipe load/validation failures. A family whose recipe fails here is
/// skipped for the current assignment and retried on the next poll.
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("decoding recipe JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("recipe {family_id:?}: {reason}")]
    Invalid { family_id: String, reason: String },
}

/// The record kind a family synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Metric,
    Delta,
    Histogram,
    Span,
}

/// Per-tag-key schema: how often the key appears and what kind of values
/// it carries.
#[derive(Debug, Clone, Deserialize)]
pub struct TagSchema {
    pub presence: f64,
    #[serde(rename = "type", default)]
    pub value_type: String,
}

/// Family schema: record kind plus declared tag keys.
#[derive(Debug, Clone, Deserialize)]
pub struct RecipeSchema {
    pub kind: RecordKind,
    #[serde(default)]
    pub tags: HashMap<String, TagSchema>,
}

/// Fixed quantile points of the family's value distribution.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Quantiles {
    pub p01: f64,
    pub p05: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Quantiles {
    /// The quantile points as an ordered vector for interpolation.
    pub fn as_vec(&self) -> Vec<f64> {
        vec![self.p01, self.p05, self.p50, self.p95, self.p99]
    }

    fn is_ordered(&self) -> bool {
        let q = self.as_vec();
        q.windows(2).all(|w| w[0] <= w[1])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValueDistribution {
    pub quantiles: Quantiles,
}

/// One observed value with its relative frequency.
#[derive(Debug, Clone, Deserialize)]
pub struct WeightedValue {
    pub value: String,
    pub frequency: f64,
}

/// A weighted categorical distribution over observed values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Categorical {
    #[serde(default)]
    pub top_values: Vec<WeightedValue>,
}

impl Categorical {
    pub fn is_empty(&self) -> bool {
        self.top_values.is_empty()
    }

    /// Frequencies normalized to probabilities (guarding a zero sum).
    pub fn probabilities(&self) -> HashMap<String, f64> {
        let total: f64 = self.top_values.iter().map(|v| v.frequency).sum();
        if total <= 0.0 {
            return HashMap::new();
        }
        self.top_values
            .iter()
            .map(|v| (v.value.clone(), v.frequency / total))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipeStatistics {
    pub value_distribution: Option<ValueDistribution>,
    #[serde(default)]
    pub source_distribution: Categorical,
    #[serde(default)]
    pub tag_distributions: HashMap<String, Categorical>,
    #[serde(default)]
    pub size_quantiles: Vec<f64>,
}

/// Burstiness profile captured from the original traffic.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Burstiness {
    pub mean: f64,
    #[serde(default)]
    pub stddev: f64,
}

impl Default for Burstiness {
    fn default() -> Self {
        Self {
            mean: 1.0,
            stddev: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipeTemporal {
    /// Baseline emission rate in lines/sec; the worker falls back to its
    /// configured default when absent.
    pub base_rate: Option<f64>,
    #[serde(default)]
    pub intensity_curve: Vec<f64>,
    #[serde(default)]
    pub burstiness: Burstiness,
    #[serde(default)]
    pub arrival_pattern: IntervalPattern,
}

/// One string pattern with its relative frequency.
#[derive(Debug, Clone, Deserialize)]
pub struct PatternSpec {
    pub pattern: String,
    pub frequency: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipePatterns {
    #[serde(default)]
    pub source_patterns: Vec<PatternSpec>,
    #[serde(default)]
    pub tag_value_patterns: HashMap<String, Vec<PatternSpec>>,
}

/// Compact statistical profile of one metric family, produced by the
/// offline profiling job and served by the control plane. Immutable once
/// loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct Recipe {
    pub family_id: String,
    pub metric_name: String,
    #[serde(default)]
    pub version: String,
    pub schema: RecipeSchema,
    #[serde(default)]
    pub statistics: RecipeStatistics,
    #[serde(default)]
    pub temporal: RecipeTemporal,
    #[serde(default)]
    pub patterns: Option<RecipePatterns>,
}

impl Recipe {
    /// Decodes and validates a recipe from its JSON body.
    pub fn from_json(data: &[u8]) -> Result<Self, RecipeError> {
        let recipe: Recipe = serde_json::from_slice(data)?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// Checks the recipe invariants; violations make the whole family
    /// unloadable.
    pub fn validate(&self) -> Result<(), RecipeError> {
        if self.family_id.is_empty() {
            return self.invalid("family_id is required");
        }
        if self.metric_name.is_empty() {
            return self.invalid("metric_name is required");
        }

        let curve = &self.temporal.intensity_curve;
        if !curve.is_empty() && curve.len() != MINUTES_PER_DAY {
            return self.invalid(&format!(
                "intensity_curve must have {MINUTES_PER_DAY} entries, has {}",
                curve.len(),
            ));
        }
        if curve.iter().any(|v| *v < 0.0 || !v.is_finite()) {
            return self.invalid("intensity_curve entries must be finite and non-negative");
        }

        if let Some(dist) = &self.statistics.value_distribution {
            if !dist.quantiles.is_ordered() {
                return self.invalid("value quantiles must be non-decreasing");
            }
        }

        for (key, schema) in &self.schema.tags {
            if !(0.0..=1.0).contains(&schema.presence) {
                return self.invalid(&format!("tag {key:?} presence must be in [0, 1]"));
            }
        }

        for key in self.statistics.tag_distributions.keys() {
            match self.schema.tags.get(key) {
                Some(schema) if schema.presence > 0.0 => {}
                Some(_) => {
                    return self.invalid(&format!(
                        "tag distribution {key:?} has zero presence in schema",
                    ));
                }
                None => {
                    return self.invalid(&format!(
                        "tag distribution {key:?} is not declared in schema",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Intensity multiplier at a minute of day; an absent curve is flat.
    pub fn intensity_at(&self, minute: usize) -> f64 {
        let curve = &self.temporal.intensity_curve;
        if curve.is_empty() {
            return 1.0;
        }
        curve[minute % curve.len()]
    }

    /// Mean of the intensity curve (1.0 when absent).
    pub fn mean_intensity(&self) -> f64 {
        let curve = &self.temporal.intensity_curve;
        if curve.is_empty() {
            return 1.0;
        }
        curve.iter().sum::<f64>() / curve.len() as f64
    }

    fn invalid(&self, reason: &str) -> Result<(), RecipeError> {
        Err(RecipeError::Invalid {
            family_id: self.family_id.clone(),
            reason: reason.to_string(),
        })
    }
}
