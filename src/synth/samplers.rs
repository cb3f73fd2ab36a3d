use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Exp1, Normal};
use serde::Deserialize;

/// A candidate value with its sampling weight.
#[derive(Debug, Clone)]
pub struct WeightedItem {
    pub value: String,
    pub weight: f64,
}

/// Samples from a weighted categorical distribution by binary search on
/// precomputed cumulative weights.
#[derive(Debug, Clone)]
pub struct CategoricalSampler {
    items: Vec<WeightedItem>,
    cumulative: Vec<f64>,
    total: f64,
}

impl CategoricalSampler {
    pub fn new(items: Vec<WeightedItem>) -> Self {
        let mut cumulative = Vec::with_capacity(items.len());
        let mut total = 0.0;
        for item in &items {
            total += item.weight;
            cumulative.push(total);
        }
        Self {
            items,
            cumulative,
            total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns a value by weight. Empty input yields the empty string;
    /// a zero total weight falls back to a uniform choice.
    pub fn sample(&self, rng: &mut StdRng) -> String {
        if self.items.is_empty() {
            return String::new();
        }
        if self.total <= 0.0 {
            return self.items[rng.gen_range(0..self.items.len())].value.clone();
        }

        let target = rng.gen::<f64>() * self.total;
        let idx = self
            .cumulative
            .partition_point(|&c| c < target)
            .min(self.items.len() - 1);
        self.items[idx].value.clone()
    }
}

/// Samples a numeric value by interpolating equally spaced CDF points.
#[derive(Debug, Clone)]
pub struct QuantileSampler {
    quantiles: Vec<f64>,
    fallback: Option<Normal<f64>>,
}

impl QuantileSampler {
    /// Builds a sampler from quantile points. Fewer than three points is
    /// not enough shape to interpolate, so it degrades to N(50, 10).
    pub fn new(mut quantiles: Vec<f64>) -> Self {
        if quantiles.len() < 3 {
            return Self {
                quantiles: Vec::new(),
                fallback: Some(Normal::new(50.0, 10.0).expect("valid normal params")),
            };
        }

        quantiles.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Self {
            quantiles,
            fallback: None,
        }
    }

    pub fn sample(&self, rng: &mut StdRng) -> f64 {
        if let Some(normal) = &self.fallback {
            return normal.sample(rng);
        }
        interpolate(&self.quantiles, rng.gen::<f64>())
    }
}

/// Linear interpolation of a CDF represented as equally spaced quantiles.
pub fn interpolate(quantiles: &[f64], p: f64) -> f64 {
    if p <= 0.0 {
        return quantiles[0];
    }
    if p >= 1.0 {
        return quantiles[quantiles.len() - 1];
    }

    let n = quantiles.len() - 1;
    let pos = p * n as f64;
    let idx = pos as usize;
    if idx >= n {
        return quantiles[n];
    }

    let frac = pos - idx as f64;
    quantiles[idx] + frac * (quantiles[idx + 1] - quantiles[idx])
}

/// A string pattern with its sampling weight.
#[derive(Debug, Clone)]
pub struct WeightedPattern {
    pub pattern: String,
    pub weight: f64,
}

/// Generates strings from a restricted regex subset.
///
/// Recognized classes: `\d+`, `\d{k}`, `[a-z]+`, `[a-z]{k}`, `[A-Z]+`,
/// `[A-Z]{k}`, `[a-zA-Z0-9]+`. Anything else passes through unchanged.
#[derive(Debug, Clone)]
pub struct StringPatternSampler {
    patterns: Vec<WeightedPattern>,
    cumulative: Vec<f64>,
    total: f64,
}

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

impl StringPatternSampler {
    pub fn new(patterns: Vec<WeightedPattern>) -> Self {
        let patterns = if patterns.is_empty() {
            vec![WeightedPattern {
                pattern: "default-[a-z]{3}-\\d{2}".to_string(),
                weight: 1.0,
            }]
        } else {
            patterns
        };

        let mut cumulative = Vec::with_capacity(patterns.len());
        let mut total = 0.0;
        for p in &patterns {
            total += p.weight;
            cumulative.push(total);
        }
        Self {
            patterns,
            cumulative,
            total,
        }
    }

    /// Picks a pattern by weight and expands it.
    pub fn generate(&self, rng: &mut StdRng) -> String {
        let idx = if self.total <= 0.0 {
            rng.gen_range(0..self.patterns.len())
        } else {
            let target = rng.gen::<f64>() * self.total;
            self.cumulative
                .partition_point(|&c| c < target)
                .min(self.patterns.len() - 1)
        };
        expand_pattern(&self.patterns[idx].pattern, rng)
    }
}

/// Expands the supported character classes in a pattern.
pub fn expand_pattern(pattern: &str, rng: &mut StdRng) -> String {
    let bytes = pattern.as_bytes();
    let mut out = String::with_capacity(pattern.len());
    let mut i = 0;

    while i < bytes.len() {
        let rest = &pattern[i..];
        if let Some((consumed, charset, base_len)) = match_class(rest) {
            let after = &pattern[i + consumed..];
            if let Some((brace_len, count)) = match_brace_count(after) {
                push_random(&mut out, rng, charset, count);
                i += consumed + brace_len;
                continue;
            }
            if after.starts_with('+') {
                let len = base_len.0 + rng.gen_range(0..base_len.1);
                push_random(&mut out, rng, charset, len);
                i += consumed + 1;
                continue;
            }
        }

        // Not a recognized class at this position; copy one char verbatim.
        let c = rest.chars().next().expect("non-empty rest");
        out.push(c);
        i += c.len_utf8();
    }

    out
}

/// Matches a class prefix, returning (bytes consumed, charset, `+` length
/// range as (min, span)).
fn match_class(s: &str) -> Option<(usize, &'static [u8], (usize, usize))> {
    if s.starts_with("\\d") {
        return Some((2, DIGITS, (1, 4)));
    }
    if s.starts_with("[a-zA-Z0-9]") {
        return Some((11, ALNUM, (5, 10)));
    }
    if s.starts_with("[a-z]") {
        return Some((5, LOWER, (3, 5)));
    }
    if s.starts_with("[A-Z]") {
        return Some((5, UPPER, (3, 5)));
    }
    None
}

/// Matches a `{k}` repetition suffix, returning (bytes consumed, k).
fn match_brace_count(s: &str) -> Option<(usize, usize)> {
    let inner = s.strip_prefix('{')?;
    let end = inner.find('}')?;
    let count: usize = inner[..end].parse().ok()?;
    Some((end + 2, count))
}

fn push_random(out: &mut String, rng: &mut StdRng, charset: &[u8], len: usize) {
    for _ in 0..len {
        out.push(charset[rng.gen_range(0..charset.len())] as char);
    }
}

/// Inter-arrival pacing shape for a family's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalPattern {
    #[default]
    Uniform,
    Poisson,
    Bursty,
}

/// Samples inter-arrival times in seconds from an intensity curve.
#[derive(Debug, Clone)]
pub struct IntervalSampler {
    pattern: IntervalPattern,
    burstiness: f64,
}

impl IntervalSampler {
    pub fn new(pattern: IntervalPattern, burstiness: f64) -> Self {
        Self {
            pattern,
            burstiness,
        }
    }

    /// Returns the next inter-arrival in seconds for the given minute of
    /// day. A zero intensity yields an infinite interval (no emission).
    pub fn next(&self, rng: &mut StdRng, minute: usize, intensity: &[f64]) -> f64 {
        let mut base = 1.0;
        if !intensity.is_empty() {
            let level = intensity[minute % intensity.len()];
            base /= level;
        }

        match self.pattern {
            IntervalPattern::Poisson => {
                let draw: f64 = Exp1.sample(rng);
                draw * base
            }
            IntervalPattern::Bursty => {
                if rng.gen::<f64>() < 0.1 {
                    base / (1.0 + self.burstiness * rng.gen::<f64>())
                } else {
                    let draw: f64 = Exp1.sample(rng);
                    2.0 * base * draw
                }
            }
            IntervalPattern::Uniform => base * (0.5 + rng.gen::<f64>()),
        }
    }
}
