use std::collections::{HashMap, HashSet};

use crate::synth::Sample;

/// Quantile probabilities at which reference and window distributions are
/// compared.
pub const COMPARE_PROBS: [f64; 5] = [0.01, 0.05, 0.5, 0.95, 0.99];

/// Jensen-Shannon divergence between two categorical distributions,
/// normalized by ln 2 so scores lie in [0, 1]. Empty inputs score the
/// maximum divergence.
pub fn js_divergence(reference: &HashMap<String, f64>, current: &HashMap<String, f64>) -> f64 {
    if reference.is_empty() || current.is_empty() {
        return 1.0;
    }

    let keys: HashSet<&String> = reference.keys().chain(current.keys()).collect();

    let mut sum = 0.0;
    for key in keys {
        let p = reference.get(key).copied().unwrap_or(0.0);
        let q = current.get(key).copied().unwrap_or(0.0);
        if p == 0.0 && q == 0.0 {
            continue;
        }

        let m = (p + q) / 2.0;
        if p > 0.0 && m > 0.0 {
            sum += p * (p / m).ln();
        }
        if q > 0.0 && m > 0.0 {
            sum += q * (q / m).ln();
        }
    }

    (sum / 2.0) / std::f64::consts::LN_2
}

/// Quantile-matched 1-Wasserstein distance, normalized by the reference
/// range and the number of compared points.
pub fn wasserstein_distance(reference: &[f64], current: &[f64]) -> f64 {
    if reference.is_empty() || current.is_empty() {
        return 1.0;
    }

    let k = reference.len().min(current.len());
    let mut distance = 0.0;
    for i in 0..k {
        distance += (reference[i] - current[i]).abs();
    }

    let range = reference[reference.len() - 1] - reference[0];
    if range > 0.0 {
        distance /= range;
    }

    distance / k as f64
}

/// Quantile-matched Kolmogorov-Smirnov statistic: the supremum of the
/// quantile-value deltas, normalized by the reference range.
pub fn ks_statistic(reference: &[f64], current: &[f64]) -> f64 {
    if reference.is_empty() || current.is_empty() {
        return 1.0;
    }

    let k = reference.len().min(current.len());
    let mut max_delta: f64 = 0.0;
    for i in 0..k {
        max_delta = max_delta.max((reference[i] - current[i]).abs());
    }

    let range = reference[reference.len() - 1] - reference[0];
    if range > 0.0 {
        max_delta /= range;
    }

    max_delta
}

/// Empirical quantiles of `values` at the given probabilities, by linear
/// interpolation over the sorted sample.
pub fn quantiles(values: &[f64], probs: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return vec![0.0; probs.len()];
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    probs
        .iter()
        .map(|&p| {
            let pos = p * (sorted.len() - 1) as f64;
            let idx = pos as usize;
            if idx >= sorted.len() - 1 {
                sorted[sorted.len() - 1]
            } else {
                let frac = pos - idx as f64;
                sorted[idx] + frac * (sorted[idx + 1] - sorted[idx])
            }
        })
        .collect()
}

/// Pearson correlation coefficient; None when either side is constant or
/// the series are shorter than two points.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }

    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }

    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

/// Empirical source distribution over a sample window.
pub fn source_distribution(samples: &[Sample]) -> HashMap<String, f64> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for sample in samples {
        *counts.entry(sample.source.clone()).or_default() += 1;
    }
    normalize_counts(counts, samples.len())
}

/// Empirical distribution of one tag key over a sample window. Samples
/// without the key do not contribute.
pub fn tag_distribution(samples: &[Sample], tag_key: &str) -> HashMap<String, f64> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut total = 0;
    for sample in samples {
        if let Some(value) = sample.tags.get(tag_key) {
            *counts.entry(value.clone()).or_default() += 1;
            total += 1;
        }
    }
    normalize_counts(counts, total)
}

pub fn values(samples: &[Sample]) -> Vec<f64> {
    samples.iter().map(|s| s.value).collect()
}

pub fn line_sizes(samples: &[Sample]) -> Vec<f64> {
    samples.iter().map(|s| s.line_size as f64).collect()
}

/// Per-minute-of-day sample counts paired with the intensity curve at the
/// same minutes, for temporal correlation.
pub fn minute_counts(samples: &[Sample], intensity: &[f64]) -> (Vec<f64>, Vec<f64>) {
    if intensity.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut counts: HashMap<usize, usize> = HashMap::new();
    for sample in samples {
        let minute = crate::clock::minute_of_day(sample.timestamp);
        *counts.entry(minute).or_default() += 1;
    }

    let mut minutes: Vec<usize> = counts.keys().copied().collect();
    minutes.sort_unstable();

    let observed = minutes.iter().map(|m| counts[m] as f64).collect();
    let expected = minutes
        .iter()
        .map(|m| intensity[m % intensity.len()])
        .collect();
    (observed, expected)
}

fn normalize_counts(counts: HashMap<String, usize>, total: usize) -> HashMap<String, f64> {
    if total == 0 {
        return HashMap::new();
    }
    counts
        .into_iter()
        .map(|(key, count)| (key, count as f64 / total as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn dist(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_js_identical_is_zero() {
        let d = dist(&[("prod", 0.7), ("staging", 0.2), ("dev", 0.1)]);
        assert!(js_divergence(&d, &d).abs() < 1e-12);
    }

    #[test]
    fn test_js_collapsed_distribution() {
        // Reference prod=0.7/staging=0.2/dev=0.1 against 100% prod.
        let reference = dist(&[("prod", 0.7), ("staging", 0.2), ("dev", 0.1)]);
        let current = dist(&[("prod", 1.0)]);
        let js = js_divergence(&reference, &current);
        assert!((js - 0.1692).abs() < 0.001, "js={js}");
    }

    #[test]
    fn test_js_disjoint_is_one() {
        let a = dist(&[("x", 1.0)]);
        let b = dist(&[("y", 1.0)]);
        assert!((js_divergence(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_js_empty_is_max() {
        let a = dist(&[("x", 1.0)]);
        assert_eq!(js_divergence(&a, &HashMap::new()), 1.0);
        assert_eq!(js_divergence(&HashMap::new(), &a), 1.0);
    }

    #[test]
    fn test_js_symmetry() {
        let a = dist(&[("x", 0.6), ("y", 0.4)]);
        let b = dist(&[("x", 0.3), ("y", 0.5), ("z", 0.2)]);
        assert!((js_divergence(&a, &b) - js_divergence(&b, &a)).abs() < 1e-12);
    }

    #[test]
    fn test_wasserstein_identical_is_zero() {
        let q = vec![1.0, 10.0, 50.0, 90.0, 99.0];
        assert_eq!(wasserstein_distance(&q, &q), 0.0);
    }

    #[test]
    fn test_wasserstein_shifted() {
        let reference = vec![0.0, 25.0, 50.0, 75.0, 100.0];
        let current = vec![10.0, 35.0, 60.0, 85.0, 110.0];
        // Each point off by 10, range 100, five points: 50/100/5 = 0.1.
        let w = wasserstein_distance(&reference, &current);
        assert!((w - 0.1).abs() < 1e-12, "w={w}");
    }

    #[test]
    fn test_ks_uses_max_delta() {
        let reference = vec![0.0, 25.0, 50.0, 75.0, 100.0];
        let mut current = reference.clone();
        current[2] = 70.0;
        // Single 20-point delta over a range of 100.
        let ks = ks_statistic(&reference, &current);
        assert!((ks - 0.2).abs() < 1e-12, "ks={ks}");
    }

    #[test]
    fn test_ks_not_self_canceling() {
        // Different distributions must never score zero.
        let reference = vec![80.0, 120.0, 200.0, 350.0, 500.0];
        let current = vec![10.0, 20.0, 30.0, 40.0, 50.0];
        assert!(ks_statistic(&reference, &current) > 0.0);
    }

    #[test]
    fn test_quantiles_interpolation() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let q = quantiles(&values, &[0.0, 0.5, 1.0]);
        assert_eq!(q[0], 1.0);
        assert!((q[1] - 50.5).abs() < 1e-9);
        assert_eq!(q[2], 100.0);
    }

    #[test]
    fn test_quantiles_empty() {
        assert_eq!(quantiles(&[], &COMPARE_PROBS), vec![0.0; 5]);
    }

    #[test]
    fn test_pearson_perfect_correlation() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![2.0, 4.0, 6.0, 8.0];
        let r = pearson(&a, &b).expect("defined");
        assert!((r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_anticorrelation() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![3.0, 2.0, 1.0];
        let r = pearson(&a, &b).expect("defined");
        assert!((r + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_constant_is_none() {
        assert!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_none());
        assert!(pearson(&[1.0], &[1.0]).is_none());
    }

    fn sample_with(source: &str, env: Option<&str>, value: f64, size: usize) -> Sample {
        let mut tags = HashMap::new();
        if let Some(env) = env {
            tags.insert("env".to_string(), env.to_string());
        }
        Sample {
            timestamp: UNIX_EPOCH + Duration::from_secs(1_000),
            value,
            source: source.to_string(),
            tags,
            line_size: size,
        }
    }

    #[test]
    fn test_source_distribution() {
        let samples = vec![
            sample_with("a", None, 1.0, 10),
            sample_with("a", None, 1.0, 10),
            sample_with("b", None, 1.0, 10),
            sample_with("c", None, 1.0, 10),
        ];
        let d = source_distribution(&samples);
        assert!((d["a"] - 0.5).abs() < 1e-12);
        assert!((d["b"] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_tag_distribution_skips_absent() {
        let samples = vec![
            sample_with("h", Some("prod"), 1.0, 10),
            sample_with("h", Some("prod"), 1.0, 10),
            sample_with("h", Some("dev"), 1.0, 10),
            sample_with("h", None, 1.0, 10),
        ];
        let d = tag_distribution(&samples, "env");
        assert!((d["prod"] - 2.0 / 3.0).abs() < 1e-12);
        assert!((d["dev"] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_minute_counts_pairs_with_intensity() {
        let mut intensity = vec![1.0; 1440];
        intensity[16] = 4.0;
        // 1000 s = minute 16 of day.
        let samples = vec![
            sample_with("h", None, 1.0, 10),
            sample_with("h", None, 1.0, 10),
        ];
        let (observed, expected) = minute_counts(&samples, &intensity);
        assert_eq!(observed, vec![2.0]);
        assert_eq!(expected, vec![4.0]);
    }
}
