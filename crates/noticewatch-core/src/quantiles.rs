//! Bounded-sample quantile estimation.
//!
//! Each metric keeps its most recent samples (1000 by default) and order
//! statistics are computed on demand with linear interpolation between the
//! two nearest ranks.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

pub const DEFAULT_SAMPLE_CAPACITY: usize = 1_000;

/// Order statistics over one metric's retained samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantileSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl QuantileSummary {
    fn from_sorted(sorted: &[f64]) -> Option<Self> {
        let (first, last) = (sorted.first()?, sorted.last()?);
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        Some(Self {
            count: sorted.len(),
            min: *first,
            max: *last,
            mean,
            median: percentile(sorted, 0.50),
            p90: percentile(sorted, 0.90),
            p95: percentile(sorted, 0.95),
            p99: percentile(sorted, 0.99),
        })
    }
}

/// Linear-interpolated percentile of an ascending slice. `p` is in `[0, 1]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        len => {
            let rank = p.clamp(0.0, 1.0) * (len - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

/// Per-metric sample windows. Constructed explicitly and shared by `Arc`.
#[derive(Debug)]
pub struct QuantileEstimator {
    capacity: usize,
    samples: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl Default for QuantileEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CAPACITY)
    }
}

impl QuantileEstimator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a sample, dropping the oldest once the metric is at capacity.
    /// Non-finite values are ignored.
    pub fn record(&self, metric: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        let mut samples = self
            .samples
            .lock()
            .expect("quantile samples lock is not poisoned");
        let window = samples
            .entry(metric.to_owned())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(64)));
        while window.len() >= self.capacity {
            window.pop_front();
        }
        window.push_back(value);
    }

    pub fn summary(&self, metric: &str) -> Option<QuantileSummary> {
        let sorted = {
            let samples = self
                .samples
                .lock()
                .expect("quantile samples lock is not poisoned");
            sorted_copy(samples.get(metric)?)
        };
        QuantileSummary::from_sorted(&sorted)
    }

    pub fn summaries(&self) -> BTreeMap<String, QuantileSummary> {
        let copies: Vec<(String, Vec<f64>)> = {
            let samples = self
                .samples
                .lock()
                .expect("quantile samples lock is not poisoned");
            samples
                .iter()
                .map(|(metric, window)| (metric.clone(), sorted_copy(window)))
                .collect()
        };
        copies
            .into_iter()
            .filter_map(|(metric, sorted)| {
                QuantileSummary::from_sorted(&sorted).map(|summary| (metric, summary))
            })
            .collect()
    }

    pub fn sample_count(&self, metric: &str) -> usize {
        self.samples
            .lock()
            .expect("quantile samples lock is not poisoned")
            .get(metric)
            .map_or(0, VecDeque::len)
    }

    pub fn reset(&self) {
        self.samples
            .lock()
            .expect("quantile samples lock is not poisoned")
            .clear();
    }
}

fn sorted_copy(window: &VecDeque<f64>) -> Vec<f64> {
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_between_ranks() {
        let sorted = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 0.0), 10.0);
        assert_eq!(percentile(&sorted, 1.0), 40.0);
        assert!((percentile(&sorted, 0.5) - 25.0).abs() < 1e-9);
        assert!((percentile(&sorted, 0.9) - 37.0).abs() < 1e-9);
    }

    #[test]
    fn summary_over_one_to_hundred() {
        let estimator = QuantileEstimator::default();
        for value in (1..=100).rev() {
            estimator.record("fetch_ms", f64::from(value));
        }

        let summary = estimator.summary("fetch_ms").expect("summary");
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
        assert!((summary.mean - 50.5).abs() < 1e-9);
        assert!((summary.median - 50.5).abs() < 1e-9);
        assert!((summary.p90 - 90.1).abs() < 1e-9);
        assert!((summary.p99 - 99.01).abs() < 1e-9);
    }

    #[test]
    fn keeps_only_the_most_recent_samples() {
        let estimator = QuantileEstimator::new(3);
        for value in [100.0, 1.0, 2.0, 3.0] {
            estimator.record("m", value);
        }

        assert_eq!(estimator.sample_count("m"), 3);
        assert_eq!(estimator.summary("m").expect("summary").max, 3.0);
    }

    #[test]
    fn unknown_metric_and_non_finite_values() {
        let estimator = QuantileEstimator::default();
        estimator.record("m", f64::NAN);
        assert!(estimator.summary("m").is_none());
        assert!(estimator.summaries().is_empty());
    }
}
