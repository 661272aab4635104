//! Rolling statistical baseline for a single metric.

use std::collections::VecDeque;

/// Bounded sample window with derived statistics.
///
/// The window holds the most recent `capacity` samples of one metric and
/// answers mean, sample standard deviation and z-score questions about
/// them. All statistics are recomputed from the live window, so evicted
/// samples stop influencing the baseline immediately.
///
/// # Example
///
/// ```
/// use vigil::detect::MetricBaseline;
///
/// let mut baseline = MetricBaseline::new(100);
/// for value in [10.0, 12.0, 11.0, 13.0] {
///     baseline.add_sample(value);
/// }
/// assert_eq!(baseline.count(), 4);
/// assert!(baseline.z_score(11.5).abs() < 1.0);
/// ```
#[derive(Debug, Clone)]
pub struct MetricBaseline {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl MetricBaseline {
    /// Create an empty baseline retaining at most `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when the window is full.
    pub fn add_sample(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Number of samples currently in the window.
    #[must_use]
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// True once at least `min_samples` samples have been seen.
    #[must_use]
    pub fn is_ready(&self, min_samples: usize) -> bool {
        self.samples.len() >= min_samples
    }

    /// Arithmetic mean of the window, 0.0 when empty.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = self.samples.len() as f64;
        self.samples.iter().sum::<f64>() / n
    }

    /// Sample standard deviation (n − 1), 0.0 with fewer than two samples.
    #[must_use]
    pub fn std_dev(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        #[allow(clippy::cast_precision_loss)]
        let divisor = (self.samples.len() - 1) as f64;
        let variance = self
            .samples
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / divisor;
        variance.sqrt()
    }

    /// Standard score of `value` against the window, 0.0 when the
    /// standard deviation is zero.
    #[must_use]
    pub fn z_score(&self, value: f64) -> f64 {
        let std_dev = self.std_dev();
        if std_dev == 0.0 {
            return 0.0;
        }
        (value - self.mean()) / std_dev
    }

    /// Smallest sample in the window.
    #[must_use]
    pub fn min(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::min)
    }

    /// Largest sample in the window.
    #[must_use]
    pub fn max(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }

    /// The most recent `n` samples, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<f64> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).copied().collect()
    }

    /// The most recently added sample.
    #[must_use]
    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn filled(values: &[f64]) -> MetricBaseline {
        let mut baseline = MetricBaseline::new(1000);
        for &v in values {
            baseline.add_sample(v);
        }
        baseline
    }

    #[test]
    fn test_empty_baseline() {
        let baseline = MetricBaseline::new(10);
        assert_eq!(baseline.count(), 0);
        assert_eq!(baseline.mean(), 0.0);
        assert_eq!(baseline.std_dev(), 0.0);
        assert_eq!(baseline.z_score(5.0), 0.0);
        assert!(baseline.min().is_none());
        assert!(baseline.max().is_none());
        assert!(baseline.last().is_none());
        assert!(!baseline.is_ready(1));
    }

    #[test]
    fn test_mean_and_std_dev() {
        let baseline = filled(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(baseline.mean(), 5.0);
        // Sample std dev of the classic 8-value set
        assert!((baseline.std_dev() - 2.138_089_9).abs() < 1e-6);
    }

    #[test]
    fn test_std_dev_single_sample() {
        let baseline = filled(&[42.0]);
        assert_eq!(baseline.std_dev(), 0.0);
        assert_eq!(baseline.z_score(100.0), 0.0);
    }

    #[test]
    fn test_z_score_constant_series() {
        let baseline = filled(&[50.0; 30]);
        assert_eq!(baseline.std_dev(), 0.0);
        assert_eq!(baseline.z_score(98.0), 0.0);
    }

    #[test]
    fn test_z_score_sign() {
        let baseline = filled(&[10.0, 20.0, 30.0, 40.0, 50.0]);
        assert!(baseline.z_score(60.0) > 0.0);
        assert!(baseline.z_score(0.0) < 0.0);
        assert_eq!(baseline.z_score(30.0), 0.0);
    }

    #[test]
    fn test_window_eviction() {
        let mut baseline = MetricBaseline::new(3);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            baseline.add_sample(v);
        }
        assert_eq!(baseline.count(), 3);
        assert_eq!(baseline.min(), Some(3.0));
        assert_eq!(baseline.max(), Some(5.0));
        assert_eq!(baseline.mean(), 4.0);
        assert_eq!(baseline.last(), Some(5.0));
    }

    #[test]
    fn test_is_ready() {
        let mut baseline = MetricBaseline::new(100);
        for v in 0..29 {
            baseline.add_sample(f64::from(v));
        }
        assert!(!baseline.is_ready(30));
        baseline.add_sample(29.0);
        assert!(baseline.is_ready(30));
    }

    #[test]
    fn test_recent_returns_tail() {
        let baseline = filled(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(baseline.recent(2), vec![3.0, 4.0]);
        assert_eq!(baseline.recent(10), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(baseline.recent(0), Vec::<f64>::new());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut baseline = MetricBaseline::new(0);
        baseline.add_sample(1.0);
        baseline.add_sample(2.0);
        assert_eq!(baseline.count(), 1);
        assert_eq!(baseline.last(), Some(2.0));
    }

    proptest! {
        #[test]
        fn prop_mean_within_bounds(values in prop::collection::vec(-1e6..1e6f64, 1..200)) {
            let baseline = filled(&values);
            let mean = baseline.mean();
            let min = baseline.min().unwrap();
            let max = baseline.max().unwrap();
            prop_assert!(mean >= min - 1e-9);
            prop_assert!(mean <= max + 1e-9);
        }

        #[test]
        fn prop_std_dev_non_negative(values in prop::collection::vec(-1e6..1e6f64, 0..200)) {
            let baseline = filled(&values);
            prop_assert!(baseline.std_dev() >= 0.0);
        }

        #[test]
        fn prop_z_score_of_mean_is_zero(values in prop::collection::vec(-1e3..1e3f64, 2..100)) {
            let baseline = filled(&values);
            let z = baseline.z_score(baseline.mean());
            prop_assert!(z.abs() < 1e-9);
        }
    }
}
