//! Multi-strategy anomaly detection.
//!
//! Six strategies run over the metric baselines:
//! hard-limit thresholds, z-score outliers, sample-to-sample spikes and
//! drops, linear trend fits, a memory-leak heuristic over window halves,
//! and cpu/memory correlation. Detected anomalies are deduplicated per
//! (kind, metric) pair inside a fixed window so a sustained condition
//! produces one report per window instead of one per tick.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DetectorConfig;
use crate::detect::baseline::MetricBaseline;
use crate::metrics::{MetricSnapshot, MONITORED_METRICS};
use crate::traits::{Clock, SystemClock};

/// CPU usage above this is anomalous regardless of baseline.
pub const CPU_SATURATION_LIMIT: f64 = 95.0;
/// Memory usage above this is anomalous regardless of baseline.
pub const MEMORY_EXHAUSTION_LIMIT: f64 = 95.0;
/// Disk usage above this is anomalous regardless of baseline.
pub const DISK_EXHAUSTION_LIMIT: f64 = 98.0;

const CRITICAL_LIMIT: f64 = 99.0;
const BASELINE_WINDOW: usize = 1000;
const MAX_RECORDED: usize = 1000;
const DEDUP_WINDOW: Duration = Duration::from_secs(60);
const HEALTH_ANOMALY_WINDOW: Duration = Duration::from_secs(300);

const TREND_MIN_SAMPLES: usize = 10;
const TREND_SLOPE_LIMIT: f64 = 0.1;
const LEAK_SLOPE_LIMIT: f64 = 0.05;
const LEAK_WINDOW: usize = 100;
const LEAK_MIN_SAMPLES: usize = 50;
const LEAK_GROWTH_POINTS: f64 = 5.0;
const LEAK_MONOTONIC_RATIO: f64 = 0.7;
const CORRELATION_WINDOW: usize = 30;
const CORRELATION_LIMIT: f64 = 0.95;
const CORRELATION_EXPECTED: f64 = 0.5;

/// How severe a detected anomaly is, least to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Barely over a detection limit.
    Low,
    /// Worth recording, no action expected.
    Medium,
    /// Likely needs healing or operator attention.
    High,
    /// Resource exhaustion is imminent or in progress.
    Critical,
}

impl Severity {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of detected anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Sudden jump relative to the previous sample.
    Spike,
    /// Sudden fall relative to the previous sample.
    Drop,
    /// Sustained upward slope.
    TrendUp,
    /// Sustained downward slope.
    TrendDown,
    /// Statistical outlier against the baseline.
    Outlier,
    /// Hard limit breached.
    Threshold,
    /// Memory growth consistent with a leak.
    MemoryLeak,
    /// CPU pinned near its hard limit.
    CpuSaturation,
    /// Disk space nearly exhausted.
    DiskExhaustion,
    /// Two metrics moving in lockstep.
    Correlation,
}

impl AnomalyKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spike => "spike",
            Self::Drop => "drop",
            Self::TrendUp => "trend_up",
            Self::TrendDown => "trend_down",
            Self::Outlier => "outlier",
            Self::Threshold => "threshold",
            Self::MemoryLeak => "memory_leak",
            Self::CpuSaturation => "cpu_saturation",
            Self::DiskExhaustion => "disk_exhaustion",
            Self::Correlation => "correlation",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Wall-clock detection time.
    pub timestamp: DateTime<Utc>,
    /// Strategy category.
    pub kind: AnomalyKind,
    /// Metric the anomaly was observed on.
    pub metric: String,
    /// Assessed severity.
    pub severity: Severity,
    /// Observed value.
    pub value: f64,
    /// What the strategy expected instead.
    pub expected: f64,
    /// Strategy-specific deviation measure (z-score, ratio, slope, ...).
    pub deviation: f64,
    /// Human-readable description.
    pub message: String,
}

struct DetectorState {
    baselines: HashMap<String, MetricBaseline>,
    samples_seen: usize,
    recorded: VecDeque<(Instant, Anomaly)>,
    last_fired: HashMap<(AnomalyKind, String), Instant>,
}

/// Runs all detection strategies over incoming metric samples.
///
/// Thread-safe behind interior locking; the runtime shares one detector
/// between its detection loop and status queries.
pub struct AnomalyDetector {
    config: DetectorConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<DetectorState>,
}

impl AnomalyDetector {
    /// Create a detector on the system clock.
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a detector with an explicit clock, for deterministic tests.
    #[must_use]
    pub fn with_clock(config: DetectorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(DetectorState {
                baselines: HashMap::new(),
                samples_seen: 0,
                recorded: VecDeque::new(),
                last_fired: HashMap::new(),
            }),
        }
    }

    /// Feed one snapshot into the baselines without running any checks.
    ///
    /// Lets a host prime the baselines from replayed history before
    /// evaluation starts; [`detect`](Self::detect) feeds the same way
    /// ahead of its checks.
    pub fn add_sample(&self, snapshot: &MetricSnapshot) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.write_state();
        Self::feed(&mut state, snapshot);
    }

    /// Ingest one snapshot and report new anomalies.
    ///
    /// [`add_sample`](Self::add_sample) followed by
    /// [`evaluate`](Self::evaluate) under one lock hold.
    pub fn detect(&self, snapshot: &MetricSnapshot) -> Vec<Anomaly> {
        if !self.config.enabled {
            return Vec::new();
        }

        let mut state = self.write_state();
        Self::feed(&mut state, snapshot);
        let found = self.sweep(&state);
        self.admit_all(&mut state, found)
    }

    /// Re-evaluate the current window and report new anomalies.
    ///
    /// Runs every strategy over the monitored baselines as last fed,
    /// without ingesting anything; apart from dedup bookkeeping, repeat
    /// calls have no side effects. Cumulative network counters climb by
    /// construction, so the trend fit covers the percent gauges only.
    /// The leak heuristic and cpu/memory correlation run over the
    /// accumulated windows afterwards. Nothing fires until `min_samples`
    /// snapshots have been fed, keeping a cold baseline quiet.
    pub fn evaluate(&self) -> Vec<Anomaly> {
        if !self.config.enabled {
            return Vec::new();
        }

        let mut state = self.write_state();
        let found = self.sweep(&state);
        self.admit_all(&mut state, found)
    }

    /// Ingest one sample of an arbitrary metric and report new anomalies.
    ///
    /// Host-defined gauges go through the per-metric strategies only.
    pub fn observe(&self, metric: &str, value: f64) -> Vec<Anomaly> {
        if !self.config.enabled {
            return Vec::new();
        }

        let mut state = self.write_state();
        state
            .baselines
            .entry(metric.to_string())
            .or_insert_with(|| MetricBaseline::new(BASELINE_WINDOW))
            .add_sample(value);

        let found = self.metric_checks(&state.baselines, metric, value, true);
        self.admit_all(&mut state, found)
    }

    /// The most recent `limit` recorded anomalies, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Anomaly> {
        let state = self.read_state();
        let skip = state.recorded.len().saturating_sub(limit);
        state
            .recorded
            .iter()
            .skip(skip)
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// Number of anomalies recorded in the trailing five minutes.
    #[must_use]
    pub fn recent_count(&self) -> usize {
        let now = self.clock.now();
        let state = self.read_state();
        state
            .recorded
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= HEALTH_ANOMALY_WINDOW)
            .count()
    }

    /// Snapshot of one metric's baseline, `None` before any sample.
    #[must_use]
    pub fn baseline(&self, metric: &str) -> Option<MetricBaseline> {
        let state = self.read_state();
        state.baselines.get(metric).cloned()
    }

    /// Composite health score in 0..=100.
    ///
    /// Starts at 100 and pays for CPU over 50%, memory over 50%, disk over
    /// 70% and each anomaly recorded in the trailing five minutes.
    #[must_use]
    pub fn health_score(&self, snapshot: &MetricSnapshot) -> f64 {
        let mut score = 100.0;
        score -= (snapshot.cpu_percent - 50.0).max(0.0) * 0.5;
        score -= (snapshot.memory_percent - 50.0).max(0.0) * 0.5;
        score -= (snapshot.disk_percent - 70.0).max(0.0);
        #[allow(clippy::cast_precision_loss)]
        {
            score -= 5.0 * self.recent_count() as f64;
        }
        score.clamp(0.0, 100.0)
    }

    /// Drop all baselines, recorded anomalies and dedup bookkeeping.
    pub fn clear(&self) {
        let mut state = self.write_state();
        state.baselines.clear();
        state.samples_seen = 0;
        state.recorded.clear();
        state.last_fired.clear();
    }

    fn feed(state: &mut DetectorState, snapshot: &MetricSnapshot) {
        state.samples_seen += 1;
        for (metric, value) in snapshot.monitored_gauges() {
            state
                .baselines
                .entry(metric.to_string())
                .or_insert_with(|| MetricBaseline::new(BASELINE_WINDOW))
                .add_sample(value);
        }
    }

    fn sweep(&self, state: &DetectorState) -> Vec<Anomaly> {
        if state.samples_seen < self.config.min_samples {
            return Vec::new();
        }
        let mut found = Vec::new();
        for metric in MONITORED_METRICS {
            let Some(value) = state.baselines.get(metric).and_then(MetricBaseline::last)
            else {
                continue;
            };
            let fit_trend = !metric.starts_with("network_");
            found.extend(self.metric_checks(&state.baselines, metric, value, fit_trend));
        }
        if let Some(anomaly) = Self::leak_check(&state.baselines) {
            found.push(anomaly);
        }
        if let Some(anomaly) = Self::correlation_check(&state.baselines) {
            found.push(anomaly);
        }
        found
    }

    fn metric_checks(
        &self,
        baselines: &HashMap<String, MetricBaseline>,
        metric: &str,
        value: f64,
        fit_trend: bool,
    ) -> Vec<Anomaly> {
        let mut found = Vec::new();
        if let Some(anomaly) = Self::threshold_check(metric, value) {
            found.push(anomaly);
        }
        let Some(baseline) = baselines.get(metric) else {
            return found;
        };
        if let Some(anomaly) = self.outlier_check(baseline, metric, value) {
            found.push(anomaly);
        }
        if let Some(anomaly) = self.spike_check(baseline, metric) {
            found.push(anomaly);
        }
        if fit_trend {
            found.extend(self.trend_checks(baseline, metric));
        }
        found
    }

    fn threshold_check(metric: &str, value: f64) -> Option<Anomaly> {
        let (limit, kind) = match metric {
            "cpu_percent" => (CPU_SATURATION_LIMIT, AnomalyKind::CpuSaturation),
            "memory_percent" => (MEMORY_EXHAUSTION_LIMIT, AnomalyKind::Threshold),
            "disk_percent" => (DISK_EXHAUSTION_LIMIT, AnomalyKind::DiskExhaustion),
            _ => return None,
        };
        if value < limit {
            return None;
        }
        let severity = if value >= CRITICAL_LIMIT {
            Severity::Critical
        } else {
            Severity::High
        };
        Some(anomaly(
            kind,
            metric,
            severity,
            value,
            limit,
            value - limit,
            format!("{metric} at {value:.1}% breached hard limit {limit:.0}%"),
        ))
    }

    fn outlier_check(
        &self,
        baseline: &MetricBaseline,
        metric: &str,
        value: f64,
    ) -> Option<Anomaly> {
        if !baseline.is_ready(self.config.min_samples) {
            return None;
        }
        let z = baseline.z_score(value);
        if z.abs() < self.config.sensitivity {
            return None;
        }
        let severity = if z.abs() >= 4.0 {
            Severity::Critical
        } else if z.abs() >= 3.0 {
            Severity::High
        } else if z.abs() >= 2.5 {
            Severity::Medium
        } else {
            Severity::Low
        };
        let mean = baseline.mean();
        Some(anomaly(
            AnomalyKind::Outlier,
            metric,
            severity,
            value,
            mean,
            z,
            format!("{metric} value {value:.2} is {z:+.1}\u{3c3} from baseline mean {mean:.2}"),
        ))
    }

    fn spike_check(&self, baseline: &MetricBaseline, metric: &str) -> Option<Anomaly> {
        let tail = baseline.recent(2);
        if tail.len() < 2 {
            return None;
        }
        let (prev, cur) = (tail[0], tail[1]);
        let ratio = (cur - prev).abs() / prev.abs().max(1.0);
        if ratio < self.config.spike_threshold {
            return None;
        }
        let severity = if ratio >= 5.0 {
            Severity::Critical
        } else if ratio >= 3.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        let (kind, verb) = if cur > prev {
            (AnomalyKind::Spike, "jumped")
        } else {
            (AnomalyKind::Drop, "fell")
        };
        Some(anomaly(
            kind,
            metric,
            severity,
            cur,
            prev,
            ratio,
            format!("{metric} {verb} from {prev:.2} to {cur:.2} ({ratio:.1}x change)"),
        ))
    }

    fn trend_checks(&self, baseline: &MetricBaseline, metric: &str) -> Vec<Anomaly> {
        let values = baseline.recent(self.config.trend_samples());
        if values.len() < TREND_MIN_SAMPLES {
            return Vec::new();
        }
        let slope = linear_slope(&values);
        let first = values[0];
        let last = values[values.len() - 1];
        let n = values.len();

        let mut found = Vec::new();
        if slope.abs() > TREND_SLOPE_LIMIT {
            let (kind, direction) = if slope > 0.0 {
                (AnomalyKind::TrendUp, "up")
            } else {
                (AnomalyKind::TrendDown, "down")
            };
            found.push(anomaly(
                kind,
                metric,
                Severity::Medium,
                last,
                first,
                slope,
                format!("{metric} trending {direction} at {slope:.3}/sample over {n} samples"),
            ));
        }
        if metric == "memory_percent" && slope > LEAK_SLOPE_LIMIT {
            found.push(anomaly(
                AnomalyKind::MemoryLeak,
                metric,
                Severity::High,
                last,
                first,
                slope,
                format!("memory climbing at {slope:.3} pts/sample over {n} samples"),
            ));
        }
        found
    }

    fn leak_check(baselines: &HashMap<String, MetricBaseline>) -> Option<Anomaly> {
        let baseline = baselines.get("memory_percent")?;
        let values = baseline.recent(LEAK_WINDOW);
        if values.len() < LEAK_MIN_SAMPLES {
            return None;
        }
        let mid = values.len() / 2;
        let first_mean = slice_mean(&values[..mid]);
        let second_mean = slice_mean(&values[mid..]);
        let growth = second_mean - first_mean;
        if growth <= LEAK_GROWTH_POINTS {
            return None;
        }
        let non_decreasing = values.windows(2).filter(|w| w[1] >= w[0]).count();
        #[allow(clippy::cast_precision_loss)]
        let monotonic = non_decreasing as f64 / (values.len() - 1) as f64;
        if monotonic < LEAK_MONOTONIC_RATIO {
            return None;
        }
        Some(anomaly(
            AnomalyKind::MemoryLeak,
            "memory_percent",
            Severity::High,
            second_mean,
            first_mean,
            growth,
            format!(
                "memory grew {growth:.1} points between window halves, {:.0}% of steps non-decreasing",
                monotonic * 100.0
            ),
        ))
    }

    fn correlation_check(baselines: &HashMap<String, MetricBaseline>) -> Option<Anomaly> {
        let cpu = baselines.get("cpu_percent")?.recent(CORRELATION_WINDOW);
        let memory = baselines.get("memory_percent")?.recent(CORRELATION_WINDOW);
        if cpu.len() < CORRELATION_WINDOW || memory.len() < CORRELATION_WINDOW {
            return None;
        }
        let r = pearson(&cpu, &memory)?;
        if r <= CORRELATION_LIMIT {
            return None;
        }
        Some(anomaly(
            AnomalyKind::Correlation,
            "cpu_memory_correlation",
            Severity::Medium,
            r,
            CORRELATION_EXPECTED,
            r - CORRELATION_EXPECTED,
            format!("cpu and memory moving in lockstep (r={r:.3})"),
        ))
    }

    fn admit_all(
        &self,
        state: &mut DetectorState,
        found: Vec<Anomaly>,
    ) -> Vec<Anomaly> {
        let now = self.clock.now();
        let mut admitted = Vec::with_capacity(found.len());
        for candidate in found {
            let key = (candidate.kind, candidate.metric.clone());
            if let Some(prev) = state.last_fired.get(&key) {
                if now.saturating_duration_since(*prev) < DEDUP_WINDOW {
                    continue;
                }
            }
            state.last_fired.insert(key, now);
            state.recorded.push_back((now, candidate.clone()));
            while state.recorded.len() > MAX_RECORDED {
                state.recorded.pop_front();
            }
            tracing::warn!(
                kind = %candidate.kind,
                metric = %candidate.metric,
                severity = %candidate.severity,
                value = candidate.value,
                "anomaly detected"
            );
            admitted.push(candidate);
        }
        admitted
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, DetectorState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("detector state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, DetectorState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("detector state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl std::fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyDetector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn anomaly(
    kind: AnomalyKind,
    metric: &str,
    severity: Severity,
    value: f64,
    expected: f64,
    deviation: f64,
    message: String,
) -> Anomaly {
    Anomaly {
        timestamp: Utc::now(),
        kind,
        metric: metric.to_string(),
        severity,
        value,
        expected,
        deviation,
        message,
    }
}

/// Least-squares slope of `values` against their indices.
fn linear_slope(values: &[f64]) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, v) in values.iter().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let dx = i as f64 - mean_x;
        numerator += dx * (v - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Pearson correlation coefficient; `None` when either series is constant.
fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n_f = n as f64;
    let mean_a = a[..n].iter().sum::<f64>() / n_f;
    let mean_b = b[..n].iter().sum::<f64>() / n_f;
    let mut covariance = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        covariance += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denominator = (var_a * var_b).sqrt();
    if denominator == 0.0 {
        None
    } else {
        Some(covariance / denominator)
    }
}

fn slice_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    values.iter().sum::<f64>() / n
}
