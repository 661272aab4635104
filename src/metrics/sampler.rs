//! Periodic metrics collection over OS and process counters.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, Pid, System};

use crate::config::SamplerConfig;
use crate::metrics::snapshot::{MetricSnapshot, ProcessSnapshot};

/// Summary statistics over the retained window of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAggregate {
    /// The metric name.
    pub metric: String,
    /// Number of samples in the window.
    pub count: usize,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Sample standard deviation (n − 1).
    pub std_dev: f64,
    /// 50th percentile.
    pub p50: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 99th percentile.
    pub p99: f64,
}

impl MetricAggregate {
    /// Compute aggregate statistics over a slice of samples.
    ///
    /// Returns `None` for an empty slice.
    #[must_use]
    pub fn from_values(metric: impl Into<String>, values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let sum: f64 = values.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        let mean = sum / count as f64;

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in values {
            min = min.min(v);
            max = max.max(v);
        }

        let std_dev = if count > 1 {
            #[allow(clippy::cast_precision_loss)]
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let percentile = |p: usize| -> f64 {
            let idx = (p * count / 100).min(count - 1);
            sorted[idx]
        };

        Some(Self {
            metric: metric.into(),
            count,
            min,
            max,
            mean,
            std_dev,
            p50: percentile(50),
            p90: percentile(90),
            p99: percentile(99),
        })
    }
}

/// Periodic system/process metrics collector.
///
/// One [`MetricsSampler::collect`] call produces one [`MetricSnapshot`],
/// appends it to a bounded ring buffer and leaves any counter the OS would
/// not report at zero. Host applications may record their own gauges with
/// [`MetricsSampler::record_metric`]; those share the history bound and the
/// rate/aggregate query paths.
pub struct MetricsSampler {
    config: SamplerConfig,
    pid: Option<Pid>,
    system: Mutex<System>,
    disks: Mutex<Disks>,
    networks: Mutex<Networks>,
    history: RwLock<VecDeque<MetricSnapshot>>,
    custom: RwLock<HashMap<String, VecDeque<(DateTime<Utc>, f64)>>>,
}

impl MetricsSampler {
    /// Create a sampler and prime the CPU counters.
    ///
    /// The first snapshot after construction may still read zero CPU; usage
    /// needs two refreshes spaced apart to be meaningful.
    #[must_use]
    pub fn new(config: SamplerConfig) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::warn!("cannot resolve own pid; process metrics disabled");
        }

        Self {
            config,
            pid,
            system: Mutex::new(system),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
            history: RwLock::new(VecDeque::new()),
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// Collect one snapshot and append it to history.
    ///
    /// Each counter group is refreshed independently; a group that cannot
    /// be read leaves its fields at zero and collection continues.
    pub fn collect(&self) -> MetricSnapshot {
        let mut snapshot = MetricSnapshot::default();

        {
            let mut system = match self.system.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    tracing::error!("system counters lock poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            system.refresh_cpu();
            system.refresh_memory();

            snapshot.cpu_percent = f64::from(system.global_cpu_info().cpu_usage());

            let total_memory = system.total_memory();
            if total_memory > 0 {
                #[allow(clippy::cast_precision_loss)]
                {
                    snapshot.memory_percent =
                        system.used_memory() as f64 / total_memory as f64 * 100.0;
                }
            }
            let total_swap = system.total_swap();
            if total_swap > 0 {
                #[allow(clippy::cast_precision_loss)]
                {
                    snapshot.swap_percent = system.used_swap() as f64 / total_swap as f64 * 100.0;
                }
            }

            if self.config.include_process_metrics {
                if let Some(pid) = self.pid {
                    system.refresh_process(pid);
                    snapshot.process = system.process(pid).map(|process| ProcessSnapshot {
                        pid: pid.as_u32(),
                        cpu_percent: f64::from(process.cpu_usage()),
                        memory_rss: process.memory(),
                        memory_vms: process.virtual_memory(),
                        thread_count: process_thread_count(process),
                    });
                    if snapshot.process.is_none() {
                        tracing::debug!(pid = pid.as_u32(), "own process not reported by the OS");
                    }
                }
            }
        }

        {
            let mut disks = match self.disks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    tracing::error!("disk counters lock poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            disks.refresh();
            let mut total: u64 = 0;
            let mut available: u64 = 0;
            for disk in disks.list() {
                total = total.saturating_add(disk.total_space());
                available = available.saturating_add(disk.available_space());
            }
            if total > 0 {
                #[allow(clippy::cast_precision_loss)]
                {
                    snapshot.disk_percent =
                        (total - available.min(total)) as f64 / total as f64 * 100.0;
                }
            }
        }

        {
            let mut networks = match self.networks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    tracing::error!("network counters lock poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            networks.refresh();
            for (_name, data) in networks.iter() {
                snapshot.network_bytes_sent = snapshot
                    .network_bytes_sent
                    .saturating_add(data.total_transmitted());
                snapshot.network_bytes_recv = snapshot
                    .network_bytes_recv
                    .saturating_add(data.total_received());
            }
        }

        let load = System::load_average();
        snapshot.load_average_1m = load.one;
        snapshot.load_average_5m = load.five;
        snapshot.load_average_15m = load.fifteen;

        self.store(snapshot.clone());
        tracing::debug!(
            cpu = snapshot.cpu_percent,
            memory = snapshot.memory_percent,
            disk = snapshot.disk_percent,
            "metrics snapshot collected"
        );
        snapshot
    }

    /// The most recent snapshot, if any was collected.
    #[must_use]
    pub fn latest(&self) -> Option<MetricSnapshot> {
        let history = match self.history.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("history lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        history.back().cloned()
    }

    /// The last `count` snapshots in collection order; all when `None`.
    #[must_use]
    pub fn history(&self, count: Option<usize>) -> Vec<MetricSnapshot> {
        let history = match self.history.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("history lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let take = count.unwrap_or(history.len()).min(history.len());
        history.iter().skip(history.len() - take).cloned().collect()
    }

    /// Number of retained snapshots.
    #[must_use]
    pub fn history_len(&self) -> usize {
        let history = match self.history.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.len()
    }

    /// Drop all retained snapshots and custom series.
    pub fn clear_history(&self) {
        let mut history = match self.history.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("history lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        history.clear();
        drop(history);

        let mut custom = match self.custom.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        custom.clear();
    }

    /// Record a host-defined gauge sample.
    pub fn record_metric(&self, name: impl Into<String>, value: f64) {
        let mut custom = match self.custom.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("custom metrics lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let series = custom.entry(name.into()).or_default();
        series.push_back((Utc::now(), value));
        while series.len() > self.config.history_size {
            series.pop_front();
        }
    }

    /// Most recent value of a host-defined gauge.
    #[must_use]
    pub fn custom_latest(&self, name: &str) -> Option<f64> {
        let custom = match self.custom.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        custom.get(name).and_then(|s| s.back()).map(|(_, v)| *v)
    }

    /// Δvalue/Δtime between the two most recent samples of a metric.
    ///
    /// Works for snapshot gauges and custom series alike. Returns 0.0 when
    /// fewer than two samples exist or the samples are not time-ordered.
    #[must_use]
    pub fn rate(&self, name: &str) -> f64 {
        {
            let history = match self.history.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if history.len() >= 2 {
                if let (Some(prev), Some(cur)) =
                    (history.get(history.len() - 2), history.back())
                {
                    if let (Some(prev_value), Some(cur_value)) =
                        (prev.gauge(name), cur.gauge(name))
                    {
                        return rate_between(
                            prev.timestamp,
                            prev_value,
                            cur.timestamp,
                            cur_value,
                        );
                    }
                }
            }
        }

        let custom = match self.custom.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        custom.get(name).map_or(0.0, |series| {
            if series.len() < 2 {
                return 0.0;
            }
            let (prev_ts, prev_value) = series[series.len() - 2];
            let (cur_ts, cur_value) = series[series.len() - 1];
            rate_between(prev_ts, prev_value, cur_ts, cur_value)
        })
    }

    /// Aggregate statistics for a metric over the retained window.
    #[must_use]
    pub fn aggregate(&self, name: &str) -> Option<MetricAggregate> {
        let values: Vec<f64> = {
            let history = match self.history.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            history.iter().filter_map(|s| s.gauge(name)).collect()
        };
        if !values.is_empty() {
            return MetricAggregate::from_values(name, &values);
        }

        let custom = match self.custom.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let series = custom.get(name)?;
        let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
        MetricAggregate::from_values(name, &values)
    }

    fn store(&self, snapshot: MetricSnapshot) {
        let mut history = match self.history.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("history lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        history.push_back(snapshot);
        while history.len() > self.config.history_size.max(1) {
            history.pop_front();
        }
    }
}

impl std::fmt::Debug for MetricsSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsSampler")
            .field("pid", &self.pid)
            .field("history_len", &self.history_len())
            .finish_non_exhaustive()
    }
}

/// Lightweight read of the current process: (rss MB, thread count).
///
/// Used by the healer to record before/after figures without holding a
/// reference to the sampler.
#[must_use]
pub fn current_process_stats() -> (f64, usize) {
    let mut system = System::new();
    if let Ok(pid) = sysinfo::get_current_pid() {
        system.refresh_process(pid);
        if let Some(process) = system.process(pid) {
            #[allow(clippy::cast_precision_loss)]
            let rss_mb = process.memory() as f64 / (1024.0 * 1024.0);
            return (rss_mb, process_thread_count(process));
        }
    }
    (0.0, 0)
}

#[cfg(target_os = "linux")]
fn process_thread_count(process: &sysinfo::Process) -> usize {
    process.tasks().map_or(0, std::collections::HashSet::len)
}

#[cfg(not(target_os = "linux"))]
fn process_thread_count(_process: &sysinfo::Process) -> usize {
    0
}

fn rate_between(
    prev_ts: DateTime<Utc>,
    prev_value: f64,
    cur_ts: DateTime<Utc>,
    cur_value: f64,
) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let delta_secs = (cur_ts - prev_ts).num_milliseconds() as f64 / 1000.0;
    if delta_secs <= 0.0 {
        return 0.0;
    }
    (cur_value - prev_value) / delta_secs
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    fn small_sampler(history_size: usize) -> MetricsSampler {
        let config = SamplerConfig {
            history_size,
            ..SamplerConfig::default()
        };
        MetricsSampler::new(config)
    }

    fn snapshot_at(offset_secs: i64, cpu: f64, sent: u64) -> MetricSnapshot {
        let mut snap = MetricSnapshot::with_core(cpu, 50.0, 50.0);
        snap.timestamp = Utc::now() + ChronoDuration::seconds(offset_secs);
        snap.network_bytes_sent = sent;
        snap
    }

    #[test]
    fn test_collect_produces_snapshot() {
        let sampler = small_sampler(10);
        let snapshot = sampler.collect();

        assert!(snapshot.cpu_percent >= 0.0);
        assert!(snapshot.memory_percent >= 0.0);
        assert!(snapshot.memory_percent <= 100.0);
        assert!(snapshot.disk_percent >= 0.0);
        assert!(snapshot.disk_percent <= 100.0);
        assert_eq!(sampler.history_len(), 1);
        assert_eq!(sampler.latest(), Some(snapshot));
    }

    #[test]
    fn test_collect_includes_process_record() {
        let sampler = small_sampler(10);
        let snapshot = sampler.collect();
        let process = snapshot.process.expect("process record");
        assert_eq!(process.pid, std::process::id());
        assert!(process.memory_rss > 0);
    }

    #[test]
    fn test_process_metrics_can_be_disabled() {
        let config = SamplerConfig {
            include_process_metrics: false,
            ..SamplerConfig::default()
        };
        let sampler = MetricsSampler::new(config);
        assert!(sampler.collect().process.is_none());
    }

    #[test]
    fn test_history_bounded() {
        let sampler = small_sampler(3);
        for i in 0..5 {
            sampler.store(snapshot_at(i, f64::from(i as i32), 0));
        }
        assert_eq!(sampler.history_len(), 3);
        // Oldest two evicted, values 2..=4 remain
        let history = sampler.history(None);
        assert_eq!(history[0].cpu_percent, 2.0);
        assert_eq!(history[2].cpu_percent, 4.0);
    }

    #[test]
    fn test_history_takes_most_recent() {
        let sampler = small_sampler(10);
        for i in 0..5 {
            sampler.store(snapshot_at(i, i as f64, 0));
        }
        let last_two = sampler.history(Some(2));
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].cpu_percent, 3.0);
        assert_eq!(last_two[1].cpu_percent, 4.0);

        let all = sampler.history(None);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_latest_empty() {
        let sampler = small_sampler(10);
        assert!(sampler.latest().is_none());
    }

    #[test]
    fn test_rate_over_snapshots() {
        let sampler = small_sampler(10);
        sampler.store(snapshot_at(0, 10.0, 1000));
        sampler.store(snapshot_at(2, 20.0, 5000));

        assert_eq!(sampler.rate("network_bytes_sent"), 2000.0);
        assert_eq!(sampler.rate("cpu_percent"), 5.0);
    }

    #[test]
    fn test_rate_requires_two_samples() {
        let sampler = small_sampler(10);
        assert_eq!(sampler.rate("cpu_percent"), 0.0);
        sampler.store(snapshot_at(0, 10.0, 0));
        assert_eq!(sampler.rate("cpu_percent"), 0.0);
    }

    #[test]
    fn test_rate_zero_time_delta() {
        let sampler = small_sampler(10);
        let snap = snapshot_at(0, 10.0, 100);
        let mut second = snap.clone();
        second.cpu_percent = 90.0;
        sampler.store(snap);
        sampler.store(second);
        assert_eq!(sampler.rate("cpu_percent"), 0.0);
    }

    #[test]
    fn test_rate_unknown_metric() {
        let sampler = small_sampler(10);
        sampler.store(snapshot_at(0, 10.0, 0));
        sampler.store(snapshot_at(1, 20.0, 0));
        assert_eq!(sampler.rate("no_such_metric"), 0.0);
    }

    #[test]
    fn test_custom_metric_recording_and_rate() {
        let sampler = small_sampler(10);
        sampler.record_metric("queue_depth", 5.0);
        assert_eq!(sampler.custom_latest("queue_depth"), Some(5.0));
        assert_eq!(sampler.rate("queue_depth"), 0.0);

        sampler.record_metric("queue_depth", 9.0);
        assert_eq!(sampler.custom_latest("queue_depth"), Some(9.0));
        // Two samples recorded back to back: rate may be huge or zero
        // depending on timer resolution, but must not be negative.
        assert!(sampler.rate("queue_depth") >= 0.0);
    }

    #[test]
    fn test_custom_series_bounded() {
        let sampler = small_sampler(3);
        for i in 0..10 {
            sampler.record_metric("tick", f64::from(i));
        }
        assert_eq!(sampler.custom_latest("tick"), Some(9.0));
        let aggregate = sampler.aggregate("tick").expect("aggregate");
        assert_eq!(aggregate.count, 3);
        assert_eq!(aggregate.min, 7.0);
    }

    #[test]
    fn test_aggregate_over_history() {
        let sampler = small_sampler(10);
        for (i, cpu) in [10.0, 20.0, 30.0, 40.0].iter().enumerate() {
            sampler.store(snapshot_at(i as i64, *cpu, 0));
        }
        let aggregate = sampler.aggregate("cpu_percent").expect("aggregate");
        assert_eq!(aggregate.count, 4);
        assert_eq!(aggregate.min, 10.0);
        assert_eq!(aggregate.max, 40.0);
        assert_eq!(aggregate.mean, 25.0);
        assert!((aggregate.std_dev - 12.909_944).abs() < 1e-5);
    }

    #[test]
    fn test_aggregate_unknown_metric() {
        let sampler = small_sampler(10);
        sampler.store(snapshot_at(0, 10.0, 0));
        assert!(sampler.aggregate("no_such_metric").is_none());
    }

    #[test]
    fn test_clear_history() {
        let sampler = small_sampler(10);
        sampler.store(snapshot_at(0, 10.0, 0));
        sampler.record_metric("queue_depth", 1.0);
        sampler.clear_history();
        assert_eq!(sampler.history_len(), 0);
        assert!(sampler.custom_latest("queue_depth").is_none());
    }

    #[test]
    fn test_aggregate_percentiles() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let aggregate = MetricAggregate::from_values("m", &values).expect("aggregate");
        assert_eq!(aggregate.p50, 51.0);
        assert_eq!(aggregate.p90, 91.0);
        assert_eq!(aggregate.p99, 100.0);
    }

    #[test]
    fn test_aggregate_single_value() {
        let aggregate = MetricAggregate::from_values("m", &[42.0]).expect("aggregate");
        assert_eq!(aggregate.count, 1);
        assert_eq!(aggregate.std_dev, 0.0);
        assert_eq!(aggregate.p50, 42.0);
        assert_eq!(aggregate.p99, 42.0);
    }

    #[test]
    fn test_aggregate_empty() {
        assert!(MetricAggregate::from_values("m", &[]).is_none());
    }

    #[test]
    fn test_current_process_stats() {
        let (rss_mb, _threads) = current_process_stats();
        assert!(rss_mb > 0.0);
    }
}
