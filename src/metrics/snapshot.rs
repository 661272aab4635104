//! Immutable snapshot types produced by the sampler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric names fed into anomaly baselines on every sample.
pub const MONITORED_METRICS: [&str; 5] = [
    "cpu_percent",
    "memory_percent",
    "disk_percent",
    "network_bytes_sent",
    "network_bytes_recv",
];

/// Per-process readings embedded in a [`MetricSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessSnapshot {
    /// Process id.
    pub pid: u32,
    /// Process CPU usage in percent (may exceed 100 on multicore hosts).
    pub cpu_percent: f64,
    /// Resident set size in bytes.
    pub memory_rss: u64,
    /// Virtual memory size in bytes.
    pub memory_vms: u64,
    /// OS threads owned by the process, 0 where unsupported.
    pub thread_count: usize,
}

/// One timestamped bundle of scalar system readings.
///
/// Produced once per sampling tick and never mutated afterwards. Fields a
/// collector could not read are left at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Collection time.
    pub timestamp: DateTime<Utc>,
    /// System-wide CPU usage in percent.
    pub cpu_percent: f64,
    /// System-wide memory usage in percent.
    pub memory_percent: f64,
    /// Aggregate disk usage in percent across mounted disks.
    pub disk_percent: f64,
    /// Swap usage in percent.
    pub swap_percent: f64,
    /// Cumulative bytes sent over all interfaces.
    pub network_bytes_sent: u64,
    /// Cumulative bytes received over all interfaces.
    pub network_bytes_recv: u64,
    /// 1-minute load average (0 on unsupported platforms).
    pub load_average_1m: f64,
    /// 5-minute load average.
    pub load_average_5m: f64,
    /// 15-minute load average.
    pub load_average_15m: f64,
    /// Per-process sub-record; `None` when process metrics are disabled.
    pub process: Option<ProcessSnapshot>,
}

impl Default for MetricSnapshot {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            swap_percent: 0.0,
            network_bytes_sent: 0,
            network_bytes_recv: 0,
            load_average_1m: 0.0,
            load_average_5m: 0.0,
            load_average_15m: 0.0,
            process: None,
        }
    }
}

impl MetricSnapshot {
    /// Build a snapshot carrying only the three core gauges.
    ///
    /// Intended for tests and benchmarks that drive the detector with
    /// synthetic data.
    #[must_use]
    pub fn with_core(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            disk_percent,
            ..Self::default()
        }
    }

    /// Look up a gauge by its metric name.
    ///
    /// Returns `None` for unknown names. Cumulative counters are exposed as
    /// `f64` so they can share the rate and baseline paths.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn gauge(&self, name: &str) -> Option<f64> {
        match name {
            "cpu_percent" => Some(self.cpu_percent),
            "memory_percent" => Some(self.memory_percent),
            "disk_percent" => Some(self.disk_percent),
            "swap_percent" => Some(self.swap_percent),
            "network_bytes_sent" => Some(self.network_bytes_sent as f64),
            "network_bytes_recv" => Some(self.network_bytes_recv as f64),
            "load_average_1m" => Some(self.load_average_1m),
            "load_average_5m" => Some(self.load_average_5m),
            "load_average_15m" => Some(self.load_average_15m),
            "process_cpu_percent" => self.process.map(|p| p.cpu_percent),
            "process_memory_rss" => self.process.map(|p| p.memory_rss as f64),
            "process_thread_count" => self.process.map(|p| p.thread_count as f64),
            _ => None,
        }
    }

    /// Iterate the monitored gauges fed into anomaly baselines.
    pub fn monitored_gauges(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        MONITORED_METRICS
            .iter()
            .filter_map(|name| self.gauge(name).map(|value| (*name, value)))
    }

    /// Whether every core gauge is below the given thresholds.
    #[must_use]
    pub fn is_healthy(&self, cpu_threshold: f64, memory_threshold: f64, disk_threshold: f64) -> bool {
        self.cpu_percent < cpu_threshold
            && self.memory_percent < memory_threshold
            && self.disk_percent < disk_threshold
    }
}
