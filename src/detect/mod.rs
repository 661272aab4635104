//! Anomaly detection: rolling baselines plus layered strategies.
//!
//! [`MetricBaseline`] keeps per-metric sample windows with derived
//! statistics; [`AnomalyDetector`] runs threshold, outlier, spike/drop,
//! trend, memory-leak and correlation checks over them and deduplicates
//! what fires.
//!
//! # Example
//!
//! ```
//! use vigil::config::DetectorConfig;
//! use vigil::detect::{AnomalyDetector, AnomalyKind};
//!
//! let detector = AnomalyDetector::new(DetectorConfig::default());
//! detector.observe("request_latency_ms", 12.0);
//! let found = detector.observe("request_latency_ms", 480.0);
//! assert_eq!(found[0].kind, AnomalyKind::Spike);
//! ```

mod baseline;
mod detector;

pub use baseline::MetricBaseline;
pub use detector::{
    Anomaly, AnomalyDetector, AnomalyKind, Severity, CPU_SATURATION_LIMIT,
    DISK_EXHAUSTION_LIMIT, MEMORY_EXHAUSTION_LIMIT,
};
