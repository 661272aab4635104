//! System and process metrics collection.
//!
//! This module provides:
//! - [`MetricSnapshot`]: one immutable, timestamped bundle of scalar readings
//! - [`MetricsSampler`]: periodic collector with bounded history, per-metric
//!   aggregates and rate-of-change queries
//!
//! Collection is partial-failure tolerant: a counter the OS refuses to
//! report stays at its zero value and the snapshot is still produced.
//!
//! # Example
//!
//! ```
//! use vigil::config::SamplerConfig;
//! use vigil::metrics::MetricsSampler;
//!
//! let sampler = MetricsSampler::new(SamplerConfig::default());
//! let snapshot = sampler.collect();
//! assert!(snapshot.cpu_percent >= 0.0);
//! ```

mod sampler;
mod snapshot;

pub use sampler::{current_process_stats, MetricAggregate, MetricsSampler};
pub use snapshot::{MetricSnapshot, ProcessSnapshot, MONITORED_METRICS};
