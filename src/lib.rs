//! Vigil
//!
//! A self-protecting runtime for long-running applications: metrics
//! sampling, statistical anomaly detection, circuit breakers, rate
//! limiting, automatic healing, a process watchdog and a deduplicating
//! alert pipeline, orchestrated by a single explicitly-owned
//! [`Vigil`](runtime::Vigil) instance.
//!
//! # Features
//!
//! - System and process metrics sampling (`sysinfo`) with bounded history
//! - Six anomaly detection strategies over rolling per-metric baselines
//! - Named circuit breakers and token-bucket rate limiters for admission
//!   control
//! - Automatic healing actions selected by anomaly kind and by
//!   memory/CPU pressure
//! - Process watchdog: heartbeats, task census, deadlock heuristic,
//!   bounded recovery
//! - Cooldown-deduplicated alerts with queued dispatch to pluggable
//!   channels
//!
//! # Quick Start
//!
//! ```no_run
//! use vigil::{MonitorConfig, Vigil};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let vigil = Vigil::new(MonitorConfig::from_env()?);
//!     vigil.start()?;
//!
//!     // Application work; signal liveness from the main loop.
//!     vigil.heartbeat();
//!
//!     vigil.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── Vigil runtime ─────────────────────────┐
//! │ sampling loop ──▶ MetricsSampler ──▶ snapshots ──┐             │
//! │ detection loop ─▶ AnomalyDetector ─▶ anomalies ─▶ AutoHealer   │
//! │ health loop ────▶ registered HealthChecks        │             │
//! │ watchdog loop ──▶ ProcessWatchdog ───────────────┤             │
//! │                                                  ▼             │
//! │ caller code ──▶ breakers / limiters ──▶ AlertManager ──▶ log,  │
//! │                 (admission control)              webhook, chat │
//! └────────────────────────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod alerts;
pub mod config;
pub mod detect;
pub mod error;
pub mod heal;
pub mod metrics;
pub mod protect;
pub mod runtime;
pub mod traits;
pub mod watchdog;

pub use alerts::{Alert, AlertLevel};
pub use config::MonitorConfig;
pub use detect::{Anomaly, AnomalyKind, Severity};
pub use error::{MonitorError, ProtectError, RuntimeError};
pub use runtime::{MonitorStatus, Vigil};
