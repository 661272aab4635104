//! Runtime orchestration.
//!
//! [`Vigil`] owns every component — sampler, detector, healer, watchdog
//! and the alert pipeline — plus named registries of circuit breakers,
//! rate limiters and health checks. [`Vigil::start`] spawns the periodic
//! loops; [`Vigil::stop`] winds them down under a bounded grace period.
//! There is no global instance: each `Vigil` is explicitly constructed
//! and owned, so tests can run several side by side.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use vigil::config::MonitorConfig;
//! use vigil::runtime::Vigil;
//!
//! let vigil = Vigil::new(MonitorConfig::default());
//!
//! // Named registries create on first use and return shared handles.
//! let api = vigil.breaker("api");
//! assert!(Arc::ptr_eq(&api, &vigil.breaker("api")));
//!
//! vigil.record_metric("queue_depth", 17.0);
//!
//! let status = vigil.status();
//! assert!(!status.running);
//! assert!(status.breakers.contains_key("api"));
//! ```

mod monitor;

pub use monitor::{MonitorStatus, Vigil};
