//! Automatic corrective actions for anomalies and resource pressure.
//!
//! [`AutoHealer`] maps anomaly kinds to ordered action lists through a
//! policy table and executes them with per-key cooldowns and attempt
//! budgets. Actions act only on what the host registered: memory
//! hooks, caches, pools, temp directories and custom handlers. Direct
//! pressure handlers bypass the anomaly pipeline for threshold-driven
//! relief.
//!
//! # Example
//!
//! ```
//! use vigil::config::HealerConfig;
//! use vigil::heal::{AutoHealer, HealOutcome};
//!
//! let healer = AutoHealer::new(HealerConfig::default());
//! healer.register_memory_hook("drop_buffers", || { /* reclaim */ });
//!
//! let records = healer.handle_memory_pressure(92.0);
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].outcome, HealOutcome::Success);
//! ```

mod healer;

pub use healer::{
    AutoHealer, HealActionKind, HealOutcome, HealPolicy, HealRecord, HealerStats,
    CPU_PRESSURE_LIMIT, FULL_RELIEF_LIMIT, HOOK_RELIEF_LIMIT,
};
