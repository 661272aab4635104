//! Process liveness supervision.
//!
//! [`ProcessWatchdog`] tracks a heartbeat deadline for the host's main
//! loop, a census of watched tasks, a process thread-count high-water
//! mark and a stalled-set deadlock heuristic. Findings become bounded
//! [`WatchdogEvent`]s, alert the attached manager, and drive the
//! assessed [`ProcessState`] with a capped, spaced recovery budget.
//!
//! # Example
//!
//! ```
//! use vigil::config::WatchdogConfig;
//! use vigil::watchdog::{ProcessState, ProcessWatchdog};
//!
//! let watchdog = ProcessWatchdog::new(WatchdogConfig::default());
//! watchdog.heartbeat();
//! assert_eq!(watchdog.check(), ProcessState::Healthy);
//!
//! // Long-lived tasks report their own liveness
//! let pulse = watchdog.watch("ingest-loop", false);
//! pulse.beat();
//! pulse.finish();
//! ```

mod process;

pub use process::{
    ProcessState, ProcessWatchdog, TaskPulse, WatchdogEvent, WatchdogEventKind, WatchdogStats,
    DEADLOCK_MIN_TASKS, THREAD_LEAK_LIMIT,
};
