//! Alerting pipeline: deduplicated records fanned out to channels.
//!
//! [`AlertManager`] is the synchronous front door: raising an alert
//! records it, runs callbacks and queues it for the background
//! dispatch worker, which delivers to every registered
//! [`AlertChannel`](crate::traits::AlertChannel). Identical alerts
//! inside the cooldown window are suppressed and aggregated rather
//! than dispatched again.
//!
//! # Example
//!
//! ```
//! use vigil::alerts::{AlertLevel, AlertManager};
//! use vigil::config::AlertConfig;
//!
//! let manager = AlertManager::new(AlertConfig::default());
//! let alert = manager
//!     .alert(AlertLevel::Warning, "High CPU usage")
//!     .message("cpu at 93.0%")
//!     .source("vigil.runtime")
//!     .meta("cpu_percent", 93.0)
//!     .send()
//!     .unwrap();
//! assert_eq!(alert.count, 1);
//!
//! // An identical alert inside the cooldown is suppressed
//! assert!(manager
//!     .raise_alert(AlertLevel::Warning, "High CPU usage", "again", "vigil.runtime")
//!     .is_none());
//! ```

mod channels;
mod manager;

pub use channels::{LogChannel, SlackChannel, WebhookChannel};
pub use manager::{
    Alert, AlertAggregate, AlertDraft, AlertLevel, AlertManager, AlertQuery, AlertStats,
};
