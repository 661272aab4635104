//! Trait definitions for pluggable and mockable collaborators.
//!
//! This module defines the seams other components depend on:
//! - [`Clock`]: monotonic time abstraction so cooldown and refill logic is
//!   testable without real sleeps
//! - [`AlertChannel`]: external alert sink (webhook, chat, log, email)
//! - [`HealthCheck`]: named liveness probe run by the health loop
//! - [`Clearable`]: cache-like collaborator the healer can clear
//! - [`Resettable`]: pool-like collaborator the healer can reset
//! - [`TaskInterrupt`]: best-effort cancel signal for a unit of work;
//!   implementations may legitimately no-op on platforms without support
//!
//! # Example
//!
//! ```
//! use vigil::traits::{Clock, ManualClock};
//! use std::time::Duration;
//!
//! let clock = ManualClock::new();
//! let before = clock.now();
//! clock.advance(Duration::from_secs(30));
//! assert_eq!(clock.now() - before, Duration::from_secs(30));
//! ```

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::alerts::Alert;
use crate::error::AlertError;

/// Monotonic time source.
///
/// Breakers, limiters and dedup windows read time through this trait so
/// tests can drive cooldowns deterministically with [`ManualClock`].
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;
}

/// Production clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Starts at an arbitrary base instant; [`ManualClock::advance`] moves it
/// forward. Never goes backwards.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock positioned at an arbitrary base instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut offset = match self.offset.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *offset += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = match self.offset.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.base + *offset
    }
}

/// External alert sink.
///
/// Delivery is best-effort: the dispatch worker logs and swallows errors,
/// so implementations should not retry internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Channel name recorded in the alert's `sent_to` list.
    fn name(&self) -> &str;

    /// Deliver one alert.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError`] when delivery fails; the caller swallows it.
    async fn deliver(&self, alert: Alert) -> Result<(), AlertError>;
}

/// Named liveness probe.
///
/// Implemented for any `Fn() -> bool` closure; implement the trait directly
/// when the probe needs to await.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Run the probe. `false` (or a timeout, enforced by the caller)
    /// means unhealthy.
    async fn check(&self) -> bool;
}

#[async_trait]
impl<F> HealthCheck for F
where
    F: Fn() -> bool + Send + Sync,
{
    async fn check(&self) -> bool {
        self()
    }
}

/// Cache-like collaborator the auto-healer can clear.
pub trait Clearable: Send + Sync {
    /// Drop cached entries, returning how many were released.
    fn clear(&self) -> u64;
}

/// Pool-like collaborator the auto-healer can reset.
pub trait Resettable: Send + Sync {
    /// Tear down and rebuild pooled resources.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the reset fails; the healer
    /// records it on the action outcome.
    fn reset(&self) -> Result<(), String>;
}

/// Best-effort cancel signal for a named unit of work.
///
/// Platforms or task models without an interrupt primitive should return
/// `false` rather than block; the watchdog then records the recovery
/// attempt as detect-and-report only.
pub trait TaskInterrupt: Send + Sync {
    /// Request cancellation of the named task. Returns whether a signal
    /// was actually delivered.
    fn interrupt(&self, task_name: &str) -> bool;
}

/// Interrupt capability that always declines.
///
/// The default wiring on platforms without async cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInterrupt;

impl TaskInterrupt for NoopInterrupt {
    fn interrupt(&self, _task_name: &str) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(SystemClock: Send, Sync, Clone, Copy, Default);
    assert_impl_all!(ManualClock: Send, Sync);
    assert_impl_all!(NoopInterrupt: Send, Sync, Clone, Copy, Default);

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_starts_at_base() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.now() - start, Duration::from_secs(10));
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now() - start, Duration::from_millis(10_500));
    }

    #[test]
    fn test_mock_clock() {
        let base = Instant::now();
        let mut mock = MockClock::new();
        mock.expect_now().return_const(base);
        assert_eq!(mock.now(), base);
    }

    #[test]
    fn test_closure_health_check() {
        let healthy = || true;
        let unhealthy = || false;
        assert!(tokio_test::block_on(healthy.check()));
        assert!(!tokio_test::block_on(unhealthy.check()));
    }

    #[test]
    fn test_noop_interrupt_declines() {
        assert!(!NoopInterrupt.interrupt("worker-1"));
    }

    #[tokio::test]
    async fn test_mock_alert_channel() {
        use crate::alerts::AlertLevel;

        let mut mock = MockAlertChannel::new();
        mock.expect_name().return_const("mock".to_string());
        mock.expect_deliver().returning(|_| Ok(()));

        let alert = Alert {
            id: "abc123def456".to_string(),
            level: AlertLevel::Info,
            title: "Test".to_string(),
            message: "message".to_string(),
            source: "vigil.test".to_string(),
            timestamp: chrono::Utc::now(),
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            count: 1,
            sent_to: Vec::new(),
        };
        assert_eq!(mock.name(), "mock");
        assert!(mock.deliver(alert).await.is_ok());
    }
}
