//! End-to-end tests across the vigil pipeline.
//!
//! These exercise the externally observable contracts against real time
//! and the real system clock:
//! - circuit breaker lifecycle: open on failures, half-open after the
//!   cooldown, close on a successful probe
//! - token bucket admission: exact burst, refill at the configured rate
//! - anomaly detection over realistic gauge series
//! - alert suppression and aggregation of repeats
//! - auto-healing escalation order
//! - the orchestrated runtime from start to stop

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;

use vigil::alerts::{AlertLevel, AlertManager, AlertQuery};
use vigil::config::{
    AlertConfig, BreakerConfig, DetectorConfig, HealerConfig, LimiterConfig, MonitorConfig,
};
use vigil::detect::{Anomaly, AnomalyDetector, AnomalyKind, Severity};
use vigil::error::ProtectError;
use vigil::heal::{AutoHealer, HealActionKind, HealOutcome};
use vigil::metrics::MetricSnapshot;
use vigil::protect::{CallError, CircuitBreaker, CircuitState, RateLimiter};
use vigil::traits::Clearable;
use vigil::Vigil;

// ============================================================
// Helpers
// ============================================================

/// Cache stub that counts how often it was cleared.
#[derive(Default)]
struct CountingCache {
    clears: AtomicU64,
}

impl Clearable for CountingCache {
    fn clear(&self) -> u64 {
        self.clears.fetch_add(1, Ordering::SeqCst);
        128
    }
}

fn leak_anomaly() -> Anomaly {
    Anomaly {
        timestamp: Utc::now(),
        kind: AnomalyKind::MemoryLeak,
        metric: "memory_percent".to_string(),
        severity: Severity::High,
        value: 91.0,
        expected: 62.0,
        deviation: 0.9,
        message: "memory climbing across the trailing window".to_string(),
    }
}

// ============================================================
// Circuit breaker lifecycle against real time
// ============================================================

#[tokio::test]
async fn test_breaker_opens_after_failures_then_recovers() {
    let breaker = CircuitBreaker::new(
        "payments",
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            cooldown_secs: 0.5,
            half_open_max_calls: 2,
        },
    );

    for attempt in 0..3 {
        let result: Result<(), CallError<&str>> =
            breaker.call(async { Err("upstream down") }).await;
        assert!(result.is_err(), "failing call {attempt} should surface its error");
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // While open, admission fails fast without running anything.
    match breaker.try_acquire() {
        Err(ProtectError::CircuitOpen { name, retry_after }) => {
            assert_eq!(name, "payments");
            assert!(retry_after <= Duration::from_millis(500));
        }
        other => panic!("expected an open-circuit rejection, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(650)).await;

    // The cooldown elapsed: the breaker reads half-open and admits probes.
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    let result: Result<&str, CallError<&str>> = breaker.call(async { Ok("recovered") }).await;
    assert_eq!(result.expect("probe call should be admitted"), "recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);

    let stats = breaker.stats();
    assert_eq!(stats.total_failures, 3);
    assert_eq!(stats.total_successes, 1);
    assert_eq!(stats.total_rejections, 1);
    assert_eq!(stats.consecutive_failures, 0);
}

// ============================================================
// Rate limiter admission and refill timing
// ============================================================

#[tokio::test]
async fn test_limiter_admits_exact_burst_then_refills() {
    let limiter = RateLimiter::new(
        "api",
        LimiterConfig {
            rate_per_sec: 5.0,
            burst_size: 5.0,
            per_client: false,
            ..LimiterConfig::default()
        },
    );

    for request in 0..5 {
        assert!(
            limiter.allow(None),
            "request {request} within the burst should be admitted"
        );
    }
    assert!(!limiter.allow(None), "the burst is spent, the next request must wait");

    // At 5 tokens/s one token is back after 200ms.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(limiter.allow(None), "one token should have refilled");
    assert!(!limiter.allow(None), "only one token should have refilled");

    let stats = limiter.stats();
    assert_eq!(stats.total_allowed, 6);
    assert_eq!(stats.total_rejected, 2);
    assert_eq!(stats.rejected_global, 2);
}

// ============================================================
// Anomaly detection over gauge series
// ============================================================

#[test]
fn test_detector_stays_quiet_on_steady_metrics() {
    let detector = AnomalyDetector::new(DetectorConfig {
        min_samples: 30,
        ..DetectorConfig::default()
    });

    for _ in 0..50 {
        let found = detector.detect(&MetricSnapshot::with_core(50.0, 40.0, 30.0));
        assert!(found.is_empty(), "steady gauges should not raise anomalies: {found:?}");
    }
    assert_eq!(detector.recent_count(), 0);
}

#[test]
fn test_detector_flags_cpu_surge_after_stable_baseline() {
    let detector = AnomalyDetector::new(DetectorConfig {
        min_samples: 30,
        ..DetectorConfig::default()
    });

    for _ in 0..50 {
        detector.detect(&MetricSnapshot::with_core(50.0, 40.0, 30.0));
    }
    let found = detector.detect(&MetricSnapshot::with_core(98.0, 40.0, 30.0));

    let surge = found
        .iter()
        .find(|a| a.metric == "cpu_percent")
        .expect("a cpu surge against a steady baseline should be flagged");
    assert!(
        surge.severity >= Severity::High,
        "surge severity should be at least High, was {:?}",
        surge.severity
    );
}

#[test]
fn test_detector_reports_sustained_memory_climb() {
    let detector = AnomalyDetector::new(DetectorConfig {
        min_samples: 30,
        ..DetectorConfig::default()
    });

    let mut found = Vec::new();
    for step in 0..40 {
        let memory = 30.0 + f64::from(step) * 1.5;
        found.extend(detector.detect(&MetricSnapshot::with_core(35.0, memory, 40.0)));
    }

    let climb = found
        .iter()
        .find(|a| {
            a.metric == "memory_percent"
                && matches!(a.kind, AnomalyKind::TrendUp | AnomalyKind::MemoryLeak)
        })
        .expect("a sustained memory climb should be flagged as a trend or leak");
    assert!(climb.severity >= Severity::Medium);
}

// ============================================================
// Alert suppression and aggregation
// ============================================================

#[test]
fn test_alert_repeats_are_suppressed_and_aggregated() {
    let alerts = AlertManager::new(AlertConfig::default());

    let first = alerts.raise_alert(
        AlertLevel::Warning,
        "High CPU usage",
        "cpu at 93.0%",
        "vigil.sampler",
    );
    assert!(first.is_some(), "the first alert of a run should dispatch");

    let repeat = alerts.raise_alert(
        AlertLevel::Warning,
        "High CPU usage",
        "cpu at 94.5%",
        "vigil.sampler",
    );
    assert!(repeat.is_none(), "an identical alert inside the cooldown is suppressed");

    let history = alerts.history(&AlertQuery::default());
    assert_eq!(history.len(), 1, "the repeat must not create a second history entry");
    assert_eq!(history[0].count, 2);

    let aggregates = alerts.aggregates();
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].count, 2);

    let stats = alerts.stats();
    assert_eq!(stats.total_raised, 2);
    assert_eq!(stats.suppressed, 1);
}

// ============================================================
// Auto-healing escalation order
// ============================================================

#[test]
fn test_healing_stops_at_the_first_successful_action() {
    let healer = AutoHealer::new(HealerConfig::default());
    let cache = Arc::new(CountingCache::default());
    let handle: Arc<dyn Clearable> = cache.clone();
    healer.register_cache("sessions", handle);

    // No memory hooks registered: the first rung is skipped, the cache
    // clear succeeds, and the allocator trim never runs.
    let records = healer.heal(&leak_anomaly());
    let actions: Vec<HealActionKind> = records.iter().map(|r| r.action.clone()).collect();
    assert_eq!(
        actions,
        vec![HealActionKind::ReleaseMemory, HealActionKind::ClearCaches]
    );
    assert_eq!(records[0].outcome, HealOutcome::Skipped);
    assert_eq!(records[1].outcome, HealOutcome::Success);
    assert_eq!(cache.clears.load(Ordering::SeqCst), 1);
}

#[test]
fn test_healing_with_memory_hook_needs_no_escalation() {
    let healer = AutoHealer::new(HealerConfig::default());
    let released = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&released);
    healer.register_memory_hook("drop-buffers", move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let records = healer.heal(&leak_anomaly());
    assert_eq!(records.len(), 1, "a successful first rung ends the escalation");
    assert_eq!(records[0].action, HealActionKind::ReleaseMemory);
    assert_eq!(records[0].outcome, HealOutcome::Success);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

// ============================================================
// Orchestrated runtime lifecycle
// ============================================================

#[tokio::test]
async fn test_runtime_start_protect_and_stop() {
    let config = MonitorConfig {
        app_name: "itest".to_string(),
        environment: "test".to_string(),
        ..MonitorConfig::default()
    };
    let vigil = Vigil::new(config);
    vigil.register_health_check("always-up", || true);
    vigil.register_health_check("always-down", || false);

    vigil.start().expect("the runtime should start once");

    let result: Result<u32, CallError<String>> = vigil
        .protected("backend", Some("gateway"), None, async { Ok(7) })
        .await;
    assert_eq!(result.expect("an unremarkable call should pass"), 7);

    for value in [12.0, 14.0, 11.0] {
        vigil.record_metric("queue_depth", value);
    }
    vigil.heartbeat();

    let health: HashMap<String, bool> = vigil.run_health_checks().await;
    assert_eq!(health.get("always-up"), Some(&true));
    assert_eq!(health.get("always-down"), Some(&false));

    let status = vigil.status();
    assert!(status.running);
    assert!(status.breakers.contains_key("backend"));
    assert!(status.limiters.contains_key("gateway"));
    assert_eq!(status.app_name, "itest");

    vigil.stop().await.expect("the runtime should stop cleanly");
    assert!(!vigil.status().running);

    let titles: Vec<String> = vigil
        .alerts()
        .history(&AlertQuery::default())
        .into_iter()
        .map(|alert| alert.title)
        .collect();
    assert!(titles.contains(&"Monitor started".to_string()), "titles: {titles:?}");
    assert!(titles.contains(&"Monitor stopped".to_string()), "titles: {titles:?}");
}

#[tokio::test]
async fn test_protected_call_is_rejected_while_breaker_is_open() {
    let vigil = Vigil::new(MonitorConfig {
        app_name: "itest".to_string(),
        environment: "test".to_string(),
        ..MonitorConfig::default()
    });
    vigil
        .breaker_with(
            "flaky",
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
        )
        .record_failure();

    let result: Result<u32, CallError<String>> = vigil
        .protected("flaky", None, None, async { Ok(1) })
        .await;
    match result {
        Err(CallError::Rejected(ProtectError::CircuitOpen { name, .. })) => {
            assert_eq!(name, "flaky");
        }
        other => panic!("expected an open-circuit rejection, got {other:?}"),
    }
}
