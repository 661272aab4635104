//! The [`Vigil`] runtime: component ownership, wiring and periodic loops.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::alerts::{
    Alert, AlertLevel, AlertManager, AlertStats, LogChannel, SlackChannel, WebhookChannel,
};
use crate::config::{BreakerConfig, HealthCheckConfig, MonitorConfig, SamplerConfig};
use crate::detect::{Anomaly, AnomalyDetector, Severity};
use crate::error::RuntimeError;
use crate::heal::{AutoHealer, HealRecord, HealerStats, HOOK_RELIEF_LIMIT};
use crate::metrics::{MetricSnapshot, MetricsSampler};
use crate::protect::{
    BreakerStats, CallError, CircuitBreaker, CircuitState, RateLimiter, RateLimiterStats,
};
use crate::traits::{Clearable, HealthCheck, Resettable};
use crate::watchdog::{ProcessWatchdog, WatchdogStats};

/// Most snapshots a single detection tick will catch up on.
const DETECTION_BACKLOG: usize = 32;

/// Callback invoked for every anomaly the runtime publishes.
type AnomalyCallback = Box<dyn Fn(&Anomaly) + Send + Sync>;

type HealthChecks = RwLock<HashMap<String, Arc<dyn HealthCheck>>>;

/// Serializable point-in-time view of the whole runtime.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    /// Application name from the configuration.
    pub app_name: String,
    /// Deployment environment from the configuration.
    pub environment: String,
    /// Whether the background loops are running.
    pub running: bool,
    /// Seconds since [`Vigil::start`], 0 when stopped.
    pub uptime_secs: f64,
    /// Composite health score in `[0, 100]`.
    pub health_score: f64,
    /// Latest metrics snapshot, if at least one collection ran.
    pub snapshot: Option<MetricSnapshot>,
    /// Anomalies inside the detector's recent window.
    pub recent_anomalies: usize,
    /// Alert pipeline counters.
    pub alerts: AlertStats,
    /// Healer counters.
    pub healer: HealerStats,
    /// Watchdog counters and assessment.
    pub watchdog: WatchdogStats,
    /// Per-breaker statistics, keyed by breaker name.
    pub breakers: HashMap<String, BreakerStats>,
    /// Per-limiter statistics, keyed by limiter name.
    pub limiters: HashMap<String, RateLimiterStats>,
}

/// Live handles of a started runtime.
struct RunState {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    started_at: Instant,
}

/// The embedded protection runtime.
///
/// Owns one instance of every component plus the named registries of
/// circuit breakers, rate limiters and health checks. There is no global
/// instance: construct one `Vigil` per application and pass it (or the
/// handles it returns) to the call sites that need protection.
///
/// [`Vigil::start`] spawns the periodic loops (sampling, detection +
/// healing, health checks, watchdog); [`Vigil::stop`] winds them down
/// under the configured grace. Registries and the protected-call helper
/// work before `start` as well, so the runtime can guard traffic even
/// when background monitoring is disabled.
pub struct Vigil {
    config: MonitorConfig,
    sampler: Arc<MetricsSampler>,
    detector: Arc<AnomalyDetector>,
    healer: Arc<AutoHealer>,
    watchdog: Arc<ProcessWatchdog>,
    alerts: Arc<AlertManager>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    health_checks: Arc<HealthChecks>,
    anomaly_callbacks: Arc<RwLock<Vec<AnomalyCallback>>>,
    channels_wired: AtomicBool,
    run_state: Mutex<Option<RunState>>,
}

impl Vigil {
    /// Build the runtime and wire its components together.
    ///
    /// The configuration is sanitized first: invalid values are logged
    /// and replaced by their defaults rather than rejected, so a bad
    /// environment variable cannot keep the runtime from coming up.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        let (config, issues) = config.sanitized();
        for issue in &issues {
            tracing::warn!(%issue, "Invalid configuration value replaced with default");
        }

        let sampler = Arc::new(MetricsSampler::new(config.sampler.clone()));
        let detector = Arc::new(AnomalyDetector::new(config.detector.clone()));
        let healer = Arc::new(AutoHealer::new(config.healer.clone()));
        let watchdog = Arc::new(ProcessWatchdog::new(config.watchdog.clone()));
        let alerts = Arc::new(AlertManager::new(config.alerts.clone()));

        healer.set_alert_manager(Arc::clone(&alerts));
        watchdog.set_alert_manager(Arc::clone(&alerts));

        // Both hooks hold weak references so the healer and the watchdog
        // do not keep each other alive.
        let healer_ref = Arc::downgrade(&healer);
        watchdog.set_recovery_hook(move |_wanted| {
            if let Some(healer) = healer_ref.upgrade() {
                healer.handle_memory_pressure(HOOK_RELIEF_LIMIT);
            }
        });
        let watchdog_ref = Arc::downgrade(&watchdog);
        healer.set_census_hook(move || {
            watchdog_ref
                .upgrade()
                .map_or(0, |watchdog| watchdog.prune_dead())
        });

        Self {
            config,
            sampler,
            detector,
            healer,
            watchdog,
            alerts,
            breakers: RwLock::new(HashMap::new()),
            limiters: RwLock::new(HashMap::new()),
            health_checks: Arc::new(RwLock::new(HashMap::new())),
            anomaly_callbacks: Arc::new(RwLock::new(Vec::new())),
            channels_wired: AtomicBool::new(false),
            run_state: Mutex::new(None),
        }
    }

    /// Effective configuration after sanitization.
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The metrics sampler.
    #[must_use]
    pub fn sampler(&self) -> &Arc<MetricsSampler> {
        &self.sampler
    }

    /// The anomaly detector.
    #[must_use]
    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }

    /// The auto-healer.
    #[must_use]
    pub fn healer(&self) -> &Arc<AutoHealer> {
        &self.healer
    }

    /// The process watchdog.
    #[must_use]
    pub fn watchdog(&self) -> &Arc<ProcessWatchdog> {
        &self.watchdog
    }

    /// The alert pipeline.
    #[must_use]
    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Named circuit breaker with the configured defaults, created on
    /// first use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breaker_with(name, self.config.breaker.clone())
    }

    /// Named circuit breaker with an explicit configuration.
    ///
    /// The configuration applies only when the breaker is created; a
    /// later call with a different configuration returns the existing
    /// breaker unchanged.
    pub fn breaker_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = write_lock(&self.breakers);
        if let Some(existing) = breakers.get(name) {
            return Arc::clone(existing);
        }
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        let alerts = Arc::clone(&self.alerts);
        breaker.on_state_change(move |name, from, to| {
            let level = if to == CircuitState::Open {
                AlertLevel::Critical
            } else {
                AlertLevel::Info
            };
            alerts
                .alert(level, format!("Circuit Breaker: {name}"))
                .message(format!("circuit {name} moved {from} -> {to}"))
                .source("vigil.breaker")
                .meta("from", from.as_str())
                .meta("to", to.as_str())
                .send();
        });
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Named rate limiter with the configured defaults, created on first
    /// use.
    pub fn limiter(&self, name: &str) -> Arc<RateLimiter> {
        let defaults = &self.config.limiter;
        self.limiter_with(name, defaults.rate_per_sec, defaults.burst_size)
    }

    /// Named rate limiter with an explicit rate and burst.
    ///
    /// Like [`Vigil::breaker_with`], the parameters apply only on first
    /// creation.
    pub fn limiter_with(&self, name: &str, rate_per_sec: f64, burst_size: f64) -> Arc<RateLimiter> {
        let mut limiters = write_lock(&self.limiters);
        if let Some(existing) = limiters.get(name) {
            return Arc::clone(existing);
        }
        let mut config = self.config.limiter.clone();
        config.rate_per_sec = rate_per_sec;
        config.burst_size = burst_size;
        let limiter = Arc::new(RateLimiter::new(name, config));
        limiters.insert(name.to_string(), Arc::clone(&limiter));
        limiter
    }

    /// Register a named health probe.
    ///
    /// Plain `Fn() -> bool` closures implement [`HealthCheck`], so both
    /// trait objects and closures register through the same call.
    pub fn register_health_check(&self, name: impl Into<String>, check: impl HealthCheck + 'static) {
        write_lock(&self.health_checks).insert(name.into(), Arc::new(check));
    }

    /// Register a clearable cache with the healer.
    pub fn register_cache(&self, name: impl Into<String>, cache: Arc<dyn Clearable>) {
        self.healer.register_cache(name, cache);
    }

    /// Register a resettable pool with the healer.
    pub fn register_pool(&self, name: impl Into<String>, pool: Arc<dyn Resettable>) {
        self.healer.register_pool(name, pool);
    }

    /// Register a callback invoked for every published anomaly.
    pub fn on_anomaly<F>(&self, callback: F)
    where
        F: Fn(&Anomaly) + Send + Sync + 'static,
    {
        write_lock(&self.anomaly_callbacks).push(Box::new(callback));
    }

    /// Register a callback invoked for every dispatched alert.
    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.alerts.on_alert(callback);
    }

    /// Register a callback invoked for every healing action.
    pub fn on_heal<F>(&self, callback: F)
    where
        F: Fn(&HealRecord) + Send + Sync + 'static,
    {
        self.healer.on_heal(callback);
    }

    /// Record an application-defined metric and run it through anomaly
    /// detection.
    pub fn record_metric(&self, name: &str, value: f64) {
        self.sampler.record_metric(name, value);
        for anomaly in self.detector.observe(name, value) {
            handle_anomaly(&anomaly, &self.anomaly_callbacks, &self.alerts, &self.healer);
        }
    }

    /// Record liveness of the application's main loop.
    pub fn heartbeat(&self) {
        self.watchdog.heartbeat();
    }

    /// Run `operation` behind the named breaker, optionally admitted by
    /// the named limiter first.
    ///
    /// The limiter is consulted before the breaker, so a rate-limited
    /// call never counts against the breaker's statistics. `client`
    /// selects a per-client bucket when the limiter is configured for
    /// them.
    ///
    /// # Errors
    ///
    /// [`CallError::Rejected`] when admission fails (the operation never
    /// runs), [`CallError::Operation`] when the operation itself fails.
    pub async fn protected<F, T, E>(
        &self,
        breaker: &str,
        limiter: Option<&str>,
        client: Option<&str>,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if let Some(limiter_name) = limiter {
            self.limiter(limiter_name).try_acquire(client)?;
        }
        self.breaker(breaker).call(operation).await
    }

    /// Run every registered health check once.
    ///
    /// A check that panics, errors or exceeds the configured per-check
    /// timeout reports `false`.
    pub async fn run_health_checks(&self) -> HashMap<String, bool> {
        let timeout = clamped_secs(self.config.health_check.timeout_secs);
        run_checks(&self.health_checks, timeout).await
    }

    /// Point-in-time view of the runtime and all components.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        let snapshot = self.sampler.latest();
        let health_score = snapshot
            .as_ref()
            .map_or(100.0, |latest| self.detector.health_score(latest));
        let (running, uptime_secs) = {
            let guard = lock_state(&self.run_state);
            guard.as_ref().map_or((false, 0.0), |state| {
                (true, state.started_at.elapsed().as_secs_f64())
            })
        };
        let breakers = read_lock(&self.breakers)
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect();
        let limiters = read_lock(&self.limiters)
            .iter()
            .map(|(name, limiter)| (name.clone(), limiter.stats()))
            .collect();
        MonitorStatus {
            app_name: self.config.app_name.clone(),
            environment: self.config.environment.clone(),
            running,
            uptime_secs,
            health_score,
            snapshot,
            recent_anomalies: self.detector.recent_count(),
            alerts: self.alerts.stats(),
            healer: self.healer.stats(),
            watchdog: self.watchdog.stats(),
            breakers,
            limiters,
        }
    }

    /// Start the background loops.
    ///
    /// Must be called from within a tokio runtime. Loops whose
    /// configuration section is disabled are not spawned.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AlreadyRunning`] when called twice without an
    /// intervening [`Vigil::stop`].
    pub fn start(&self) -> Result<(), RuntimeError> {
        let mut run_state = lock_state(&self.run_state);
        if run_state.is_some() {
            return Err(RuntimeError::AlreadyRunning);
        }

        self.wire_channels();
        self.alerts.start_dispatch();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if self.config.sampler.enabled {
            handles.push((
                "sampling",
                tokio::spawn(sampling_loop(
                    Arc::clone(&self.sampler),
                    Arc::clone(&self.healer),
                    Arc::clone(&self.alerts),
                    self.config.sampler.clone(),
                    shutdown_rx.clone(),
                )),
            ));
        }
        if self.config.detector.enabled {
            handles.push((
                "detection",
                tokio::spawn(detection_loop(
                    Arc::clone(&self.sampler),
                    Arc::clone(&self.detector),
                    Arc::clone(&self.healer),
                    Arc::clone(&self.alerts),
                    Arc::clone(&self.anomaly_callbacks),
                    self.config.detector.detection_period(),
                    shutdown_rx.clone(),
                )),
            ));
        }
        if self.config.health_check.enabled {
            handles.push((
                "health",
                tokio::spawn(health_check_loop(
                    Arc::clone(&self.health_checks),
                    Arc::clone(&self.alerts),
                    self.config.health_check.clone(),
                    shutdown_rx.clone(),
                )),
            ));
        }
        if self.config.watchdog.enabled {
            // Re-arm the heartbeat so staleness is measured from start,
            // not from construction.
            self.watchdog.heartbeat();
            handles.push((
                "watchdog",
                tokio::spawn(watchdog_loop(
                    Arc::clone(&self.watchdog),
                    clamped_secs(self.config.watchdog.check_interval_secs),
                    shutdown_rx.clone(),
                )),
            ));
        }
        drop(shutdown_rx);

        tracing::info!(
            app = %self.config.app_name,
            environment = %self.config.environment,
            loops = handles.len(),
            "Monitor started"
        );
        self.alerts
            .alert(AlertLevel::Info, "Monitor started")
            .message(format!(
                "{} protection runtime started ({})",
                self.config.app_name, self.config.environment
            ))
            .source("vigil.runtime")
            .send();

        *run_state = Some(RunState {
            shutdown_tx,
            handles,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Stop the background loops and drain the alert queue.
    ///
    /// Waits up to the configured shutdown grace for every loop to exit.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::NotRunning`] when the runtime was not started,
    /// [`RuntimeError::ShutdownTimeout`] when loops outlived the grace
    /// period (they keep winding down in the background).
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let state = {
            let mut guard = lock_state(&self.run_state);
            guard.take().ok_or(RuntimeError::NotRunning)?
        };

        let _ = state.shutdown_tx.send(true);
        let grace = self.config.shutdown_grace();
        let total = state.handles.len();
        let finished = Arc::new(AtomicUsize::new(0));
        let joins = join_all(state.handles.into_iter().map(|(name, handle)| {
            let finished = Arc::clone(&finished);
            async move {
                if let Err(error) = handle.await {
                    tracing::error!(task = name, error = %error, "Background loop ended abnormally");
                }
                finished.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let timed_out = tokio::time::timeout(grace, joins).await.is_err();
        let pending = total.saturating_sub(finished.load(Ordering::SeqCst));
        if timed_out {
            tracing::warn!(
                pending,
                grace_secs = grace.as_secs_f64(),
                "Background loops outlived the shutdown grace"
            );
        }

        tracing::info!(
            uptime_secs = state.started_at.elapsed().as_secs_f64(),
            "Monitor stopped"
        );
        self.alerts
            .alert(AlertLevel::Info, "Monitor stopped")
            .message(format!(
                "{} protection runtime stopped",
                self.config.app_name
            ))
            .source("vigil.runtime")
            .send();
        self.alerts.shutdown().await;

        if timed_out && pending > 0 {
            return Err(RuntimeError::ShutdownTimeout { grace, pending });
        }
        Ok(())
    }

    /// Register the configured alert channels, once.
    fn wire_channels(&self) {
        if self.channels_wired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alerts.add_channel(Arc::new(LogChannel));
        if let Some(url) = &self.config.alerts.slack_webhook_url {
            match SlackChannel::new(url.clone()) {
                Ok(channel) => self.alerts.add_channel(Arc::new(channel)),
                Err(error) => tracing::error!(error = %error, "Slack alert channel disabled"),
            }
        }
        if let Some(url) = &self.config.alerts.webhook_url {
            match WebhookChannel::new(url.clone()) {
                Ok(channel) => self.alerts.add_channel(Arc::new(channel)),
                Err(error) => tracing::error!(error = %error, "Webhook alert channel disabled"),
            }
        }
    }
}

/// Publish one anomaly: callbacks, alert, then healing.
fn handle_anomaly(
    anomaly: &Anomaly,
    callbacks: &RwLock<Vec<AnomalyCallback>>,
    alerts: &AlertManager,
    healer: &AutoHealer,
) {
    match anomaly.severity {
        Severity::High | Severity::Critical => tracing::warn!(
            kind = anomaly.kind.as_str(),
            metric = %anomaly.metric,
            severity = anomaly.severity.as_str(),
            value = anomaly.value,
            "Anomaly detected"
        ),
        Severity::Low | Severity::Medium => tracing::info!(
            kind = anomaly.kind.as_str(),
            metric = %anomaly.metric,
            severity = anomaly.severity.as_str(),
            value = anomaly.value,
            "Anomaly detected"
        ),
    }
    for callback in read_lock(callbacks).iter() {
        callback(anomaly);
    }
    let level = match anomaly.severity {
        Severity::Critical => AlertLevel::Critical,
        Severity::High => AlertLevel::Warning,
        Severity::Low | Severity::Medium => AlertLevel::Info,
    };
    alerts
        .alert(level, format!("Anomaly: {} on {}", anomaly.kind, anomaly.metric))
        .message(anomaly.message.clone())
        .source("vigil.detector")
        .meta("kind", anomaly.kind.as_str())
        .meta("metric", anomaly.metric.clone())
        .meta("severity", anomaly.severity.as_str())
        .meta("value", anomaly.value)
        .meta("expected", anomaly.expected)
        .send();
    healer.heal(anomaly);
}

/// Core-gauge threshold checks run on every sampling tick.
fn check_thresholds(
    snapshot: &MetricSnapshot,
    config: &SamplerConfig,
    healer: &AutoHealer,
    alerts: &AlertManager,
) {
    if snapshot.cpu_percent > config.cpu_threshold {
        alerts
            .alert(AlertLevel::Warning, "High CPU usage")
            .message(format!(
                "CPU at {:.1}% (threshold {:.1}%)",
                snapshot.cpu_percent, config.cpu_threshold
            ))
            .source("vigil.sampler")
            .meta("cpu_percent", snapshot.cpu_percent)
            .send();
        healer.handle_cpu_pressure(snapshot.cpu_percent);
    }
    if snapshot.memory_percent > config.memory_threshold {
        alerts
            .alert(AlertLevel::Warning, "High memory usage")
            .message(format!(
                "memory at {:.1}% (threshold {:.1}%)",
                snapshot.memory_percent, config.memory_threshold
            ))
            .source("vigil.sampler")
            .meta("memory_percent", snapshot.memory_percent)
            .send();
        healer.handle_memory_pressure(snapshot.memory_percent);
    }
    if snapshot.disk_percent > config.disk_threshold {
        alerts
            .alert(AlertLevel::Critical, "High disk usage")
            .message(format!(
                "disk at {:.1}% (threshold {:.1}%)",
                snapshot.disk_percent, config.disk_threshold
            ))
            .source("vigil.sampler")
            .meta("disk_percent", snapshot.disk_percent)
            .send();
    }
}

/// Run every registered check concurrently, one spawned task each so a
/// panicking probe is contained by the task boundary.
async fn run_checks(checks: &HealthChecks, timeout: Duration) -> HashMap<String, bool> {
    let snapshot: Vec<(String, Arc<dyn HealthCheck>)> = read_lock(checks)
        .iter()
        .map(|(name, check)| (name.clone(), Arc::clone(check)))
        .collect();
    let probes = snapshot.into_iter().map(|(name, check)| async move {
        let probe = tokio::spawn(async move { check.check().await });
        let healthy = match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                tracing::error!(check = %name, error = %error, "Health check panicked");
                false
            }
            Err(_) => {
                tracing::warn!(
                    check = %name,
                    timeout_secs = timeout.as_secs_f64(),
                    "Health check timed out"
                );
                false
            }
        };
        (name, healthy)
    });
    join_all(probes).await.into_iter().collect()
}

/// Collects a snapshot per tick and applies the threshold checks.
async fn sampling_loop(
    sampler: Arc<MetricsSampler>,
    healer: Arc<AutoHealer>,
    alerts: Arc<AlertManager>,
    config: SamplerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(clamped_secs(config.collection_interval_secs));
    // Skip the first immediate tick.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = sampler.collect();
                check_thresholds(&snapshot, &config, &healer, &alerts);
            }
            changed = shutdown_rx.changed() => {
                // A closed channel means the runtime was dropped; stop too.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Sampling loop stopped");
}

/// Runs the detector over each new snapshot and heals what it finds.
async fn detection_loop(
    sampler: Arc<MetricsSampler>,
    detector: Arc<AnomalyDetector>,
    healer: Arc<AutoHealer>,
    alerts: Arc<AlertManager>,
    callbacks: Arc<RwLock<Vec<AnomalyCallback>>>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut last_seen: Option<DateTime<Utc>> = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Sampling and detection tick on independent cadences;
                // run every snapshot collected since the previous pass
                // through the detector exactly once.
                for snapshot in sampler.history(Some(DETECTION_BACKLOG)) {
                    if last_seen.is_some_and(|seen| snapshot.timestamp <= seen) {
                        continue;
                    }
                    last_seen = Some(snapshot.timestamp);
                    for anomaly in detector.detect(&snapshot) {
                        handle_anomaly(&anomaly, &callbacks, &alerts, &healer);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Detection loop stopped");
}

/// Sweeps the registered health checks and alerts on failures.
async fn health_check_loop(
    checks: Arc<HealthChecks>,
    alerts: Arc<AlertManager>,
    config: HealthCheckConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(clamped_secs(config.check_interval_secs));
    ticker.tick().await;
    let timeout = clamped_secs(config.timeout_secs);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let results = run_checks(&checks, timeout).await;
                for (name, healthy) in &results {
                    if !*healthy {
                        alerts
                            .alert(AlertLevel::Warning, format!("Health check failed: {name}"))
                            .message(format!("health probe {name} reported unhealthy"))
                            .source("vigil.health")
                            .meta("check", name.clone())
                            .send();
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Health check loop stopped");
}

/// Drives the watchdog's periodic assessment.
async fn watchdog_loop(
    watchdog: Arc<ProcessWatchdog>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                watchdog.check();
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Watchdog loop stopped");
}

/// Configured seconds value as a [`Duration`], clamped to a sane range.
fn clamped_secs(secs: f64) -> Duration {
    if secs.is_finite() {
        Duration::from_secs_f64(secs.clamp(0.01, 31_536_000.0))
    } else {
        Duration::from_secs(1)
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_state(lock: &Mutex<Option<RunState>>) -> MutexGuard<'_, Option<RunState>> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{DetectorConfig, LimiterConfig};
    use crate::detect::AnomalyKind;
    use crate::error::ProtectError;
    use crate::heal::{HealActionKind, HealOutcome};

    fn quiet_config() -> MonitorConfig {
        MonitorConfig {
            app_name: "testapp".to_string(),
            environment: "test".to_string(),
            ..MonitorConfig::default()
        }
    }

    fn anomaly(kind: AnomalyKind, metric: &str, severity: Severity) -> Anomaly {
        Anomaly {
            timestamp: Utc::now(),
            kind,
            metric: metric.to_string(),
            severity,
            value: 97.0,
            expected: 50.0,
            deviation: 4.0,
            message: format!("{metric} out of range"),
        }
    }

    #[test]
    fn test_breaker_registry_create_or_get() {
        let vigil = Vigil::new(quiet_config());
        let first = vigil.breaker("api");
        let second = vigil.breaker("api");
        assert!(Arc::ptr_eq(&first, &second));

        let override_ignored = vigil.breaker_with(
            "api",
            BreakerConfig {
                failure_threshold: 99,
                ..BreakerConfig::default()
            },
        );
        assert!(Arc::ptr_eq(&first, &override_ignored));
        assert_eq!(vigil.status().breakers.len(), 1);
    }

    #[test]
    fn test_limiter_registry_create_or_get() {
        let vigil = Vigil::new(quiet_config());
        let first = vigil.limiter("api");
        let second = vigil.limiter_with("api", 1.0, 1.0);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(vigil.status().limiters.len(), 1);
    }

    #[test]
    fn test_breaker_open_raises_critical_alert() {
        let vigil = Vigil::new(quiet_config());
        let breaker = vigil.breaker("flaky-dep");
        breaker.force_open();

        let recent = vigil.alerts().recent(5);
        let alert = recent
            .iter()
            .find(|a| a.title == "Circuit Breaker: flaky-dep")
            .unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
        assert_eq!(alert.source, "vigil.breaker");

        breaker.reset();
        let recent = vigil.alerts().recent(5);
        let closed = recent
            .iter()
            .filter(|a| a.title == "Circuit Breaker: flaky-dep")
            .count();
        // Reset transitions back to closed at Info level under the same
        // title but a different level, so it is not suppressed.
        assert_eq!(closed, 2);
    }

    #[test]
    fn test_record_metric_feeds_sampler_and_detector() {
        let mut config = quiet_config();
        config.detector = DetectorConfig {
            min_samples: 5,
            ..DetectorConfig::default()
        };
        let vigil = Vigil::new(config);

        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_callback = Arc::clone(&seen);
        vigil.on_anomaly(move |_| {
            seen_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..30 {
            vigil.record_metric("queue_depth", 10.0);
        }
        assert_eq!(vigil.sampler().custom_latest("queue_depth"), Some(10.0));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        vigil.record_metric("queue_depth", 500.0);
        assert!(seen.load(Ordering::SeqCst) >= 1);
        let recent = vigil.alerts().recent(10);
        assert!(recent.iter().any(|a| a.title.starts_with("Anomaly:")
            && a.source == "vigil.detector"));
    }

    #[test]
    fn test_handle_anomaly_severity_maps_to_alert_level() {
        let vigil = Vigil::new(quiet_config());
        for (severity, metric, level) in [
            (Severity::Critical, "cpu_percent", AlertLevel::Critical),
            (Severity::High, "memory_percent", AlertLevel::Warning),
            (Severity::Medium, "disk_percent", AlertLevel::Info),
        ] {
            let spike = anomaly(AnomalyKind::Spike, metric, severity);
            handle_anomaly(
                &spike,
                &vigil.anomaly_callbacks,
                vigil.alerts(),
                vigil.healer(),
            );
            let recent = vigil.alerts().recent(1);
            assert_eq!(recent[0].level, level, "severity {severity}");
            assert_eq!(recent[0].title, format!("Anomaly: spike on {metric}"));
        }
    }

    #[test]
    fn test_anomaly_healing_reaches_registered_cache() {
        struct CountingCache(AtomicU64);
        impl Clearable for CountingCache {
            fn clear(&self) -> u64 {
                self.0.fetch_add(1, Ordering::SeqCst);
                7
            }
        }

        let vigil = Vigil::new(quiet_config());
        let cache = Arc::new(CountingCache(AtomicU64::new(0)));
        let handle: Arc<dyn Clearable> = cache.clone();
        vigil.register_cache("responses", handle);

        let leak = anomaly(AnomalyKind::MemoryLeak, "memory_percent", Severity::High);
        let records = vigil.healer().heal(&leak);
        assert!(records
            .iter()
            .any(|r| r.action == HealActionKind::ClearCaches && r.outcome == HealOutcome::Success));
        assert_eq!(cache.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_census_hook_prunes_watchdog_registry() {
        let vigil = Vigil::new(quiet_config());
        let pulse = vigil.watchdog().watch("ephemeral", true);
        drop(pulse);

        let saturation = anomaly(AnomalyKind::CpuSaturation, "cpu_percent", Severity::High);
        let records = vigil.healer().heal(&saturation);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, HealActionKind::CleanupThreads);
        assert_eq!(records[0].outcome, HealOutcome::Success);
        assert!(records[0].detail.contains("pruned 1"));
    }

    #[test]
    fn test_threshold_checks_alert_and_heal() {
        let vigil = Vigil::new(quiet_config());
        let snapshot = MetricSnapshot::with_core(95.0, 50.0, 95.5);
        check_thresholds(
            &snapshot,
            &vigil.config().sampler,
            vigil.healer(),
            vigil.alerts(),
        );

        let recent = vigil.alerts().recent(10);
        let cpu = recent.iter().find(|a| a.title == "High CPU usage").unwrap();
        assert_eq!(cpu.level, AlertLevel::Warning);
        assert_eq!(cpu.source, "vigil.sampler");
        let disk = recent.iter().find(|a| a.title == "High disk usage").unwrap();
        assert_eq!(disk.level, AlertLevel::Critical);
        assert!(!recent.iter().any(|a| a.title == "High memory usage"));

        // CPU pressure handling ran (no census hook work to do, but the
        // attempt is recorded).
        assert!(vigil.healer().stats().total_heals >= 1);
    }

    #[test]
    fn test_on_alert_forwarding() {
        let vigil = Vigil::new(quiet_config());
        let titles = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&titles);
        vigil.on_alert(move |alert| {
            sink.lock().unwrap().push(alert.title.clone());
        });

        vigil
            .alerts()
            .alert(AlertLevel::Info, "Direct")
            .message("raised straight on the manager")
            .send();
        assert_eq!(titles.lock().unwrap().as_slice(), ["Direct".to_string()]);
    }

    #[test]
    fn test_status_surface_serializes() {
        let vigil = Vigil::new(quiet_config());
        vigil.breaker("api");
        vigil.limiter("api");

        let status = vigil.status();
        assert_eq!(status.app_name, "testapp");
        assert!(!status.running);
        assert_eq!(status.uptime_secs, 0.0);
        assert_eq!(status.health_score, 100.0);
        assert!(status.snapshot.is_none());
        assert!(status.breakers.contains_key("api"));
        assert!(status.limiters.contains_key("api"));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["running"], serde_json::json!(false));
        assert!(json["breakers"]["api"]["state"].is_string());
    }

    #[test]
    fn test_invalid_config_is_sanitized() {
        let mut config = quiet_config();
        config.sampler.cpu_threshold = 250.0;
        let vigil = Vigil::new(config);
        assert_eq!(
            vigil.config().sampler.cpu_threshold,
            SamplerConfig::default().cpu_threshold
        );
    }

    #[tokio::test]
    async fn test_protected_admission_limiter_before_breaker() {
        let mut config = quiet_config();
        config.limiter = LimiterConfig {
            rate_per_sec: 1.0,
            burst_size: 2.0,
            per_client: false,
            ..LimiterConfig::default()
        };
        let vigil = Vigil::new(config);

        for _ in 0..2 {
            let result: Result<u32, CallError<String>> =
                vigil.protected("api", Some("api"), None, async { Ok(1) }).await;
            assert!(result.is_ok());
        }

        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);
        let result: Result<u32, CallError<String>> = vigil
            .protected("api", Some("api"), None, async move {
                ran_flag.store(true, Ordering::SeqCst);
                Ok(3)
            })
            .await;
        assert!(matches!(
            result,
            Err(CallError::Rejected(ProtectError::RateLimited { .. }))
        ));
        assert!(!ran.load(Ordering::SeqCst));
        // The rejected call never reached the breaker.
        assert_eq!(vigil.breaker("api").stats().total_calls, 2);
    }

    #[tokio::test]
    async fn test_protected_rejects_when_breaker_open() {
        let vigil = Vigil::new(quiet_config());
        vigil.breaker("down").force_open();

        let result: Result<u32, CallError<String>> =
            vigil.protected("down", None, None, async { Ok(1) }).await;
        assert!(matches!(
            result,
            Err(CallError::Rejected(ProtectError::CircuitOpen { .. }))
        ));
    }

    #[tokio::test]
    async fn test_run_health_checks_timeout_panic_and_failure() {
        struct SlowCheck;
        #[async_trait]
        impl HealthCheck for SlowCheck {
            async fn check(&self) -> bool {
                tokio::time::sleep(Duration::from_millis(300)).await;
                true
            }
        }

        let mut config = quiet_config();
        config.health_check.timeout_secs = 0.05;
        let vigil = Vigil::new(config);
        vigil.register_health_check("ok", || true);
        vigil.register_health_check("failing", || false);
        vigil.register_health_check("slow", SlowCheck);
        vigil.register_health_check("panicking", || -> bool { panic!("probe blew up") });

        let results = vigil.run_health_checks().await;
        assert_eq!(results.len(), 4);
        assert!(results["ok"]);
        assert!(!results["failing"]);
        assert!(!results["slow"]);
        assert!(!results["panicking"]);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let vigil = Vigil::new(quiet_config());
        assert_eq!(vigil.stop().await, Err(RuntimeError::NotRunning));

        vigil.start().unwrap();
        assert_eq!(vigil.start(), Err(RuntimeError::AlreadyRunning));
        assert!(vigil.status().running);

        tokio::time::sleep(Duration::from_millis(20)).await;
        vigil.stop().await.unwrap();
        assert!(!vigil.status().running);
        assert_eq!(vigil.stop().await, Err(RuntimeError::NotRunning));

        let query = crate::alerts::AlertQuery::default();
        let titles: Vec<String> = vigil
            .alerts()
            .history(&query)
            .into_iter()
            .map(|a| a.title)
            .collect();
        assert!(titles.contains(&"Monitor started".to_string()));
        assert!(titles.contains(&"Monitor stopped".to_string()));
    }

    #[tokio::test]
    async fn test_disabled_sections_spawn_no_loops() {
        let mut config = quiet_config();
        config.sampler.enabled = false;
        config.detector.enabled = false;
        config.health_check.enabled = false;
        config.watchdog.enabled = false;
        let vigil = Vigil::new(config);

        vigil.start().unwrap();
        {
            let guard = lock_state(&vigil.run_state);
            assert!(guard.as_ref().unwrap().handles.is_empty());
        }
        vigil.stop().await.unwrap();
    }
}
