//! Configuration management.
//!
//! This module handles:
//! - Per-component configuration sections with production defaults
//! - Environment variable overlay (`VIGIL_*`)
//! - JSON file loading
//! - Validation as a list of human-readable issues
//!
//! Validation deliberately does not fail construction: [`MonitorConfig::validate`]
//! returns the issues and [`MonitorConfig::sanitized`] replaces each offending
//! field with its default, so the monitoring layer can never refuse to start
//! because of a bad threshold. Hard errors are reserved for unparseable
//! environment variables and unreadable files.
//!
//! # Example
//!
//! ```
//! use vigil::config::MonitorConfig;
//!
//! let mut config = MonitorConfig::default();
//! config.sampler.cpu_threshold = 80.0;
//! config.breaker.failure_threshold = 3;
//!
//! assert!(config.validate().is_empty());
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default metrics collection interval in seconds.
pub const DEFAULT_COLLECTION_INTERVAL_SECS: f64 = 5.0;

/// Default CPU usage threshold (percent).
pub const DEFAULT_CPU_THRESHOLD: f64 = 85.0;

/// Default memory usage threshold (percent).
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 85.0;

/// Default disk usage threshold (percent).
pub const DEFAULT_DISK_THRESHOLD: f64 = 90.0;

/// Default snapshot history capacity.
pub const DEFAULT_HISTORY_SIZE: usize = 1000;

/// Default outlier sensitivity in standard deviations.
pub const DEFAULT_SENSITIVITY: f64 = 2.0;

/// Default minimum samples before the detector emits anomalies.
pub const DEFAULT_MIN_SAMPLES: usize = 30;

/// Default anomaly detection window in seconds.
pub const DEFAULT_DETECTION_WINDOW_SECS: f64 = 60.0;

/// Default spike threshold (relative change multiplier).
pub const DEFAULT_SPIKE_THRESHOLD: f64 = 3.0;

/// Default trend analysis window in seconds.
pub const DEFAULT_TREND_WINDOW_SECS: f64 = 300.0;

/// Default consecutive failures before a breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default consecutive successes before a breaker closes.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;

/// Default breaker open-state cooldown in seconds.
pub const DEFAULT_BREAKER_COOLDOWN_SECS: f64 = 30.0;

/// Default concurrent probe calls admitted while half-open.
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 3;

/// Default global rate limit in requests per second.
pub const DEFAULT_RATE_PER_SEC: f64 = 100.0;

/// Default global burst capacity.
pub const DEFAULT_BURST_SIZE: f64 = 150.0;

/// Default per-client rate limit in requests per second.
pub const DEFAULT_CLIENT_RATE_PER_SEC: f64 = 10.0;

/// Default per-client burst capacity.
pub const DEFAULT_CLIENT_BURST_SIZE: f64 = 20.0;

/// Default bound on distinct per-client buckets.
pub const DEFAULT_MAX_CLIENTS: usize = 1024;

/// Default idle TTL for per-client buckets in seconds.
pub const DEFAULT_CLIENT_IDLE_TTL_SECS: f64 = 300.0;

/// Default cap on healing attempts per trigger key.
pub const DEFAULT_MAX_HEAL_ATTEMPTS: u32 = 3;

/// Default cooldown between healing attempts in seconds.
pub const DEFAULT_HEAL_COOLDOWN_SECS: f64 = 60.0;

/// Default memory percentage above which pressure relief kicks in.
pub const DEFAULT_MEMORY_PRESSURE_THRESHOLD: f64 = 80.0;

/// Default maximum age of registered temp files before cleanup, in seconds.
pub const DEFAULT_TEMP_FILE_MAX_AGE_SECS: f64 = 3600.0;

/// Default watchdog check interval in seconds.
pub const DEFAULT_CHECK_INTERVAL_SECS: f64 = 10.0;

/// Default heartbeat timeout in seconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: f64 = 30.0;

/// Default maximum automatic recovery attempts.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Default minimum spacing between recovery attempts in seconds.
pub const DEFAULT_RESTART_DELAY_SECS: f64 = 5.0;

/// Default cooldown between identical alerts in seconds.
pub const DEFAULT_ALERT_COOLDOWN_SECS: f64 = 300.0;

/// Default health check interval in seconds.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: f64 = 30.0;

/// Default per-health-check timeout in seconds.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: f64 = 10.0;

/// Default grace period for shutdown joins in seconds.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: f64 = 5.0;

/// Metrics sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Whether the sampling loop runs.
    pub enabled: bool,
    /// Seconds between snapshots.
    pub collection_interval_secs: f64,
    /// CPU percentage that triggers the pressure path.
    pub cpu_threshold: f64,
    /// Memory percentage that triggers the pressure path.
    pub memory_threshold: f64,
    /// Disk percentage that triggers a critical alert.
    pub disk_threshold: f64,
    /// Whether to collect the per-process sub-record.
    pub include_process_metrics: bool,
    /// Snapshot ring buffer capacity.
    pub history_size: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collection_interval_secs: DEFAULT_COLLECTION_INTERVAL_SECS,
            cpu_threshold: DEFAULT_CPU_THRESHOLD,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            disk_threshold: DEFAULT_DISK_THRESHOLD,
            include_process_metrics: true,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

impl SamplerConfig {
    /// Collection interval as a [`Duration`].
    #[must_use]
    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs_f64(self.collection_interval_secs.max(0.0))
    }
}

/// Anomaly detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Whether the detection loop runs.
    pub enabled: bool,
    /// Outlier sensitivity in standard deviations.
    pub sensitivity: f64,
    /// Minimum baseline samples before any anomaly is emitted.
    pub min_samples: usize,
    /// Detection window in seconds; the detection loop ticks at a tenth of it.
    pub detection_window_secs: f64,
    /// Relative change multiplier treated as a spike or drop.
    pub spike_threshold: f64,
    /// Trend analysis window in seconds; the slope is fit over a fifth of it.
    pub trend_window_secs: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensitivity: DEFAULT_SENSITIVITY,
            min_samples: DEFAULT_MIN_SAMPLES,
            detection_window_secs: DEFAULT_DETECTION_WINDOW_SECS,
            spike_threshold: DEFAULT_SPIKE_THRESHOLD,
            trend_window_secs: DEFAULT_TREND_WINDOW_SECS,
        }
    }
}

impl DetectorConfig {
    /// Number of trailing samples used for the trend fit.
    #[must_use]
    pub fn trend_samples(&self) -> usize {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let n = (self.trend_window_secs / 5.0).max(0.0) as usize;
        n.max(10)
    }

    /// Period of the detection loop.
    #[must_use]
    pub fn detection_period(&self) -> Duration {
        Duration::from_secs_f64((self.detection_window_secs / 10.0).max(1.0))
    }
}

/// Default settings for circuit breakers created through the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Consecutive successes before a half-open breaker closes.
    pub success_threshold: u32,
    /// Seconds the breaker stays open before admitting probes.
    pub cooldown_secs: f64,
    /// Concurrent probe calls admitted while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            cooldown_secs: DEFAULT_BREAKER_COOLDOWN_SECS,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

impl BreakerConfig {
    /// Open-state cooldown as a [`Duration`].
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs.max(0.0))
    }
}

/// Default settings for rate limiters created through the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Global token refill rate per second.
    pub rate_per_sec: f64,
    /// Global burst capacity.
    pub burst_size: f64,
    /// Whether per-client sub-limits are enforced.
    pub per_client: bool,
    /// Per-client token refill rate per second.
    pub client_rate_per_sec: f64,
    /// Per-client burst capacity.
    pub client_burst_size: f64,
    /// Bound on distinct client buckets; least-recently-used evicted beyond it.
    pub max_clients: usize,
    /// Idle seconds after which a client bucket is swept.
    pub client_idle_ttl_secs: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: DEFAULT_RATE_PER_SEC,
            burst_size: DEFAULT_BURST_SIZE,
            per_client: true,
            client_rate_per_sec: DEFAULT_CLIENT_RATE_PER_SEC,
            client_burst_size: DEFAULT_CLIENT_BURST_SIZE,
            max_clients: DEFAULT_MAX_CLIENTS,
            client_idle_ttl_secs: DEFAULT_CLIENT_IDLE_TTL_SECS,
        }
    }
}

impl LimiterConfig {
    /// Idle TTL for client buckets as a [`Duration`].
    #[must_use]
    pub fn client_idle_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.client_idle_ttl_secs.max(0.0))
    }
}

/// Auto-healer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    /// Whether healing runs at all.
    pub enabled: bool,
    /// Fallback cap on attempts for policies that do not set their own.
    pub max_heal_attempts: u32,
    /// Fallback cooldown for policies and the pressure handlers, seconds.
    pub heal_cooldown_secs: f64,
    /// Whether memory pressure triggers relief actions.
    pub memory_pressure_relief: bool,
    /// Memory percentage above which relief starts.
    pub memory_pressure_threshold: f64,
    /// Whether cache clearing joins the highest relief tier.
    pub cache_clear_on_memory: bool,
    /// Registered temp files older than this many seconds are removed.
    pub temp_file_max_age_secs: f64,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_heal_attempts: DEFAULT_MAX_HEAL_ATTEMPTS,
            heal_cooldown_secs: DEFAULT_HEAL_COOLDOWN_SECS,
            memory_pressure_relief: true,
            memory_pressure_threshold: DEFAULT_MEMORY_PRESSURE_THRESHOLD,
            cache_clear_on_memory: true,
            temp_file_max_age_secs: DEFAULT_TEMP_FILE_MAX_AGE_SECS,
        }
    }
}

impl HealerConfig {
    /// Pressure-handler cooldown as a [`Duration`].
    #[must_use]
    pub fn heal_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.heal_cooldown_secs.max(0.0))
    }

    /// Temp file age cutoff as a [`Duration`].
    #[must_use]
    pub fn temp_file_max_age(&self) -> Duration {
        Duration::from_secs_f64(self.temp_file_max_age_secs.max(0.0))
    }
}

/// Process watchdog configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Whether the watchdog loop runs.
    pub enabled: bool,
    /// Seconds between watchdog checks.
    pub check_interval_secs: f64,
    /// Seconds without a heartbeat before the process counts as unresponsive.
    pub heartbeat_timeout_secs: f64,
    /// Maximum automatic recovery attempts.
    pub max_restarts: u32,
    /// Minimum spacing between recovery attempts, seconds.
    pub restart_delay_secs: f64,
    /// Whether watched tasks are censused each check.
    pub monitor_tasks: bool,
    /// Whether the stalled-set deadlock heuristic runs.
    pub deadlock_detection: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_delay_secs: DEFAULT_RESTART_DELAY_SECS,
            monitor_tasks: true,
            deadlock_detection: true,
        }
    }
}

impl WatchdogConfig {
    /// Check interval as a [`Duration`].
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs.max(0.0))
    }

    /// Heartbeat timeout as a [`Duration`].
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_timeout_secs.max(0.0))
    }

    /// Minimum spacing between recovery attempts as a [`Duration`].
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs_f64(self.restart_delay_secs.max(0.0))
    }
}

/// Alert pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Whether alerts are processed at all.
    pub enabled: bool,
    /// Seconds an identical (level, source, title) alert is suppressed.
    pub cooldown_secs: f64,
    /// Whether suppressed alerts are aggregated (otherwise dropped).
    pub aggregate: bool,
    /// Chat webhook URL (Slack-compatible); presence enables the channel.
    pub slack_webhook_url: Option<String>,
    /// Generic webhook URL; presence enables the channel.
    pub webhook_url: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: DEFAULT_ALERT_COOLDOWN_SECS,
            aggregate: true,
            slack_webhook_url: None,
            webhook_url: None,
        }
    }
}

impl AlertConfig {
    /// Suppression cooldown as a [`Duration`].
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs.max(0.0))
    }
}

/// Health check loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Whether the health check loop runs.
    pub enabled: bool,
    /// Seconds between health check sweeps.
    pub check_interval_secs: f64,
    /// Per-check timeout in seconds; an elapsed check counts as failed.
    pub timeout_secs: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            timeout_secs: DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
        }
    }
}

impl HealthCheckConfig {
    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs.max(0.0))
    }

    /// Per-check timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

/// Top-level runtime configuration.
///
/// Every section carries production defaults; a `MonitorConfig::default()`
/// is immediately usable. Use [`MonitorConfig::from_env`] to overlay
/// `VIGIL_*` environment variables or [`MonitorConfig::from_json_file`]
/// to load a full document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Application name, used in alert metadata.
    pub app_name: String,
    /// Deployment environment label (development, staging, production).
    pub environment: String,
    /// Grace period for joining background loops on shutdown, seconds.
    pub shutdown_grace_secs: f64,
    /// Metrics sampling section.
    pub sampler: SamplerConfig,
    /// Anomaly detection section.
    pub detector: DetectorConfig,
    /// Circuit breaker defaults.
    pub breaker: BreakerConfig,
    /// Rate limiter defaults.
    pub limiter: LimiterConfig,
    /// Auto-healer section.
    pub healer: HealerConfig,
    /// Process watchdog section.
    pub watchdog: WatchdogConfig,
    /// Alert pipeline section.
    pub alerts: AlertConfig,
    /// Health check loop section.
    pub health_check: HealthCheckConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            app_name: "vigil-app".to_string(),
            environment: "development".to_string(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            sampler: SamplerConfig::default(),
            detector: DetectorConfig::default(),
            breaker: BreakerConfig::default(),
            limiter: LimiterConfig::default(),
            healer: HealerConfig::default(),
            watchdog: WatchdogConfig::default(),
            alerts: AlertConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Create a configuration with production defaults and the given app name.
    #[must_use]
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables, starting from defaults.
    ///
    /// A `.env` file is honored if present. Recognized variables:
    /// - `VIGIL_APP_NAME`, `VIGIL_ENVIRONMENT`
    /// - `VIGIL_COLLECTION_INTERVAL_SECS`
    /// - `VIGIL_CPU_THRESHOLD`, `VIGIL_MEMORY_THRESHOLD`, `VIGIL_DISK_THRESHOLD`
    /// - `VIGIL_BREAKER_FAILURE_THRESHOLD`, `VIGIL_BREAKER_COOLDOWN_SECS`
    /// - `VIGIL_RATE_LIMIT_RPS`
    /// - `VIGIL_ALERT_COOLDOWN_SECS`
    /// - `VIGIL_SLACK_WEBHOOK` (sets and enables the chat webhook channel)
    /// - `VIGIL_WEBHOOK_URL` (sets and enables the generic webhook channel)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a variable is set but
    /// cannot be parsed. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let mut config = Self::default();

        if let Ok(name) = std::env::var("VIGIL_APP_NAME") {
            config.app_name = name;
        }
        if let Ok(env_name) = std::env::var("VIGIL_ENVIRONMENT") {
            config.environment = env_name;
        }

        config.sampler.collection_interval_secs = parse_env_f64(
            "VIGIL_COLLECTION_INTERVAL_SECS",
            config.sampler.collection_interval_secs,
        )?;
        config.sampler.cpu_threshold =
            parse_env_f64("VIGIL_CPU_THRESHOLD", config.sampler.cpu_threshold)?;
        config.sampler.memory_threshold =
            parse_env_f64("VIGIL_MEMORY_THRESHOLD", config.sampler.memory_threshold)?;
        config.sampler.disk_threshold =
            parse_env_f64("VIGIL_DISK_THRESHOLD", config.sampler.disk_threshold)?;

        config.breaker.failure_threshold = parse_env_u32(
            "VIGIL_BREAKER_FAILURE_THRESHOLD",
            config.breaker.failure_threshold,
        )?;
        config.breaker.cooldown_secs =
            parse_env_f64("VIGIL_BREAKER_COOLDOWN_SECS", config.breaker.cooldown_secs)?;

        config.limiter.rate_per_sec =
            parse_env_f64("VIGIL_RATE_LIMIT_RPS", config.limiter.rate_per_sec)?;

        config.alerts.cooldown_secs =
            parse_env_f64("VIGIL_ALERT_COOLDOWN_SECS", config.alerts.cooldown_secs)?;

        if let Ok(url) = std::env::var("VIGIL_SLACK_WEBHOOK") {
            if !url.is_empty() {
                config.alerts.slack_webhook_url = Some(url);
            }
        }
        if let Ok(url) = std::env::var("VIGIL_WEBHOOK_URL") {
            if !url.is_empty() {
                config.alerts.webhook_url = Some(url);
            }
        }

        Ok(config)
    }

    /// Load configuration from a JSON file.
    ///
    /// Missing fields fall back to their defaults, so partial documents are
    /// accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be read and
    /// [`ConfigError::FileParse`] if it is not valid JSON.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&contents).map_err(|e| ConfigError::FileParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Check the configuration and return every problem found.
    ///
    /// An empty vector means the configuration is valid. The runtime logs
    /// these at startup and proceeds with per-field defaults (see
    /// [`MonitorConfig::sanitized`]); the embedding application may instead
    /// choose to abort on a non-empty result.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for (name, value) in [
            ("sampler.cpu_threshold", self.sampler.cpu_threshold),
            ("sampler.memory_threshold", self.sampler.memory_threshold),
            ("sampler.disk_threshold", self.sampler.disk_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                issues.push(format!("{name} must be between 0 and 100 (got {value})"));
            }
        }

        if self.sampler.collection_interval_secs < 1.0 {
            issues.push(format!(
                "sampler.collection_interval_secs must be >= 1 (got {})",
                self.sampler.collection_interval_secs
            ));
        }
        if self.sampler.history_size == 0 {
            issues.push("sampler.history_size must be >= 1".to_string());
        }

        if self.detector.sensitivity <= 0.0 {
            issues.push(format!(
                "detector.sensitivity must be > 0 (got {})",
                self.detector.sensitivity
            ));
        }
        if self.detector.min_samples == 0 {
            issues.push("detector.min_samples must be >= 1".to_string());
        }
        if self.detector.spike_threshold <= 0.0 {
            issues.push(format!(
                "detector.spike_threshold must be > 0 (got {})",
                self.detector.spike_threshold
            ));
        }

        if self.breaker.failure_threshold < 1 {
            issues.push("breaker.failure_threshold must be >= 1".to_string());
        }
        if self.breaker.success_threshold < 1 {
            issues.push("breaker.success_threshold must be >= 1".to_string());
        }
        if self.breaker.cooldown_secs < 1.0 {
            issues.push(format!(
                "breaker.cooldown_secs must be >= 1 (got {})",
                self.breaker.cooldown_secs
            ));
        }
        if self.breaker.half_open_max_calls < 1 {
            issues.push("breaker.half_open_max_calls must be >= 1".to_string());
        }

        if self.limiter.rate_per_sec <= 0.0 {
            issues.push(format!(
                "limiter.rate_per_sec must be > 0 (got {})",
                self.limiter.rate_per_sec
            ));
        }
        if self.limiter.burst_size < 1.0 {
            issues.push(format!(
                "limiter.burst_size must be >= 1 (got {})",
                self.limiter.burst_size
            ));
        }
        if self.limiter.per_client && self.limiter.client_rate_per_sec <= 0.0 {
            issues.push(format!(
                "limiter.client_rate_per_sec must be > 0 (got {})",
                self.limiter.client_rate_per_sec
            ));
        }
        if self.limiter.max_clients == 0 {
            issues.push("limiter.max_clients must be >= 1".to_string());
        }

        if self.healer.max_heal_attempts < 1 {
            issues.push("healer.max_heal_attempts must be >= 1".to_string());
        }
        if !(0.0..=100.0).contains(&self.healer.memory_pressure_threshold) {
            issues.push(format!(
                "healer.memory_pressure_threshold must be between 0 and 100 (got {})",
                self.healer.memory_pressure_threshold
            ));
        }

        if self.watchdog.check_interval_secs < 1.0 {
            issues.push(format!(
                "watchdog.check_interval_secs must be >= 1 (got {})",
                self.watchdog.check_interval_secs
            ));
        }
        if self.watchdog.heartbeat_timeout_secs < 1.0 {
            issues.push(format!(
                "watchdog.heartbeat_timeout_secs must be >= 1 (got {})",
                self.watchdog.heartbeat_timeout_secs
            ));
        }

        if self.alerts.cooldown_secs < 0.0 {
            issues.push(format!(
                "alerts.cooldown_secs must be >= 0 (got {})",
                self.alerts.cooldown_secs
            ));
        }

        if self.health_check.check_interval_secs < 1.0 {
            issues.push(format!(
                "health_check.check_interval_secs must be >= 1 (got {})",
                self.health_check.check_interval_secs
            ));
        }

        if self.shutdown_grace_secs < 0.0 {
            issues.push(format!(
                "shutdown_grace_secs must be >= 0 (got {})",
                self.shutdown_grace_secs
            ));
        }

        issues
    }

    /// Return a copy with every invalid field replaced by its default,
    /// together with the list of issues that were fixed.
    ///
    /// The replacement granularity is the whole section: a section with any
    /// invalid field reverts to that section's defaults, which keeps
    /// interdependent values (rate and burst, thresholds and tiers)
    /// consistent.
    #[must_use]
    pub fn sanitized(&self) -> (Self, Vec<String>) {
        let issues = self.validate();
        if issues.is_empty() {
            return (self.clone(), issues);
        }

        let mut fixed = self.clone();
        for issue in &issues {
            if issue.starts_with("sampler.") {
                fixed.sampler = SamplerConfig::default();
            } else if issue.starts_with("detector.") {
                fixed.detector = DetectorConfig::default();
            } else if issue.starts_with("breaker.") {
                fixed.breaker = BreakerConfig::default();
            } else if issue.starts_with("limiter.") {
                fixed.limiter = LimiterConfig::default();
            } else if issue.starts_with("healer.") {
                fixed.healer = HealerConfig::default();
            } else if issue.starts_with("watchdog.") {
                fixed.watchdog = WatchdogConfig::default();
            } else if issue.starts_with("alerts.") {
                fixed.alerts = AlertConfig::default();
            } else if issue.starts_with("health_check.") {
                fixed.health_check = HealthCheckConfig::default();
            } else if issue.starts_with("shutdown_grace_secs") {
                fixed.shutdown_grace_secs = DEFAULT_SHUTDOWN_GRACE_SECS;
            }
        }
        (fixed, issues)
    }

    /// Shutdown grace as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_secs.max(0.0))
    }
}

/// Parse an environment variable as f64, using a default if not set.
fn parse_env_f64(name: &str, default: f64) -> Result<f64, ConfigError> {
    std::env::var(name).map_or(Ok(default), |val| {
        val.parse().map_err(|_| ConfigError::InvalidValue {
            variable: name.into(),
            message: "must be a number".into(),
        })
    })
}

/// Parse an environment variable as u32, using a default if not set.
fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    std::env::var(name).map_or(Ok(default), |val| {
        val.parse().map_err(|_| ConfigError::InvalidValue {
            variable: name.into(),
            message: "must be a positive integer".into(),
        })
    })
}
