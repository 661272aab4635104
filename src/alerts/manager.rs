//! Alert records, deduplication and async channel dispatch.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::error::AlertError;
use crate::traits::{AlertChannel, Clock, SystemClock};

const HISTORY_SIZE: usize = 10_000;
const QUEUE_SIZE: usize = 1000;
const AGGREGATE_SAMPLES: usize = 10;
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
const DEFAULT_SOURCE: &str = "vigil";

/// Alert urgency, least to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Diagnostic detail, normally filtered out downstream.
    Debug,
    /// Routine lifecycle information.
    Info,
    /// Something needs attention soon.
    Warning,
    /// Something went wrong and needs attention.
    Error,
    /// Something needs attention now.
    Critical,
}

impl AlertLevel {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One alert as recorded in history and handed to channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Deterministic short id derived from level, title, source and time.
    pub id: String,
    /// Urgency.
    pub level: AlertLevel,
    /// Short headline.
    pub title: String,
    /// Full description.
    pub message: String,
    /// Component that raised the alert, e.g. `vigil.breaker`.
    pub source: String,
    /// When the alert was first raised.
    pub timestamp: DateTime<Utc>,
    /// Free-form labels attached by the caller.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Structured context attached by the caller.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Set once an operator acknowledged the alert.
    pub acknowledged: bool,
    /// Who acknowledged it.
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    /// When it was acknowledged.
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Times this alert fired inside its suppression window.
    pub count: u32,
    /// Channels that accepted delivery.
    pub sent_to: Vec<String>,
}

/// Deterministic 12-hex-digit alert id.
fn alert_id(level: AlertLevel, title: &str, source: &str, timestamp: DateTime<Utc>) -> String {
    let seed = format!("{level}:{title}:{source}:{}", timestamp.to_rfc3339());
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes());
    let mut hex = uuid.simple().to_string();
    hex.truncate(12);
    hex
}

/// Suppressed repeats of one alert key, kept for later inspection.
#[derive(Debug, Clone, Serialize)]
pub struct AlertAggregate {
    /// Suppression key: `level:source:title`.
    pub key: String,
    /// Total fires including the dispatched first one.
    pub count: u32,
    /// When the first alert of the run fired.
    pub first_at: DateTime<Utc>,
    /// When the latest repeat fired.
    pub last_at: DateTime<Utc>,
    /// Up to ten representative alerts.
    pub samples: Vec<Alert>,
}

/// History filter for [`AlertManager::history`].
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    /// At most this many alerts, newest kept.
    pub limit: Option<usize>,
    /// Only alerts at or above this level.
    pub min_level: Option<AlertLevel>,
    /// Only alerts whose source contains this substring.
    pub source_contains: Option<String>,
    /// Only alerts raised at or after this time.
    pub since: Option<DateTime<Utc>>,
}

/// Counters over the alert pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertStats {
    /// Sends, including suppressed repeats.
    pub total_raised: u64,
    /// Repeats absorbed by the suppression window.
    pub suppressed: u64,
    /// Debug alerts in history.
    pub debug_count: usize,
    /// Info alerts in history.
    pub info_count: usize,
    /// Warning alerts in history.
    pub warning_count: usize,
    /// Error alerts in history.
    pub error_count: usize,
    /// Critical alerts in history.
    pub critical_count: usize,
    /// History counts per source.
    pub by_source: HashMap<String, usize>,
    /// Alerts raised in the trailing 24 hours.
    pub last_24h: usize,
    /// Alerts nobody acknowledged yet.
    pub unacknowledged: usize,
    /// Alerts queued for delivery but not yet dispatched.
    pub queued: usize,
}

struct AlertState {
    history: VecDeque<Alert>,
    last_fired: HashMap<String, (Instant, String)>,
    aggregates: HashMap<String, AlertAggregate>,
    total_raised: u64,
    suppressed: u64,
}

type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;

/// Deduplicating alert pipeline with asynchronous channel delivery.
///
/// Raising an alert is synchronous and cheap: the alert is recorded,
/// registered callbacks run, and the alert is queued for the dispatch
/// worker. The worker, started with [`AlertManager::start_dispatch`]
/// inside a tokio runtime, delivers to every registered
/// [`AlertChannel`] and appends the names that accepted to `sent_to`.
///
/// An identical `(level, source, title)` send inside the cooldown is not
/// dispatched again: it returns `None`, grows the original's `count` and
/// is filed under its [`AlertAggregate`].
pub struct AlertManager {
    config: AlertConfig,
    clock: Arc<dyn Clock>,
    channels: Arc<RwLock<Vec<Arc<dyn AlertChannel>>>>,
    callbacks: RwLock<Vec<AlertCallback>>,
    state: Arc<RwLock<AlertState>>,
    queued: Arc<AtomicUsize>,
    tx: Mutex<Option<mpsc::Sender<Alert>>>,
    rx: Mutex<Option<mpsc::Receiver<Alert>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for an alert with tags and structured metadata.
///
/// Finish with [`AlertDraft::send`].
#[must_use]
pub struct AlertDraft<'a> {
    manager: &'a AlertManager,
    level: AlertLevel,
    title: String,
    message: String,
    source: String,
    tags: Vec<String>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl AlertDraft<'_> {
    /// Set the full description.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Set the raising component.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Attach a label.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Attach one structured context entry.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Record and dispatch the alert.
    ///
    /// Returns `None` when an identical alert is still inside its
    /// suppression window.
    pub fn send(self) -> Option<Alert> {
        self.manager.dispatch(
            self.level,
            &self.title,
            &self.message,
            &self.source,
            self.tags,
            self.metadata,
        )
    }
}

impl AlertManager {
    /// Create a manager on the system clock.
    #[must_use]
    pub fn new(config: AlertConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a manager with an explicit clock, for deterministic tests.
    #[must_use]
    pub fn with_clock(config: AlertConfig, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        Self {
            config,
            clock,
            channels: Arc::new(RwLock::new(Vec::new())),
            callbacks: RwLock::new(Vec::new()),
            state: Arc::new(RwLock::new(AlertState {
                history: VecDeque::new(),
                last_fired: HashMap::new(),
                aggregates: HashMap::new(),
                total_raised: 0,
                suppressed: 0,
            })),
            queued: Arc::new(AtomicUsize::new(0)),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Register a delivery channel.
    pub fn add_channel(&self, channel: Arc<dyn AlertChannel>) {
        let mut channels = match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::info!(channel = channel.name(), "alert channel registered");
        channels.push(channel);
    }

    /// Register a synchronous callback invoked for every dispatched alert.
    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        let mut callbacks = match self.callbacks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        callbacks.push(Box::new(callback));
    }

    /// Start the background dispatch worker.
    ///
    /// Must be called inside a tokio runtime. Calling it twice is a no-op.
    pub fn start_dispatch(&self) {
        let mut dispatcher = self.lock_dispatcher();
        if dispatcher.is_some() {
            return;
        }
        let Some(mut rx) = self.take_rx() else {
            return;
        };
        let channels = self.channels.clone();
        let state = self.state.clone();
        let queued = self.queued.clone();
        *dispatcher = Some(tokio::spawn(async move {
            while let Some(alert) = rx.recv().await {
                let targets: Vec<Arc<dyn AlertChannel>> = {
                    let guard = match channels.read() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard.clone()
                };
                let mut delivered = Vec::new();
                for channel in targets {
                    match channel.deliver(alert.clone()).await {
                        Ok(()) => delivered.push(channel.name().to_string()),
                        Err(error) => {
                            tracing::error!(
                                channel = channel.name(),
                                alert = %alert.id,
                                %error,
                                "alert delivery failed"
                            );
                        }
                    }
                }
                if !delivered.is_empty() {
                    let mut state = match state.write() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if let Some(entry) =
                        state.history.iter_mut().rev().find(|a| a.id == alert.id)
                    {
                        entry.sent_to.extend(delivered);
                    }
                }
                queued.fetch_sub(1, Ordering::Relaxed);
            }
            tracing::debug!("alert dispatch worker stopped");
        }));
    }

    /// Begin building an alert with tags and metadata.
    pub fn alert(&self, level: AlertLevel, title: impl Into<String>) -> AlertDraft<'_> {
        AlertDraft {
            manager: self,
            level,
            title: title.into(),
            message: String::new(),
            source: DEFAULT_SOURCE.to_string(),
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Record and dispatch an alert.
    ///
    /// Returns `None` when an identical `(level, source, title)` alert is
    /// still inside its suppression window; the repeat is aggregated
    /// instead of dispatched.
    pub fn raise_alert(
        &self,
        level: AlertLevel,
        title: &str,
        message: &str,
        source: &str,
    ) -> Option<Alert> {
        self.dispatch(level, title, message, source, Vec::new(), serde_json::Map::new())
    }

    fn dispatch(
        &self,
        level: AlertLevel,
        title: &str,
        message: &str,
        source: &str,
        tags: Vec<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Option<Alert> {
        let now = self.clock.now();
        let key = format!("{level}:{source}:{title}");

        let alert = {
            let mut state = self.write_state();
            state.total_raised += 1;

            let suppressed = state
                .last_fired
                .get(&key)
                .is_some_and(|(at, _)| now.saturating_duration_since(*at) < self.config.cooldown());
            if suppressed {
                state.suppressed += 1;
                let existing_id = state
                    .last_fired
                    .get(&key)
                    .map(|(_, id)| id.clone())
                    .unwrap_or_default();
                let repeat = state
                    .history
                    .iter_mut()
                    .rev()
                    .find(|a| a.id == existing_id)
                    .map(|entry| {
                        entry.count += 1;
                        entry.clone()
                    });
                if let Some(repeat) = repeat {
                    if self.config.aggregate {
                        Self::note_aggregate(&mut state, &key, &repeat);
                    }
                    tracing::debug!(alert = %repeat.id, count = repeat.count, "alert suppressed");
                    return None;
                }
                // History was cleared mid-window; fall through as fresh
            }

            let timestamp = Utc::now();
            let alert = Alert {
                id: alert_id(level, title, source, timestamp),
                level,
                title: title.to_string(),
                message: message.to_string(),
                source: source.to_string(),
                timestamp,
                tags,
                metadata,
                acknowledged: false,
                acknowledged_by: None,
                acknowledged_at: None,
                count: 1,
                sent_to: Vec::new(),
            };
            state.last_fired.insert(key.clone(), (now, alert.id.clone()));
            state.history.push_back(alert.clone());
            while state.history.len() > HISTORY_SIZE {
                state.history.pop_front();
            }
            // A fresh dispatch starts a new aggregation run for its key
            state.aggregates.remove(&key);
            alert
        };

        tracing::info!(
            alert = %alert.id,
            level = %alert.level,
            source = %alert.source,
            title = %alert.title,
            "alert raised"
        );

        {
            let callbacks = match self.callbacks.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for callback in callbacks.iter() {
                callback(&alert);
            }
        }

        if self.config.enabled && self.has_channels() {
            if let Err(error) = self.enqueue(alert.clone()) {
                tracing::warn!(alert = %alert.id, %error, "alert not queued for delivery");
            }
        }
        Some(alert)
    }

    /// Mark an alert acknowledged by `by`. Returns `false` for an
    /// unknown id.
    pub fn acknowledge(&self, id: &str, by: &str) -> bool {
        let mut state = self.write_state();
        match state.history.iter_mut().rev().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                alert.acknowledged_by = Some(by.to_string());
                alert.acknowledged_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Alerts nobody acknowledged yet, oldest first, optionally at or
    /// above a level.
    #[must_use]
    pub fn unacknowledged(&self, min_level: Option<AlertLevel>) -> Vec<Alert> {
        let state = self.read_state();
        state
            .history
            .iter()
            .filter(|a| !a.acknowledged)
            .filter(|a| min_level.is_none_or(|min| a.level >= min))
            .cloned()
            .collect()
    }

    /// History matching `query`, oldest first.
    #[must_use]
    pub fn history(&self, query: &AlertQuery) -> Vec<Alert> {
        let state = self.read_state();
        let filtered: Vec<Alert> = state
            .history
            .iter()
            .filter(|a| query.min_level.is_none_or(|min| a.level >= min))
            .filter(|a| {
                query
                    .source_contains
                    .as_ref()
                    .is_none_or(|needle| a.source.contains(needle.as_str()))
            })
            .filter(|a| query.since.is_none_or(|since| a.timestamp >= since))
            .cloned()
            .collect();
        let take = query.limit.unwrap_or(filtered.len()).min(filtered.len());
        filtered[filtered.len() - take..].to_vec()
    }

    /// The most recent `limit` alerts, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.history(&AlertQuery {
            limit: Some(limit),
            ..AlertQuery::default()
        })
    }

    /// Current aggregates of suppressed repeats.
    #[must_use]
    pub fn aggregates(&self) -> Vec<AlertAggregate> {
        let state = self.read_state();
        state.aggregates.values().cloned().collect()
    }

    /// Pipeline counters.
    #[must_use]
    pub fn stats(&self) -> AlertStats {
        let state = self.read_state();
        let mut debug_count = 0;
        let mut info_count = 0;
        let mut warning_count = 0;
        let mut error_count = 0;
        let mut critical_count = 0;
        let mut unacknowledged = 0;
        let mut by_source: HashMap<String, usize> = HashMap::new();
        let mut last_24h = 0;
        let day_ago = Utc::now() - chrono::Duration::hours(24);
        for alert in &state.history {
            match alert.level {
                AlertLevel::Debug => debug_count += 1,
                AlertLevel::Info => info_count += 1,
                AlertLevel::Warning => warning_count += 1,
                AlertLevel::Error => error_count += 1,
                AlertLevel::Critical => critical_count += 1,
            }
            if !alert.acknowledged {
                unacknowledged += 1;
            }
            *by_source.entry(alert.source.clone()).or_default() += 1;
            if alert.timestamp >= day_ago {
                last_24h += 1;
            }
        }
        AlertStats {
            total_raised: state.total_raised,
            suppressed: state.suppressed,
            debug_count,
            info_count,
            warning_count,
            error_count,
            critical_count,
            by_source,
            last_24h,
            unacknowledged,
            queued: self.queued.load(Ordering::Relaxed),
        }
    }

    /// Drop history, aggregates and suppression bookkeeping.
    pub fn clear_history(&self) {
        let mut state = self.write_state();
        state.history.clear();
        state.aggregates.clear();
        state.last_fired.clear();
    }

    /// Stop accepting deliveries and drain the dispatch worker.
    ///
    /// Alerts already queued are still delivered, bounded by a short
    /// drain timeout. Raising after shutdown still records history.
    pub async fn shutdown(&self) {
        {
            let mut tx = match self.tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            tx.take();
        }
        let handle = self.lock_dispatcher().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_DRAIN, handle).await.is_err() {
                tracing::warn!("alert dispatch worker did not drain in time");
            }
        }
    }

    fn has_channels(&self) -> bool {
        let channels = match self.channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        !channels.is_empty()
    }

    fn enqueue(&self, alert: Alert) -> Result<(), AlertError> {
        let tx = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(tx) = tx.as_ref() else {
            return Err(AlertError::QueueClosed);
        };
        tx.try_send(alert).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => AlertError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => AlertError::QueueClosed,
        })?;
        self.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn note_aggregate(state: &mut AlertState, key: &str, repeat: &Alert) {
        let entry = state
            .aggregates
            .entry(key.to_string())
            .or_insert_with(|| AlertAggregate {
                key: key.to_string(),
                count: 1,
                first_at: repeat.timestamp,
                last_at: repeat.timestamp,
                samples: Vec::new(),
            });
        entry.count += 1;
        entry.last_at = Utc::now();
        if entry.samples.len() < AGGREGATE_SAMPLES {
            entry.samples.push(repeat.clone());
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, AlertState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("alert state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, AlertState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("alert state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn lock_dispatcher(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.dispatcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take_rx(&self) -> Option<mpsc::Receiver<Alert>> {
        let mut rx = match self.rx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rx.take()
    }
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::traits::{ManualClock, MockAlertChannel};
    use pretty_assertions::assert_eq;

    fn manager_with_clock() -> (AlertManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let manager = AlertManager::with_clock(AlertConfig::default(), clock.clone());
        (manager, clock)
    }

    #[test]
    fn test_alert_id_is_deterministic() {
        let ts = Utc::now();
        let a = alert_id(AlertLevel::Warning, "High CPU", "vigil.runtime", ts);
        let b = alert_id(AlertLevel::Warning, "High CPU", "vigil.runtime", ts);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let c = alert_id(AlertLevel::Critical, "High CPU", "vigil.runtime", ts);
        assert_ne!(a, c);
    }

    #[test]
    fn test_raise_records_history() {
        let (manager, _clock) = manager_with_clock();
        let alert = manager
            .raise_alert(AlertLevel::Warning, "High CPU usage", "cpu at 91%", "vigil.runtime")
            .expect("fresh alert");
        assert_eq!(alert.count, 1);
        assert!(!alert.acknowledged);

        let history = manager.recent(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, alert.id);
    }

    #[test]
    fn test_duplicate_within_cooldown_is_suppressed() {
        let (manager, clock) = manager_with_clock();
        let first = manager
            .raise_alert(AlertLevel::Warning, "High CPU", "91%", "vigil.runtime")
            .expect("fresh alert");
        clock.advance(Duration::from_secs(30));
        let second = manager.raise_alert(AlertLevel::Warning, "High CPU", "93%", "vigil.runtime");

        assert!(second.is_none());
        let history = manager.recent(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, first.id);
        assert_eq!(history[0].count, 2);

        let aggregates = manager.aggregates();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].count, 2);

        let stats = manager.stats();
        assert_eq!(stats.total_raised, 2);
        assert_eq!(stats.suppressed, 1);
    }

    #[test]
    fn test_new_alert_after_cooldown() {
        let (manager, clock) = manager_with_clock();
        let first = manager
            .raise_alert(AlertLevel::Warning, "High CPU", "91%", "vigil.runtime")
            .expect("fresh alert");
        clock.advance(Duration::from_secs(301));
        let second = manager
            .raise_alert(AlertLevel::Warning, "High CPU", "95%", "vigil.runtime")
            .expect("fresh after cooldown");

        assert_ne!(second.id, first.id);
        assert_eq!(second.count, 1);
        assert_eq!(manager.recent(10).len(), 2);
        // The new dispatch starts a fresh aggregation run
        assert!(manager.aggregates().is_empty());
    }

    #[test]
    fn test_different_keys_do_not_suppress_each_other() {
        let (manager, _clock) = manager_with_clock();
        assert!(manager.raise_alert(AlertLevel::Warning, "High CPU", "a", "vigil.runtime").is_some());
        assert!(manager.raise_alert(AlertLevel::Critical, "High CPU", "b", "vigil.runtime").is_some());
        assert!(manager.raise_alert(AlertLevel::Warning, "High memory", "c", "vigil.runtime").is_some());
        assert!(manager.raise_alert(AlertLevel::Warning, "High CPU", "d", "vigil.healer").is_some());
        assert_eq!(manager.recent(10).len(), 4);
    }

    #[test]
    fn test_aggregate_collects_suppressed_repeats() {
        let (manager, clock) = manager_with_clock();
        manager.raise_alert(AlertLevel::Warning, "High CPU", "91%", "vigil.runtime");
        for _ in 0..14 {
            clock.advance(Duration::from_secs(1));
            manager.raise_alert(AlertLevel::Warning, "High CPU", "still high", "vigil.runtime");
        }

        let aggregates = manager.aggregates();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].key, "warning:vigil.runtime:High CPU");
        assert_eq!(aggregates[0].count, 15);
        assert_eq!(aggregates[0].samples.len(), AGGREGATE_SAMPLES);
    }

    #[test]
    fn test_builder_tags_and_metadata() {
        let (manager, _clock) = manager_with_clock();
        let alert = manager
            .alert(AlertLevel::Critical, "Disk full")
            .message("disk at 98.5%")
            .source("vigil.runtime")
            .tag("storage")
            .tag("urgent")
            .meta("disk_percent", 98.5)
            .send()
            .expect("fresh alert");

        assert_eq!(alert.tags, vec!["storage".to_string(), "urgent".to_string()]);
        assert_eq!(
            alert.metadata.get("disk_percent"),
            Some(&serde_json::json!(98.5))
        );
    }

    #[test]
    fn test_acknowledge_records_operator() {
        let (manager, _clock) = manager_with_clock();
        let alert = manager
            .raise_alert(AlertLevel::Critical, "Disk full", "98%", "vigil.runtime")
            .expect("fresh alert");
        assert_eq!(manager.unacknowledged(None).len(), 1);

        assert!(manager.acknowledge(&alert.id, "oncall"));
        assert!(manager.unacknowledged(None).is_empty());
        let history = manager.recent(10);
        assert_eq!(history[0].acknowledged_by.as_deref(), Some("oncall"));
        assert!(history[0].acknowledged_at.is_some());
        assert!(!manager.acknowledge("no-such-id", "oncall"));
    }

    #[test]
    fn test_unacknowledged_min_level() {
        let (manager, _clock) = manager_with_clock();
        manager.raise_alert(AlertLevel::Info, "Started", "", "vigil.runtime");
        manager.raise_alert(AlertLevel::Warning, "High CPU", "", "vigil.runtime");
        manager.raise_alert(AlertLevel::Critical, "Disk full", "", "vigil.runtime");

        assert_eq!(manager.unacknowledged(None).len(), 3);
        assert_eq!(manager.unacknowledged(Some(AlertLevel::Warning)).len(), 2);
        assert_eq!(manager.unacknowledged(Some(AlertLevel::Critical)).len(), 1);
    }

    #[test]
    fn test_history_filters() {
        let (manager, _clock) = manager_with_clock();
        manager.raise_alert(AlertLevel::Info, "Started", "", "vigil.runtime");
        manager.raise_alert(AlertLevel::Warning, "High CPU", "", "vigil.runtime");
        manager.raise_alert(AlertLevel::Critical, "Breaker open", "", "vigil.breaker");

        assert_eq!(manager.recent(2).len(), 2);

        let warnings_up = manager.history(&AlertQuery {
            min_level: Some(AlertLevel::Warning),
            ..AlertQuery::default()
        });
        assert_eq!(warnings_up.len(), 2);

        let breaker_only = manager.history(&AlertQuery {
            source_contains: Some("breaker".to_string()),
            ..AlertQuery::default()
        });
        assert_eq!(breaker_only.len(), 1);
        assert_eq!(breaker_only[0].title, "Breaker open");

        let future_only = manager.history(&AlertQuery {
            since: Some(Utc::now() + chrono::Duration::hours(1)),
            ..AlertQuery::default()
        });
        assert!(future_only.is_empty());
    }

    #[test]
    fn test_stats_by_level_and_source() {
        let (manager, _clock) = manager_with_clock();
        manager.raise_alert(AlertLevel::Debug, "t", "", "vigil.runtime");
        manager.raise_alert(AlertLevel::Info, "a", "", "vigil.runtime");
        manager.raise_alert(AlertLevel::Warning, "b", "", "vigil.runtime");
        manager.raise_alert(AlertLevel::Warning, "c", "", "vigil.healer");
        manager.raise_alert(AlertLevel::Error, "e", "", "vigil.healer");
        manager.raise_alert(AlertLevel::Critical, "d", "", "vigil.watchdog");

        let stats = manager.stats();
        assert_eq!(stats.debug_count, 1);
        assert_eq!(stats.info_count, 1);
        assert_eq!(stats.warning_count, 2);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.critical_count, 1);
        assert_eq!(stats.unacknowledged, 6);
        assert_eq!(stats.last_24h, 6);
        assert_eq!(stats.by_source.get("vigil.runtime"), Some(&3));
        assert_eq!(stats.by_source.get("vigil.healer"), Some(&2));
    }

    #[test]
    fn test_callbacks_fire_for_dispatched_alerts_only() {
        let (manager, clock) = manager_with_clock();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_alert(move |alert| {
            sink.lock().unwrap().push(alert.title.clone());
        });

        manager.raise_alert(AlertLevel::Warning, "High CPU", "", "vigil.runtime");
        clock.advance(Duration::from_secs(5));
        manager.raise_alert(AlertLevel::Warning, "High CPU", "", "vigil.runtime");

        assert_eq!(seen.lock().unwrap().as_slice(), &["High CPU".to_string()]);
    }

    #[test]
    fn test_clear_history() {
        let (manager, clock) = manager_with_clock();
        manager.raise_alert(AlertLevel::Info, "a", "", "s");
        clock.advance(Duration::from_secs(1));
        manager.raise_alert(AlertLevel::Info, "a", "", "s");
        manager.clear_history();
        assert!(manager.recent(10).is_empty());
        assert!(manager.aggregates().is_empty());
    }

    #[test]
    fn test_level_ordering() {
        assert!(AlertLevel::Debug < AlertLevel::Info);
        assert!(AlertLevel::Info < AlertLevel::Warning);
        assert!(AlertLevel::Warning < AlertLevel::Error);
        assert!(AlertLevel::Error < AlertLevel::Critical);
    }

    #[tokio::test]
    async fn test_dispatch_delivers_to_channels() {
        let (manager, _clock) = manager_with_clock();

        let mut channel = MockAlertChannel::new();
        channel.expect_name().return_const("mock".to_string());
        channel.expect_deliver().times(1).returning(|_| Ok(()));
        manager.add_channel(Arc::new(channel));
        manager.start_dispatch();

        let alert = manager
            .raise_alert(AlertLevel::Critical, "Disk full", "98%", "vigil.runtime")
            .expect("fresh alert");

        // Let the worker deliver and record the channel
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if manager.recent(1)[0].sent_to == vec!["mock".to_string()] {
                break;
            }
        }
        let history = manager.recent(1);
        assert_eq!(history[0].id, alert.id);
        assert_eq!(history[0].sent_to, vec!["mock".to_string()]);
        assert_eq!(manager.stats().queued, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_survives_channel_failure() {
        let (manager, _clock) = manager_with_clock();

        let mut failing = MockAlertChannel::new();
        failing.expect_name().return_const("bad".to_string());
        failing.expect_deliver().returning(|_| {
            Err(AlertError::ChannelFailed {
                channel: "bad".to_string(),
                message: "connection refused".to_string(),
            })
        });
        let mut working = MockAlertChannel::new();
        working.expect_name().return_const("good".to_string());
        working.expect_deliver().returning(|_| Ok(()));

        manager.add_channel(Arc::new(failing));
        manager.add_channel(Arc::new(working));
        manager.start_dispatch();

        manager.raise_alert(AlertLevel::Warning, "High CPU", "", "vigil.runtime");

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !manager.recent(1)[0].sent_to.is_empty() {
                break;
            }
        }
        assert_eq!(manager.recent(1)[0].sent_to, vec!["good".to_string()]);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_raise_after_shutdown_still_records() {
        let (manager, _clock) = manager_with_clock();
        manager.start_dispatch();
        manager.shutdown().await;

        let alert = manager.raise_alert(AlertLevel::Info, "Late", "", "vigil.runtime");
        assert!(alert.is_some());
        assert_eq!(manager.recent(10).len(), 1);
    }
}
