//! Policy-driven corrective actions for detected anomalies.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alerts::{AlertLevel, AlertManager};
use crate::config::HealerConfig;
use crate::detect::{Anomaly, AnomalyKind};
use crate::metrics::current_process_stats;
use crate::traits::{Clearable, Clock, Resettable, SystemClock};

const MAX_HISTORY: usize = 200;
/// CPU percentage at or above which the CPU pressure handler acts.
pub const CPU_PRESSURE_LIMIT: f64 = 90.0;
/// Memory percentage selecting the full hooks + caches + trim tier.
pub const FULL_RELIEF_LIMIT: f64 = 95.0;
/// Memory percentage selecting the all-hooks tier.
pub const HOOK_RELIEF_LIMIT: f64 = 90.0;

const MEMORY_PRESSURE_KEY: &str = "pressure:memory";
const CPU_PRESSURE_KEY: &str = "pressure:cpu";

/// One corrective action the healer can execute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealActionKind {
    /// Run every registered memory reclaim hook.
    ReleaseMemory,
    /// Clear every registered cache, summing released entries.
    ClearCaches,
    /// Reset every registered pool.
    ResetPools,
    /// Prune dead entries from the task registry via the census hook.
    CleanupThreads,
    /// Memory hooks, cache clears and a best-effort allocator trim.
    TrimMemory,
    /// Remove stale files from registered temp directories.
    CleanupTempFiles,
    /// A host-registered handler, looked up by name.
    Custom(String),
}

impl std::fmt::Display for HealActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReleaseMemory => f.write_str("release_memory"),
            Self::ClearCaches => f.write_str("clear_caches"),
            Self::ResetPools => f.write_str("reset_pools"),
            Self::CleanupThreads => f.write_str("cleanup_threads"),
            Self::TrimMemory => f.write_str("trim_memory"),
            Self::CleanupTempFiles => f.write_str("cleanup_temp_files"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// What an executed action achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealOutcome {
    /// The action completed and did its work.
    Success,
    /// Some of the action's steps worked.
    Partial,
    /// The action ran and failed.
    Failed,
    /// The action had nothing to act on, e.g. no hook registered.
    Skipped,
}

impl HealOutcome {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Record of one executed corrective action.
#[derive(Debug, Clone, Serialize)]
pub struct HealRecord {
    /// When the action ran.
    pub timestamp: DateTime<Utc>,
    /// Which action ran.
    pub action: HealActionKind,
    /// What it achieved.
    pub outcome: HealOutcome,
    /// Human-readable summary of what was done.
    pub detail: String,
    /// Process resident set before the action, MB.
    pub rss_before_mb: f64,
    /// Process resident set after the action, MB.
    pub rss_after_mb: f64,
    /// Process thread count before the action.
    pub threads_before: usize,
    /// Process thread count after the action.
    pub threads_after: usize,
    /// Wall time the action took, milliseconds.
    pub duration_ms: f64,
    /// Error text when the action failed.
    pub error: Option<String>,
}

/// How one anomaly kind is healed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealPolicy {
    /// Actions tried in order, stopping at the first success.
    pub actions: Vec<HealActionKind>,
    /// Minimum spacing between heal runs for one `(kind, metric)` key.
    pub cooldown: Duration,
    /// Attempt cap for the key; `0` falls back to
    /// [`HealerConfig::max_heal_attempts`].
    pub max_attempts: u32,
    /// Whether failed actions count against the attempt cap.
    pub escalate: bool,
}

/// Healer counters, overall and per action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealerStats {
    /// Heal runs that were admitted past cooldown and attempt checks.
    pub total_heals: u64,
    /// Actions executed across all runs.
    pub total_actions: u64,
    /// Actions that succeeded.
    pub successes: u64,
    /// Actions that partially succeeded.
    pub partials: u64,
    /// Actions that failed.
    pub failures: u64,
    /// Actions skipped for lack of a registered capability.
    pub skipped: u64,
    /// Executed-action count per action name.
    pub by_action: HashMap<String, u64>,
    /// Records currently retained in history.
    pub history_len: usize,
}

struct KeyState {
    last_heal: Option<Instant>,
    attempts: u32,
}

struct HealState {
    keys: HashMap<String, KeyState>,
    history: VecDeque<HealRecord>,
    total_heals: u64,
    total_actions: u64,
    successes: u64,
    partials: u64,
    failures: u64,
    skipped: u64,
    by_action: HashMap<String, u64>,
}

type MemoryHook = Box<dyn Fn() + Send + Sync>;
type CensusHook = Box<dyn Fn() -> usize + Send + Sync>;
type TrimHook = Box<dyn Fn() -> bool + Send + Sync>;
type CustomHandler = Box<dyn Fn() -> Result<String, String> + Send + Sync>;
type HealCallback = Box<dyn Fn(&HealRecord) + Send + Sync>;

/// Executes policy-selected corrective actions for anomalies and
/// direct pressure signals.
///
/// Everything the healer does is capability-driven: it reclaims memory
/// through registered hooks, clears registered caches, resets
/// registered pools and prunes the task registry through a wired
/// census hook. With nothing registered an action reports
/// [`HealOutcome::Skipped`] and the process is left untouched.
///
/// A heal run for one `(kind, metric)` key is rate limited by the
/// policy cooldown and capped by the policy attempt budget; a
/// successful action resets the budget.
pub struct AutoHealer {
    config: HealerConfig,
    clock: Arc<dyn Clock>,
    policies: RwLock<HashMap<AnomalyKind, HealPolicy>>,
    memory_hooks: RwLock<Vec<(String, MemoryHook)>>,
    caches: RwLock<Vec<(String, Arc<dyn Clearable>)>>,
    pools: RwLock<Vec<(String, Arc<dyn Resettable>)>>,
    custom: RwLock<HashMap<String, CustomHandler>>,
    temp_dirs: RwLock<Vec<PathBuf>>,
    census: RwLock<Option<CensusHook>>,
    trim: RwLock<Option<TrimHook>>,
    callbacks: RwLock<Vec<HealCallback>>,
    alerts: RwLock<Option<Arc<AlertManager>>>,
    state: Mutex<HealState>,
}

impl AutoHealer {
    /// Create a healer with the default policy table on the system clock.
    #[must_use]
    pub fn new(config: HealerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a healer with an explicit clock, for deterministic tests.
    #[must_use]
    pub fn with_clock(config: HealerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            policies: RwLock::new(default_policies()),
            memory_hooks: RwLock::new(Vec::new()),
            caches: RwLock::new(Vec::new()),
            pools: RwLock::new(Vec::new()),
            custom: RwLock::new(HashMap::new()),
            temp_dirs: RwLock::new(Vec::new()),
            census: RwLock::new(None),
            trim: RwLock::new(None),
            callbacks: RwLock::new(Vec::new()),
            alerts: RwLock::new(None),
            state: Mutex::new(HealState {
                keys: HashMap::new(),
                history: VecDeque::new(),
                total_heals: 0,
                total_actions: 0,
                successes: 0,
                partials: 0,
                failures: 0,
                skipped: 0,
                by_action: HashMap::new(),
            }),
        }
    }

    /// Report executed actions to this alert manager.
    pub fn set_alert_manager(&self, manager: Arc<AlertManager>) {
        *write_lock(&self.alerts) = Some(manager);
    }

    /// Replace the policy for one anomaly kind.
    pub fn set_policy(&self, kind: AnomalyKind, policy: HealPolicy) {
        write_lock(&self.policies).insert(kind, policy);
    }

    /// The current policy for one anomaly kind.
    #[must_use]
    pub fn policy(&self, kind: AnomalyKind) -> Option<HealPolicy> {
        read_lock(&self.policies).get(&kind).cloned()
    }

    /// Register a memory reclaim hook run by `ReleaseMemory`.
    pub fn register_memory_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        write_lock(&self.memory_hooks).push((name.into(), Box::new(hook)));
    }

    /// Register a cache cleared by `ClearCaches`.
    pub fn register_cache(&self, name: impl Into<String>, cache: Arc<dyn Clearable>) {
        write_lock(&self.caches).push((name.into(), cache));
    }

    /// Register a pool reset by `ResetPools`.
    pub fn register_pool(&self, name: impl Into<String>, pool: Arc<dyn Resettable>) {
        write_lock(&self.pools).push((name.into(), pool));
    }

    /// Register a handler for `Custom(name)` actions.
    pub fn register_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn() -> Result<String, String> + Send + Sync + 'static,
    {
        write_lock(&self.custom).insert(name.into(), Box::new(handler));
    }

    /// Register a directory swept by `CleanupTempFiles`.
    pub fn register_temp_dir(&self, dir: impl Into<PathBuf>) {
        write_lock(&self.temp_dirs).push(dir.into());
    }

    /// Wire the task registry census used by `CleanupThreads`.
    ///
    /// The hook returns how many dead entries it pruned.
    pub fn set_census_hook<F>(&self, hook: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        *write_lock(&self.census) = Some(Box::new(hook));
    }

    /// Wire a best-effort allocator trim used by `TrimMemory`.
    ///
    /// The hook returns whether trimming did anything.
    pub fn set_trim_hook<F>(&self, hook: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        *write_lock(&self.trim) = Some(Box::new(hook));
    }

    /// Register a callback invoked for every executed action.
    pub fn on_heal<F>(&self, callback: F)
    where
        F: Fn(&HealRecord) + Send + Sync + 'static,
    {
        write_lock(&self.callbacks).push(Box::new(callback));
    }

    /// Run the policy for `anomaly`, returning the executed actions.
    ///
    /// No-op (empty vec) when healing is disabled, no policy covers the
    /// anomaly kind, the `(kind, metric)` cooldown has not elapsed, or
    /// the attempt budget is exhausted. Actions run in policy order and
    /// stop at the first success, which also resets the attempt budget.
    pub fn heal(&self, anomaly: &Anomaly) -> Vec<HealRecord> {
        if !self.config.enabled {
            return Vec::new();
        }
        let policy = read_lock(&self.policies).get(&anomaly.kind).cloned();
        let Some(policy) = policy else {
            tracing::debug!(kind = %anomaly.kind, "no healing policy for anomaly kind");
            return Vec::new();
        };
        let key = format!("{}:{}", anomaly.kind, anomaly.metric);
        let max_attempts = if policy.max_attempts == 0 {
            self.config.max_heal_attempts
        } else {
            policy.max_attempts
        };
        if !self.admit(&key, policy.cooldown, max_attempts) {
            tracing::debug!(key = %key, "healing suppressed by cooldown or attempt budget");
            return Vec::new();
        }
        tracing::info!(
            kind = %anomaly.kind,
            metric = %anomaly.metric,
            severity = ?anomaly.severity,
            "healing anomaly"
        );

        let mut records = Vec::with_capacity(policy.actions.len());
        let mut succeeded = false;
        let mut failed = 0u32;
        for action in &policy.actions {
            let record = self.run_action(action.clone());
            let outcome = record.outcome;
            records.push(record);
            match outcome {
                HealOutcome::Success => {
                    succeeded = true;
                    break;
                }
                HealOutcome::Failed => failed += 1,
                HealOutcome::Partial | HealOutcome::Skipped => {}
            }
        }
        self.settle(&key, succeeded, failed, policy.escalate);
        records
    }

    /// Relieve memory pressure directly, bypassing the anomaly pipeline.
    ///
    /// Tiers by `percent`: below the configured threshold nothing runs;
    /// at or above [`FULL_RELIEF_LIMIT`] all hooks, cache clears and an
    /// allocator trim run; at or above [`HOOK_RELIEF_LIMIT`] all memory
    /// hooks run; otherwise only the first registered hook runs. The
    /// handler has its own cooldown, independent of anomaly healing.
    pub fn handle_memory_pressure(&self, percent: f64) -> Vec<HealRecord> {
        if !self.config.enabled || !self.config.memory_pressure_relief {
            return Vec::new();
        }
        if percent < self.config.memory_pressure_threshold {
            return Vec::new();
        }
        if !self.admit(MEMORY_PRESSURE_KEY, self.config.heal_cooldown(), 0) {
            tracing::debug!(percent, "memory pressure relief still cooling down");
            return Vec::new();
        }
        tracing::warn!(percent, "relieving memory pressure");

        let mut records = Vec::new();
        if percent >= FULL_RELIEF_LIMIT {
            records.push(self.run_action(HealActionKind::ReleaseMemory));
            if self.config.cache_clear_on_memory {
                records.push(self.run_action(HealActionKind::ClearCaches));
            }
            records.push(self.run_action(HealActionKind::TrimMemory));
        } else if percent >= HOOK_RELIEF_LIMIT {
            records.push(self.run_action(HealActionKind::ReleaseMemory));
        } else {
            records.push(self.run_recorded(HealActionKind::ReleaseMemory, || {
                self.release_memory(Some(1))
            }));
        }
        records
    }

    /// Relieve CPU pressure: at or above [`CPU_PRESSURE_LIMIT`] prune
    /// the task registry, on the handler's own cooldown.
    pub fn handle_cpu_pressure(&self, percent: f64) -> Vec<HealRecord> {
        if !self.config.enabled || percent < CPU_PRESSURE_LIMIT {
            return Vec::new();
        }
        if !self.admit(CPU_PRESSURE_KEY, self.config.heal_cooldown(), 0) {
            tracing::debug!(percent, "cpu pressure relief still cooling down");
            return Vec::new();
        }
        tracing::warn!(percent, "relieving cpu pressure");
        vec![self.run_action(HealActionKind::CleanupThreads)]
    }

    /// The most recent `limit` records, oldest first.
    #[must_use]
    pub fn history(&self, limit: Option<usize>) -> Vec<HealRecord> {
        let state = self.lock_state();
        let take = limit.unwrap_or(state.history.len()).min(state.history.len());
        state
            .history
            .iter()
            .skip(state.history.len() - take)
            .cloned()
            .collect()
    }

    /// Healer counters.
    #[must_use]
    pub fn stats(&self) -> HealerStats {
        let state = self.lock_state();
        HealerStats {
            total_heals: state.total_heals,
            total_actions: state.total_actions,
            successes: state.successes,
            partials: state.partials,
            failures: state.failures,
            skipped: state.skipped,
            by_action: state.by_action.clone(),
            history_len: state.history.len(),
        }
    }

    /// Drop the action history. Cooldowns and counters are kept.
    pub fn clear_history(&self) {
        self.lock_state().history.clear();
    }

    /// Check cooldown and attempt budget for `key`; marks the run
    /// started when admitted. `max_attempts` of 0 means uncapped.
    fn admit(&self, key: &str, cooldown: Duration, max_attempts: u32) -> bool {
        let now = self.clock.now();
        let mut state = self.lock_state();
        let entry = state.keys.entry(key.to_string()).or_insert(KeyState {
            last_heal: None,
            attempts: 0,
        });
        if let Some(last) = entry.last_heal {
            if now.saturating_duration_since(last) < cooldown {
                return false;
            }
        }
        if max_attempts > 0 && entry.attempts >= max_attempts {
            return false;
        }
        entry.last_heal = Some(now);
        state.total_heals += 1;
        true
    }

    fn settle(&self, key: &str, succeeded: bool, failed: u32, escalate: bool) {
        let mut state = self.lock_state();
        if let Some(entry) = state.keys.get_mut(key) {
            if succeeded {
                entry.attempts = 0;
            } else if escalate {
                entry.attempts += failed;
            }
        }
    }

    fn run_action(&self, action: HealActionKind) -> HealRecord {
        self.run_recorded(action.clone(), || self.execute(&action))
    }

    fn run_recorded<F>(&self, action: HealActionKind, exec: F) -> HealRecord
    where
        F: FnOnce() -> (HealOutcome, String),
    {
        let (rss_before_mb, threads_before) = current_process_stats();
        let started = self.clock.now();
        let (outcome, detail) = exec();
        let duration = self.clock.now().saturating_duration_since(started);
        let (rss_after_mb, threads_after) = current_process_stats();
        let error = (outcome == HealOutcome::Failed).then(|| detail.clone());
        let record = HealRecord {
            timestamp: Utc::now(),
            action,
            outcome,
            detail,
            rss_before_mb,
            rss_after_mb,
            threads_before,
            threads_after,
            duration_ms: duration.as_secs_f64() * 1000.0,
            error,
        };
        self.note(&record);
        record
    }

    fn note(&self, record: &HealRecord) {
        {
            let mut state = self.lock_state();
            state.total_actions += 1;
            match record.outcome {
                HealOutcome::Success => state.successes += 1,
                HealOutcome::Partial => state.partials += 1,
                HealOutcome::Failed => state.failures += 1,
                HealOutcome::Skipped => state.skipped += 1,
            }
            *state.by_action.entry(record.action.to_string()).or_default() += 1;
            state.history.push_back(record.clone());
            while state.history.len() > MAX_HISTORY {
                state.history.pop_front();
            }
        }

        match record.outcome {
            HealOutcome::Success => tracing::info!(
                action = %record.action,
                detail = %record.detail,
                "healing action succeeded"
            ),
            _ => tracing::warn!(
                action = %record.action,
                outcome = record.outcome.as_str(),
                detail = %record.detail,
                "healing action did not succeed"
            ),
        }

        for callback in read_lock(&self.callbacks).iter() {
            callback(record);
        }

        let alerts = read_lock(&self.alerts).clone();
        if let Some(manager) = alerts {
            let level = if record.outcome == HealOutcome::Success {
                AlertLevel::Info
            } else {
                AlertLevel::Warning
            };
            manager
                .alert(level, format!("Auto-Healing: {}", record.action))
                .message(record.detail.clone())
                .source("vigil.healer")
                .meta("outcome", record.outcome.as_str())
                .meta("duration_ms", record.duration_ms)
                .send();
        }
    }

    fn execute(&self, action: &HealActionKind) -> (HealOutcome, String) {
        match action {
            HealActionKind::ReleaseMemory => self.release_memory(None),
            HealActionKind::ClearCaches => self.clear_caches(),
            HealActionKind::ResetPools => self.reset_pools(),
            HealActionKind::CleanupThreads => self.cleanup_threads(),
            HealActionKind::TrimMemory => self.trim_memory(),
            HealActionKind::CleanupTempFiles => self.sweep_temp_files(),
            HealActionKind::Custom(name) => self.run_custom(name),
        }
    }

    fn release_memory(&self, limit: Option<usize>) -> (HealOutcome, String) {
        let hooks = read_lock(&self.memory_hooks);
        if hooks.is_empty() {
            return (
                HealOutcome::Skipped,
                "no memory hooks registered".to_string(),
            );
        }
        let take = limit.unwrap_or(hooks.len()).min(hooks.len());
        for (_, hook) in hooks.iter().take(take) {
            hook();
        }
        (
            HealOutcome::Success,
            format!("ran {take} of {} memory hooks", hooks.len()),
        )
    }

    fn clear_caches(&self) -> (HealOutcome, String) {
        let caches = read_lock(&self.caches);
        if caches.is_empty() {
            return (HealOutcome::Skipped, "no caches registered".to_string());
        }
        let mut entries = 0u64;
        for (name, cache) in caches.iter() {
            let released = cache.clear();
            tracing::debug!(cache = %name, released, "cache cleared");
            entries += released;
        }
        (
            HealOutcome::Success,
            format!("cleared {entries} entries across {} caches", caches.len()),
        )
    }

    fn reset_pools(&self) -> (HealOutcome, String) {
        let pools = read_lock(&self.pools);
        if pools.is_empty() {
            return (HealOutcome::Skipped, "no pools registered".to_string());
        }
        let mut ok = 0usize;
        let mut failed = 0usize;
        for (name, pool) in pools.iter() {
            match pool.reset() {
                Ok(()) => ok += 1,
                Err(reason) => {
                    tracing::warn!(pool = %name, reason = %reason, "pool reset failed");
                    failed += 1;
                }
            }
        }
        let detail = format!("reset {ok} pools, {failed} failed");
        let outcome = if failed == 0 {
            HealOutcome::Success
        } else if ok == 0 {
            HealOutcome::Failed
        } else {
            HealOutcome::Partial
        };
        (outcome, detail)
    }

    fn cleanup_threads(&self) -> (HealOutcome, String) {
        let census = read_lock(&self.census);
        match census.as_ref() {
            None => (
                HealOutcome::Skipped,
                "no task census hook wired".to_string(),
            ),
            Some(hook) => {
                let pruned = hook();
                (HealOutcome::Success, format!("pruned {pruned} dead tasks"))
            }
        }
    }

    fn trim_memory(&self) -> (HealOutcome, String) {
        let (hooks_outcome, _) = self.release_memory(None);
        let (caches_outcome, cache_detail) = self.clear_caches();
        let trimmed = read_lock(&self.trim).as_ref().map(|hook| hook());

        let mut ok = 0u8;
        if hooks_outcome == HealOutcome::Success {
            ok += 1;
        }
        if caches_outcome == HealOutcome::Success {
            ok += 1;
        }
        if trimmed == Some(true) {
            ok += 1;
        }
        let outcome = match ok {
            3 => HealOutcome::Success,
            0 => HealOutcome::Skipped,
            _ => HealOutcome::Partial,
        };
        let trim_state = match trimmed {
            Some(true) => "ok",
            Some(false) => "noop",
            None => "unavailable",
        };
        (
            outcome,
            format!(
                "memory hooks {}, {cache_detail}, allocator trim {trim_state}",
                hooks_outcome.as_str()
            ),
        )
    }

    fn sweep_temp_files(&self) -> (HealOutcome, String) {
        let dirs: Vec<PathBuf> = read_lock(&self.temp_dirs).clone();
        if dirs.is_empty() {
            return (
                HealOutcome::Skipped,
                "no temp directories registered".to_string(),
            );
        }
        let Some(cutoff) = SystemTime::now().checked_sub(self.config.temp_file_max_age()) else {
            return (HealOutcome::Success, "removed 0 stale files".to_string());
        };

        let mut removed = 0usize;
        let mut errors = 0usize;
        let mut unreadable_dirs = 0usize;
        for dir in &dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(error) => {
                    tracing::warn!(dir = %dir.display(), %error, "temp dir not readable");
                    unreadable_dirs += 1;
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let stale = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .map_or(false, |modified| modified < cutoff);
                if !stale {
                    continue;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(error) => {
                        tracing::warn!(file = %path.display(), %error, "stale file not removed");
                        errors += 1;
                    }
                }
            }
        }

        let detail = format!(
            "removed {removed} stale files from {} dirs, {errors} errors",
            dirs.len()
        );
        let outcome = if unreadable_dirs == dirs.len() {
            HealOutcome::Failed
        } else if errors > 0 {
            HealOutcome::Partial
        } else {
            HealOutcome::Success
        };
        (outcome, detail)
    }

    fn run_custom(&self, name: &str) -> (HealOutcome, String) {
        let custom = read_lock(&self.custom);
        match custom.get(name) {
            None => {
                tracing::warn!(handler = %name, "no handler registered for custom action");
                (
                    HealOutcome::Skipped,
                    format!("no handler registered for '{name}'"),
                )
            }
            Some(handler) => match handler() {
                Ok(detail) => (HealOutcome::Success, detail),
                Err(reason) => (HealOutcome::Failed, reason),
            },
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HealState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("healer state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl std::fmt::Debug for AutoHealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoHealer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The built-in policy table.
fn default_policies() -> HashMap<AnomalyKind, HealPolicy> {
    HashMap::from([
        (
            AnomalyKind::MemoryLeak,
            HealPolicy {
                actions: vec![
                    HealActionKind::ReleaseMemory,
                    HealActionKind::ClearCaches,
                    HealActionKind::TrimMemory,
                ],
                cooldown: Duration::from_secs(30),
                max_attempts: 5,
                escalate: true,
            },
        ),
        (
            AnomalyKind::Threshold,
            HealPolicy {
                actions: vec![HealActionKind::ReleaseMemory, HealActionKind::ClearCaches],
                cooldown: Duration::from_secs(60),
                max_attempts: 3,
                escalate: true,
            },
        ),
        (
            AnomalyKind::CpuSaturation,
            HealPolicy {
                actions: vec![HealActionKind::CleanupThreads],
                cooldown: Duration::from_secs(120),
                max_attempts: 2,
                escalate: false,
            },
        ),
        (
            AnomalyKind::Spike,
            HealPolicy {
                actions: vec![HealActionKind::ReleaseMemory],
                cooldown: Duration::from_secs(30),
                max_attempts: 3,
                escalate: false,
            },
        ),
    ])
}
