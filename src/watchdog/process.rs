//! Process liveness supervision: heartbeats, task census, deadlock
//! heuristic and bounded recovery.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alerts::{AlertLevel, AlertManager};
use crate::config::WatchdogConfig;
use crate::metrics::current_process_stats;
use crate::traits::{Clock, NoopInterrupt, SystemClock, TaskInterrupt};

const MAX_EVENTS: usize = 1000;
/// Process thread count above which a leak is reported.
pub const THREAD_LEAK_LIMIT: usize = 100;
/// Minimum stalled tasks for the deadlock heuristic to trigger.
pub const DEADLOCK_MIN_TASKS: usize = 3;

/// Assessed liveness of the supervised process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Heartbeats arrive on time, no task issues.
    Healthy,
    /// Tasks died unexpectedly or the thread count is leaking.
    Degraded,
    /// No heartbeat within the timeout.
    Unresponsive,
    /// A stable set of stalled tasks across consecutive checks.
    Deadlocked,
    /// Recovery attempts are exhausted.
    Critical,
}

impl ProcessState {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unresponsive => "unresponsive",
            Self::Deadlocked => "deadlocked",
            Self::Critical => "critical",
        }
    }

    /// Alert level a transition into this state is reported at.
    #[must_use]
    pub const fn alert_level(self) -> AlertLevel {
        match self {
            Self::Healthy => AlertLevel::Info,
            Self::Degraded => AlertLevel::Warning,
            Self::Unresponsive | Self::Deadlocked | Self::Critical => AlertLevel::Critical,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a watchdog event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogEventKind {
    /// No heartbeat within the timeout.
    HeartbeatTimeout,
    /// A recovery action was attempted.
    RecoveryAttempt,
    /// A watched non-daemon task vanished without finishing.
    TaskDied,
    /// Process thread count crossed the leak limit.
    ThreadLeak,
    /// The deadlock heuristic fired.
    DeadlockDetected,
    /// The assessed process state changed.
    StateChange,
}

impl WatchdogEventKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::RecoveryAttempt => "recovery_attempt",
            Self::TaskDied => "task_died",
            Self::ThreadLeak => "thread_leak",
            Self::DeadlockDetected => "deadlock_detected",
            Self::StateChange => "state_change",
        }
    }

    /// Headline used when the event is reported as an alert.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "Watchdog: heartbeat timeout",
            Self::RecoveryAttempt => "Watchdog: recovery attempt",
            Self::TaskDied => "Watchdog: task died",
            Self::ThreadLeak => "Watchdog: thread leak",
            Self::DeadlockDetected => "Watchdog: deadlock detected",
            Self::StateChange => "Watchdog: process state changed",
        }
    }
}

impl std::fmt::Display for WatchdogEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded watchdog observation.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogEvent {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: WatchdogEventKind,
    /// Alert level the event is reported at.
    pub level: AlertLevel,
    /// Human-readable description.
    pub message: String,
}

/// Watchdog counters and current assessment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogStats {
    /// Current assessed state.
    pub state: ProcessState,
    /// Seconds since the last heartbeat.
    pub seconds_since_heartbeat: f64,
    /// Recovery attempts consumed.
    pub restart_count: u32,
    /// Recovery attempt budget.
    pub max_restarts: u32,
    /// Watched tasks currently alive.
    pub watched_tasks: usize,
    /// Tasks stalled past the heartbeat timeout at the last check.
    pub blocked_tasks: usize,
    /// Process thread count at the last check.
    pub thread_count: usize,
    /// Events currently retained.
    pub events_len: usize,
    /// Event counts per kind name.
    pub by_kind: HashMap<String, u64>,
}

struct TaskFlags {
    last_beat: Mutex<Instant>,
    finished: AtomicBool,
}

/// Liveness handle for one watched task.
///
/// Call [`TaskPulse::beat`] from the task's loop; dropping the pulse
/// without [`TaskPulse::finish`] makes a non-daemon task count as died.
pub struct TaskPulse {
    name: String,
    flags: Arc<TaskFlags>,
    clock: Arc<dyn Clock>,
    _alive: Arc<()>,
}

impl TaskPulse {
    /// Record that the task is making progress.
    pub fn beat(&self) {
        let mut last = match self.flags.last_beat.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = self.clock.now();
    }

    /// Mark the task deliberately finished and release the watch.
    pub fn finish(self) {
        self.flags.finished.store(true, Ordering::SeqCst);
    }

    /// The watched task's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for TaskPulse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPulse")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct WatchRecord {
    name: String,
    daemon: bool,
    flags: Arc<TaskFlags>,
    alive: Weak<()>,
}

struct WatchdogInner {
    state: ProcessState,
    last_heartbeat: Instant,
    restart_count: u32,
    last_restart: Option<Instant>,
    prev_blocked: BTreeSet<String>,
    last_thread_count: usize,
    events: VecDeque<WatchdogEvent>,
    by_kind: HashMap<String, u64>,
}

enum RecoveryDecision {
    Attempt,
    TooSoon,
    Exhausted,
}

struct CheckFindings {
    stale_heartbeat: bool,
    died: Vec<String>,
    thread_count: usize,
    thread_leak: bool,
    deadlocked: Vec<String>,
}

type RecoveryHook = Box<dyn Fn(ProcessState) + Send + Sync>;

/// Supervises the host process: heartbeat deadline, watched-task
/// census, a stalled-set deadlock heuristic and bounded recovery.
///
/// The embedding application calls [`ProcessWatchdog::heartbeat`] from
/// its main loop and registers long-lived tasks with
/// [`ProcessWatchdog::watch`]. The runtime drives
/// [`ProcessWatchdog::check`] on the configured interval; every finding
/// is recorded as a [`WatchdogEvent`] and reported to the attached
/// alert manager.
pub struct ProcessWatchdog {
    config: WatchdogConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<WatchdogInner>,
    registry: Mutex<Vec<WatchRecord>>,
    interrupter: RwLock<Arc<dyn TaskInterrupt>>,
    recovery: RwLock<Option<RecoveryHook>>,
    alerts: RwLock<Option<Arc<AlertManager>>>,
}

impl ProcessWatchdog {
    /// Create a watchdog on the system clock.
    #[must_use]
    pub fn new(config: WatchdogConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a watchdog with an explicit clock, for deterministic tests.
    #[must_use]
    pub fn with_clock(config: WatchdogConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            inner: Mutex::new(WatchdogInner {
                state: ProcessState::Healthy,
                last_heartbeat: now,
                restart_count: 0,
                last_restart: None,
                prev_blocked: BTreeSet::new(),
                last_thread_count: 0,
                events: VecDeque::new(),
                by_kind: HashMap::new(),
            }),
            registry: Mutex::new(Vec::new()),
            interrupter: RwLock::new(Arc::new(NoopInterrupt)),
            recovery: RwLock::new(None),
            alerts: RwLock::new(None),
        }
    }

    /// Report events to this alert manager.
    pub fn set_alert_manager(&self, manager: Arc<AlertManager>) {
        *write_lock(&self.alerts) = Some(manager);
    }

    /// Wire the interrupt capability used against deadlocked tasks.
    pub fn set_interrupt(&self, interrupter: Arc<dyn TaskInterrupt>) {
        *write_lock(&self.interrupter) = interrupter;
    }

    /// Wire the recovery action run when the process goes unresponsive.
    pub fn set_recovery_hook<F>(&self, hook: F)
    where
        F: Fn(ProcessState) + Send + Sync + 'static,
    {
        *write_lock(&self.recovery) = Some(Box::new(hook));
    }

    /// Record liveness of the main loop.
    ///
    /// Restores `Healthy` when the process was `Unresponsive`.
    pub fn heartbeat(&self) {
        let now = self.clock.now();
        let recovered = {
            let mut inner = self.lock_inner();
            inner.last_heartbeat = now;
            if inner.state == ProcessState::Unresponsive {
                inner.state = ProcessState::Healthy;
                let event = make_event(
                    WatchdogEventKind::StateChange,
                    AlertLevel::Info,
                    "heartbeat received, process state unresponsive -> healthy".to_string(),
                );
                push_event(&mut inner, event.clone());
                Some(event)
            } else {
                None
            }
        };
        if let Some(event) = recovered {
            self.report(&event);
        }
    }

    /// Watch a task. Daemon tasks may vanish silently; non-daemon tasks
    /// that drop their pulse without finishing are reported as died.
    #[must_use]
    pub fn watch(&self, name: impl Into<String>, daemon: bool) -> TaskPulse {
        let name = name.into();
        let flags = Arc::new(TaskFlags {
            last_beat: Mutex::new(self.clock.now()),
            finished: AtomicBool::new(false),
        });
        let alive = Arc::new(());
        let mut registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.push(WatchRecord {
            name: name.clone(),
            daemon,
            flags: flags.clone(),
            alive: Arc::downgrade(&alive),
        });
        tracing::debug!(task = %name, daemon, "task watched");
        TaskPulse {
            name,
            flags,
            clock: self.clock.clone(),
            _alive: alive,
        }
    }

    /// Run all checks once and return the assessed state.
    ///
    /// Heartbeat deadline, watched-task census, thread-count high-water
    /// mark and the deadlock heuristic each contribute findings; the
    /// worst one drives the state. Recovery (the wired hook for an
    /// unresponsive process, task interrupts for a deadlock) runs while
    /// `restart_count` is under `max_restarts` and attempts are spaced
    /// by `restart_delay`; an over-budget recovery need escalates to
    /// `Critical`.
    pub fn check(&self) -> ProcessState {
        let now = self.clock.now();
        let findings = self.gather(now);

        let mut pending: Vec<WatchdogEvent> = Vec::new();
        let mut recovery_target: Option<ProcessState> = None;
        let prev_state;
        let mut target;
        {
            let mut inner = self.lock_inner();
            prev_state = inner.state;
            target = if prev_state == ProcessState::Critical {
                ProcessState::Critical
            } else {
                ProcessState::Healthy
            };

            for task in &findings.died {
                pending.push(make_event(
                    WatchdogEventKind::TaskDied,
                    AlertLevel::Warning,
                    format!("watched task '{task}' exited without finishing"),
                ));
                target = target.max(ProcessState::Degraded);
            }
            if findings.thread_leak {
                pending.push(make_event(
                    WatchdogEventKind::ThreadLeak,
                    AlertLevel::Warning,
                    format!(
                        "process has {} threads (limit {THREAD_LEAK_LIMIT})",
                        findings.thread_count
                    ),
                ));
                target = target.max(ProcessState::Degraded);
            }
            if findings.stale_heartbeat {
                let elapsed = now.saturating_duration_since(inner.last_heartbeat);
                pending.push(make_event(
                    WatchdogEventKind::HeartbeatTimeout,
                    AlertLevel::Critical,
                    format!(
                        "no heartbeat for {:.1}s (timeout {:.1}s)",
                        elapsed.as_secs_f64(),
                        self.config.heartbeat_timeout_secs
                    ),
                ));
                target = target.max(ProcessState::Unresponsive);
            }
            if !findings.deadlocked.is_empty() {
                pending.push(make_event(
                    WatchdogEventKind::DeadlockDetected,
                    AlertLevel::Critical,
                    format!(
                        "{} tasks stalled across consecutive checks: {}",
                        findings.deadlocked.len(),
                        findings.deadlocked.join(", ")
                    ),
                ));
                target = target.max(ProcessState::Deadlocked);
            }

            if findings.stale_heartbeat || !findings.deadlocked.is_empty() {
                let wanted = if findings.deadlocked.is_empty() {
                    ProcessState::Unresponsive
                } else {
                    ProcessState::Deadlocked
                };
                match self.admit_recovery(&mut inner, now) {
                    RecoveryDecision::Attempt => recovery_target = Some(wanted),
                    RecoveryDecision::TooSoon => {}
                    RecoveryDecision::Exhausted => target = ProcessState::Critical,
                }
            }

            if target != prev_state {
                inner.state = target;
                pending.push(make_event(
                    WatchdogEventKind::StateChange,
                    target.alert_level(),
                    format!("process state {prev_state} -> {target}"),
                ));
            }
            inner.last_thread_count = findings.thread_count;
            for event in &pending {
                push_event(&mut inner, event.clone());
            }
        }

        for event in &pending {
            self.report(event);
        }

        if let Some(wanted) = recovery_target {
            let action = self.run_recovery(wanted, &findings.deadlocked);
            let event = make_event(
                WatchdogEventKind::RecoveryAttempt,
                AlertLevel::Warning,
                action,
            );
            push_event(&mut self.lock_inner(), event.clone());
            self.report(&event);
        }

        target
    }

    /// The most recent `limit` events, oldest first.
    #[must_use]
    pub fn events(&self, limit: Option<usize>) -> Vec<WatchdogEvent> {
        let inner = self.lock_inner();
        let take = limit.unwrap_or(inner.events.len()).min(inner.events.len());
        inner
            .events
            .iter()
            .skip(inner.events.len() - take)
            .cloned()
            .collect()
    }

    /// Current assessed state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.lock_inner().state
    }

    /// Counters and current assessment.
    #[must_use]
    pub fn stats(&self) -> WatchdogStats {
        let watched = {
            let mut registry = match self.registry.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            registry.retain(|record| record.alive.upgrade().is_some());
            registry.len()
        };
        let inner = self.lock_inner();
        WatchdogStats {
            state: inner.state,
            seconds_since_heartbeat: self
                .clock
                .now()
                .saturating_duration_since(inner.last_heartbeat)
                .as_secs_f64(),
            restart_count: inner.restart_count,
            max_restarts: self.config.max_restarts,
            watched_tasks: watched,
            blocked_tasks: inner.prev_blocked.len(),
            thread_count: inner.last_thread_count,
            events_len: inner.events.len(),
            by_kind: inner.by_kind.clone(),
        }
    }

    /// Drops registry entries whose tasks are gone, returning how many were
    /// removed. Suitable as a census hook for thread cleanup.
    pub fn prune_dead(&self) -> usize {
        let mut registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = registry.len();
        registry.retain(|record| record.alive.upgrade().is_some());
        before - registry.len()
    }

    /// Back to a clean slate: healthy, zero restarts, empty event log.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        inner.state = ProcessState::Healthy;
        inner.last_heartbeat = self.clock.now();
        inner.restart_count = 0;
        inner.last_restart = None;
        inner.prev_blocked.clear();
        inner.events.clear();
        inner.by_kind.clear();
        tracing::info!("watchdog reset");
    }

    /// Sweep watched tasks and evaluate all heuristics for this tick.
    fn gather(&self, now: Instant) -> CheckFindings {
        let timeout = self.config.heartbeat_timeout();
        let stale_heartbeat = {
            let inner = self.lock_inner();
            now.saturating_duration_since(inner.last_heartbeat) > timeout
        };

        let mut died = Vec::new();
        let mut blocked = BTreeSet::new();
        if self.config.monitor_tasks || self.config.deadlock_detection {
            let mut registry = match self.registry.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            registry.retain(|record| {
                if record.alive.upgrade().is_none() {
                    let finished = record.flags.finished.load(Ordering::SeqCst);
                    if !finished && !record.daemon && self.config.monitor_tasks {
                        died.push(record.name.clone());
                    }
                    return false;
                }
                if record.flags.finished.load(Ordering::SeqCst) {
                    return false;
                }
                let last = match record.flags.last_beat.lock() {
                    Ok(guard) => *guard,
                    Err(poisoned) => *poisoned.into_inner(),
                };
                if now.saturating_duration_since(last) > timeout {
                    blocked.insert(record.name.clone());
                }
                true
            });
        }

        let thread_count = current_thread_count();
        let thread_leak = self.config.monitor_tasks && thread_count > THREAD_LEAK_LIMIT;

        let deadlocked = if self.config.deadlock_detection
            && blocked.len() >= DEADLOCK_MIN_TASKS
            && blocked == self.lock_inner().prev_blocked
        {
            blocked.iter().cloned().collect()
        } else {
            Vec::new()
        };
        // Remember this tick's stalled set for the next comparison
        self.lock_inner().prev_blocked = blocked;

        CheckFindings {
            stale_heartbeat,
            died,
            thread_count,
            thread_leak,
            deadlocked,
        }
    }

    fn admit_recovery(&self, inner: &mut WatchdogInner, now: Instant) -> RecoveryDecision {
        if inner.restart_count >= self.config.max_restarts {
            return RecoveryDecision::Exhausted;
        }
        if let Some(last) = inner.last_restart {
            if now.saturating_duration_since(last) < self.config.restart_delay() {
                return RecoveryDecision::TooSoon;
            }
        }
        inner.restart_count += 1;
        inner.last_restart = Some(now);
        RecoveryDecision::Attempt
    }

    /// Execute the recovery action outside any watchdog lock.
    fn run_recovery(&self, target: ProcessState, deadlocked: &[String]) -> String {
        if target == ProcessState::Deadlocked {
            let interrupter = read_lock(&self.interrupter).clone();
            let delivered = deadlocked
                .iter()
                .filter(|task| interrupter.interrupt(task))
                .count();
            format!(
                "interrupted {delivered} of {} deadlocked tasks",
                deadlocked.len()
            )
        } else {
            let hook_wired = {
                let recovery = read_lock(&self.recovery);
                if let Some(hook) = recovery.as_ref() {
                    hook(target);
                    true
                } else {
                    false
                }
            };
            if hook_wired {
                "memory release via recovery hook".to_string()
            } else {
                "no recovery hook wired, detect-and-report only".to_string()
            }
        }
    }

    fn report(&self, event: &WatchdogEvent) {
        match event.level {
            AlertLevel::Error | AlertLevel::Critical => tracing::error!(
                kind = %event.kind,
                message = %event.message,
                "watchdog event"
            ),
            AlertLevel::Warning => tracing::warn!(
                kind = %event.kind,
                message = %event.message,
                "watchdog event"
            ),
            AlertLevel::Debug | AlertLevel::Info => tracing::info!(
                kind = %event.kind,
                message = %event.message,
                "watchdog event"
            ),
        }
        let alerts = read_lock(&self.alerts).clone();
        if let Some(manager) = alerts {
            manager
                .alert(event.level, event.kind.title())
                .message(event.message.clone())
                .source("vigil.watchdog")
                .meta("kind", event.kind.as_str())
                .send();
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, WatchdogInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("watchdog state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl std::fmt::Debug for ProcessWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWatchdog")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn make_event(kind: WatchdogEventKind, level: AlertLevel, message: String) -> WatchdogEvent {
    WatchdogEvent {
        timestamp: Utc::now(),
        kind,
        level,
        message,
    }
}

fn push_event(inner: &mut WatchdogInner, event: WatchdogEvent) {
    *inner.by_kind.entry(event.kind.to_string()).or_default() += 1;
    inner.events.push_back(event);
    while inner.events.len() > MAX_EVENTS {
        inner.events.pop_front();
    }
}

fn current_thread_count() -> usize {
    current_process_stats().1
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::config::AlertConfig;
    use crate::traits::ManualClock;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            enabled: true,
            check_interval_secs: 5.0,
            heartbeat_timeout_secs: 60.0,
            max_restarts: 3,
            restart_delay_secs: 0.0,
            monitor_tasks: true,
            deadlock_detection: true,
        }
    }

    fn watchdog(config: WatchdogConfig) -> (ProcessWatchdog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (ProcessWatchdog::with_clock(config, clock.clone()), clock)
    }

    struct RecordingInterrupt {
        hits: Mutex<Vec<String>>,
    }

    impl TaskInterrupt for RecordingInterrupt {
        fn interrupt(&self, task_name: &str) -> bool {
            self.hits.lock().unwrap().push(task_name.to_string());
            true
        }
    }

    #[test]
    fn test_starts_healthy() {
        let (watchdog, _clock) = watchdog(config());
        assert_eq!(watchdog.state(), ProcessState::Healthy);
        let stats = watchdog.stats();
        assert_eq!(stats.restart_count, 0);
        assert_eq!(stats.watched_tasks, 0);
        assert_eq!(stats.events_len, 0);
    }

    #[test]
    fn test_fresh_heartbeat_stays_healthy() {
        let (watchdog, clock) = watchdog(config());
        clock.advance(Duration::from_secs(30));
        watchdog.heartbeat();
        clock.advance(Duration::from_secs(30));
        assert_eq!(watchdog.check(), ProcessState::Healthy);
        assert!(watchdog.events(None).is_empty());
    }

    #[test]
    fn test_missed_heartbeat_goes_unresponsive() {
        let (watchdog, clock) = watchdog(config());
        clock.advance(Duration::from_secs(61));

        assert_eq!(watchdog.check(), ProcessState::Unresponsive);

        let kinds: Vec<_> = watchdog.events(None).iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&WatchdogEventKind::HeartbeatTimeout));
        assert!(kinds.contains(&WatchdogEventKind::StateChange));
        assert!(kinds.contains(&WatchdogEventKind::RecoveryAttempt));
        assert_eq!(watchdog.stats().restart_count, 1);
    }

    #[test]
    fn test_heartbeat_restores_healthy() {
        let (watchdog, clock) = watchdog(config());
        clock.advance(Duration::from_secs(61));
        assert_eq!(watchdog.check(), ProcessState::Unresponsive);

        watchdog.heartbeat();
        assert_eq!(watchdog.state(), ProcessState::Healthy);
        let last = watchdog.events(Some(1)).remove(0);
        assert_eq!(last.kind, WatchdogEventKind::StateChange);
        assert_eq!(last.level, AlertLevel::Info);
    }

    #[test]
    fn test_recovery_hook_invoked() {
        let (watchdog, clock) = watchdog(config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        watchdog.set_recovery_hook(move |state| {
            sink.lock().unwrap().push(state);
        });

        clock.advance(Duration::from_secs(61));
        watchdog.check();

        assert_eq!(seen.lock().unwrap().as_slice(), &[ProcessState::Unresponsive]);
        let recovery = watchdog
            .events(None)
            .into_iter()
            .find(|e| e.kind == WatchdogEventKind::RecoveryAttempt)
            .unwrap();
        assert!(recovery.message.contains("recovery hook"));
    }

    #[test]
    fn test_recovery_exhaustion_goes_critical() {
        let (watchdog, clock) = watchdog(WatchdogConfig {
            max_restarts: 2,
            ..config()
        });

        clock.advance(Duration::from_secs(61));
        assert_eq!(watchdog.check(), ProcessState::Unresponsive);
        clock.advance(Duration::from_secs(61));
        assert_eq!(watchdog.check(), ProcessState::Unresponsive);
        clock.advance(Duration::from_secs(61));
        // Budget of 2 spent: the third incident escalates
        assert_eq!(watchdog.check(), ProcessState::Critical);
        assert_eq!(watchdog.stats().restart_count, 2);

        // Critical is sticky even after a heartbeat
        watchdog.heartbeat();
        assert_eq!(watchdog.state(), ProcessState::Critical);
    }

    #[test]
    fn test_restart_delay_spaces_attempts() {
        let (watchdog, clock) = watchdog(WatchdogConfig {
            restart_delay_secs: 120.0,
            ..config()
        });

        clock.advance(Duration::from_secs(61));
        watchdog.check();
        assert_eq!(watchdog.stats().restart_count, 1);

        clock.advance(Duration::from_secs(61));
        watchdog.check();
        // Second incident is inside the restart delay
        assert_eq!(watchdog.stats().restart_count, 1);
    }

    #[test]
    fn test_dead_task_reports_and_degrades() {
        let (watchdog, _clock) = watchdog(config());
        let pulse = watchdog.watch("uploader", false);
        drop(pulse);

        assert_eq!(watchdog.check(), ProcessState::Degraded);
        let died = watchdog
            .events(None)
            .into_iter()
            .find(|e| e.kind == WatchdogEventKind::TaskDied)
            .unwrap();
        assert!(died.message.contains("uploader"));
        assert_eq!(died.level, AlertLevel::Warning);
    }

    #[test]
    fn test_daemon_task_vanishes_silently() {
        let (watchdog, _clock) = watchdog(config());
        let pulse = watchdog.watch("idle-sweeper", true);
        drop(pulse);

        assert_eq!(watchdog.check(), ProcessState::Healthy);
        assert!(watchdog.events(None).is_empty());
    }

    #[test]
    fn test_finished_task_is_not_a_death() {
        let (watchdog, _clock) = watchdog(config());
        let pulse = watchdog.watch("migration", false);
        pulse.finish();

        assert_eq!(watchdog.check(), ProcessState::Healthy);
        assert!(watchdog.events(None).is_empty());
        assert_eq!(watchdog.stats().watched_tasks, 0);
    }

    #[test]
    fn test_beating_task_never_blocks() {
        let (watchdog, clock) = watchdog(config());
        let pulse = watchdog.watch("consumer", false);

        for _ in 0..3 {
            clock.advance(Duration::from_secs(30));
            pulse.beat();
            watchdog.heartbeat();
            assert_eq!(watchdog.check(), ProcessState::Healthy);
        }
        assert_eq!(watchdog.stats().blocked_tasks, 0);
    }

    #[test]
    fn test_deadlock_after_stable_stalled_set() {
        let (watchdog, clock) = watchdog(config());
        let interrupter = Arc::new(RecordingInterrupt {
            hits: Mutex::new(Vec::new()),
        });
        watchdog.set_interrupt(interrupter.clone());

        let _a = watchdog.watch("worker-a", false);
        let _b = watchdog.watch("worker-b", false);
        let _c = watchdog.watch("worker-c", false);

        clock.advance(Duration::from_secs(61));
        watchdog.heartbeat();
        // First sighting of the stalled set: not yet a deadlock
        assert_eq!(watchdog.check(), ProcessState::Healthy);

        clock.advance(Duration::from_secs(5));
        watchdog.heartbeat();
        assert_eq!(watchdog.check(), ProcessState::Deadlocked);

        let kinds: Vec<_> = watchdog.events(None).iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&WatchdogEventKind::DeadlockDetected));
        let mut hits = interrupter.hits.lock().unwrap().clone();
        hits.sort();
        assert_eq!(hits, vec!["worker-a", "worker-b", "worker-c"]);
    }

    #[test]
    fn test_deadlock_needs_three_stalled_tasks() {
        let (watchdog, clock) = watchdog(config());
        let _a = watchdog.watch("worker-a", false);
        let _b = watchdog.watch("worker-b", false);

        clock.advance(Duration::from_secs(61));
        watchdog.heartbeat();
        watchdog.check();
        clock.advance(Duration::from_secs(5));
        watchdog.heartbeat();
        assert_eq!(watchdog.check(), ProcessState::Healthy);
    }

    #[test]
    fn test_deadlock_needs_stable_set() {
        let (watchdog, clock) = watchdog(config());
        let _a = watchdog.watch("worker-a", false);
        let _b = watchdog.watch("worker-b", false);
        let c = watchdog.watch("worker-c", false);

        clock.advance(Duration::from_secs(61));
        watchdog.heartbeat();
        watchdog.check();

        // One task wakes up: the set changes, no deadlock
        c.beat();
        clock.advance(Duration::from_secs(5));
        watchdog.heartbeat();
        assert_eq!(watchdog.check(), ProcessState::Healthy);
    }

    #[test]
    fn test_events_bounded() {
        let (watchdog, _clock) = watchdog(config());
        for i in 0..1005 {
            let pulse = watchdog.watch(format!("job-{i}"), false);
            drop(pulse);
            watchdog.check();
        }
        assert_eq!(watchdog.events(None).len(), MAX_EVENTS);
        assert_eq!(watchdog.events(Some(10)).len(), 10);
    }

    #[test]
    fn test_transitions_alert_with_state_severity() {
        let (watchdog, clock) = watchdog(config());
        let manager = Arc::new(AlertManager::new(AlertConfig::default()));
        watchdog.set_alert_manager(manager.clone());

        clock.advance(Duration::from_secs(61));
        watchdog.check();

        let alerts = manager.recent(10);
        assert!(alerts.iter().all(|a| a.source == "vigil.watchdog"));
        let timeout = alerts
            .iter()
            .find(|a| a.title == "Watchdog: heartbeat timeout")
            .unwrap();
        assert_eq!(timeout.level, AlertLevel::Critical);
        assert!(alerts
            .iter()
            .any(|a| a.title == "Watchdog: process state changed"));
    }

    #[test]
    fn test_reset_clears_incidents() {
        let (watchdog, clock) = watchdog(config());
        clock.advance(Duration::from_secs(61));
        watchdog.check();
        assert_ne!(watchdog.state(), ProcessState::Healthy);

        watchdog.reset();
        assert_eq!(watchdog.state(), ProcessState::Healthy);
        let stats = watchdog.stats();
        assert_eq!(stats.restart_count, 0);
        assert_eq!(stats.events_len, 0);
        assert!(watchdog.events(None).is_empty());
    }

    #[test]
    fn test_stats_by_kind() {
        let (watchdog, clock) = watchdog(config());
        clock.advance(Duration::from_secs(61));
        watchdog.check();

        let stats = watchdog.stats();
        assert_eq!(stats.by_kind.get("heartbeat_timeout"), Some(&1));
        assert_eq!(stats.by_kind.get("recovery_attempt"), Some(&1));
        assert!(stats.seconds_since_heartbeat > 60.0);
    }
}
