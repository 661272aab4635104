//! Circuit breaker guarding calls into an unreliable dependency.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;
use crate::error::ProtectError;
use crate::traits::{Clock, SystemClock};

const RESPONSE_TIME_WINDOW: usize = 100;
const TRANSITION_LOG_SIZE: usize = 50;

/// Position of the breaker in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// A bounded number of probe calls decide whether to close again.
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// State before.
    pub from: CircuitState,
    /// State after.
    pub to: CircuitState,
}

/// Failure of a guarded call.
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The breaker rejected the call without running it.
    #[error(transparent)]
    Rejected(#[from] ProtectError),
    /// The operation ran and failed.
    #[error("guarded operation failed: {0}")]
    Operation(E),
}

impl<E> CallError<E> {
    /// The inner operation error, if the call actually ran.
    #[must_use]
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(error) => Some(error),
            Self::Rejected(_) => None,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Calls admitted through the breaker.
    pub total_calls: u64,
    /// Admitted calls that succeeded.
    pub total_successes: u64,
    /// Admitted calls that failed.
    pub total_failures: u64,
    /// Calls rejected without running.
    pub total_rejections: u64,
    /// Times the breaker has entered the open state.
    pub open_count: u64,
    /// Consecutive failures counted towards opening.
    pub consecutive_failures: u32,
    /// Mean response time of recent successful calls, in milliseconds.
    pub avg_response_ms: f64,
    /// Seconds since the last recorded failure.
    pub seconds_since_last_failure: Option<f64>,
    /// Seconds until an open breaker admits a probe.
    pub time_until_retry_secs: Option<f64>,
    /// Most recent state transitions, oldest first.
    pub recent_transitions: Vec<StateTransition>,
}

type StateChangeFn = Box<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    open_count: u64,
    response_times: VecDeque<Duration>,
    transitions: VecDeque<StateTransition>,
}

impl BreakerInner {
    fn transition(&mut self, to: CircuitState) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        if to == CircuitState::Open {
            self.open_count += 1;
        }
        self.transitions.push_back(StateTransition {
            at: Utc::now(),
            from,
            to,
        });
        while self.transitions.len() > TRANSITION_LOG_SIZE {
            self.transitions.pop_front();
        }
        (from, to)
    }
}

/// Circuit breaker with lazy open-to-half-open recovery.
///
/// The breaker opens after a configured run of consecutive failures,
/// rejects calls while open, and after the cooldown admits a bounded
/// number of concurrent probes. Enough probe successes close it; any
/// probe failure reopens it and restarts the cooldown.
///
/// Wrap async work with [`CircuitBreaker::call`], or drive the breaker
/// manually with [`CircuitBreaker::try_acquire`] followed by exactly one
/// of [`CircuitBreaker::record_success`] / [`CircuitBreaker::record_failure`]
/// per admitted call.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    hooks: RwLock<Vec<StateChangeFn>>,
}

impl CircuitBreaker {
    /// Create a breaker on the system clock.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a breaker with an explicit clock, for deterministic tests.
    #[must_use]
    pub fn with_clock(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
                last_failure_at: None,
                total_calls: 0,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
                open_count: 0,
                response_times: VecDeque::with_capacity(RESPONSE_TIME_WINDOW),
                transitions: VecDeque::new(),
            }),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    ///
    /// An open breaker whose cooldown has elapsed reads as `HalfOpen`.
    /// The stored transition (and its hooks) still happens on the next
    /// admission attempt, so a read consumes no probe slot.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let inner = self.lock_inner();
        effective_state(&inner, &self.config, now)
    }

    /// Register a hook invoked on every state change.
    pub fn on_state_change<F>(&self, hook: F)
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        let mut hooks = match self.hooks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        hooks.push(Box::new(hook));
    }

    /// Run an async operation under the breaker.
    ///
    /// Any `Err` from the operation counts as a failure.
    ///
    /// # Errors
    ///
    /// [`CallError::Rejected`] when the breaker refuses the call,
    /// [`CallError::Operation`] when the operation itself fails.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.call_with(|_| true, operation).await
    }

    /// Run an async operation, counting only classified errors as failures.
    ///
    /// Errors for which `counts_as_failure` returns `false` are still
    /// returned to the caller but recorded as successes, so an expected
    /// error (say, a 404) does not trip the breaker.
    ///
    /// # Errors
    ///
    /// [`CallError::Rejected`] when the breaker refuses the call,
    /// [`CallError::Operation`] when the operation itself fails.
    pub async fn call_with<F, T, E, C>(
        &self,
        counts_as_failure: C,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        self.try_acquire()?;
        let started = self.clock.now();
        match operation.await {
            Ok(value) => {
                let elapsed = self.clock.now().saturating_duration_since(started);
                self.record_success_timed(Some(elapsed));
                Ok(value)
            }
            Err(error) => {
                if counts_as_failure(&error) {
                    self.record_failure();
                } else {
                    self.record_success_timed(None);
                }
                Err(CallError::Operation(error))
            }
        }
    }

    /// Run an async operation, substituting a fallback value when rejected.
    ///
    /// A rejection still counts in the stats; only the fast-fail error is
    /// replaced by what `fallback` produces from it. The operation does
    /// not run on rejection, and its own failures pass through unchanged.
    ///
    /// # Errors
    ///
    /// [`CallError::Operation`] when the admitted operation fails.
    pub async fn call_or_else<F, T, E, B>(
        &self,
        fallback: B,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
        B: FnOnce(ProtectError) -> T,
    {
        match self.call(operation).await {
            Err(CallError::Rejected(rejection)) => Ok(fallback(rejection)),
            other => other,
        }
    }

    /// Ask the breaker to admit one call.
    ///
    /// Every `Ok` must be balanced by exactly one
    /// [`CircuitBreaker::record_success`] or
    /// [`CircuitBreaker::record_failure`].
    ///
    /// # Errors
    ///
    /// [`ProtectError::CircuitOpen`] while the breaker is open or all
    /// half-open probe slots are taken.
    pub fn try_acquire(&self) -> Result<(), ProtectError> {
        let now = self.clock.now();
        let changed;
        {
            let mut inner = self.lock_inner();
            match inner.state {
                CircuitState::Closed => {
                    inner.total_calls += 1;
                    changed = None;
                }
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                    let cooldown = self.config.cooldown();
                    if elapsed < cooldown {
                        inner.total_rejections += 1;
                        return Err(ProtectError::CircuitOpen {
                            name: self.name.clone(),
                            retry_after: cooldown - elapsed,
                        });
                    }
                    changed = Some(inner.transition(CircuitState::HalfOpen));
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 1;
                    inner.total_calls += 1;
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight >= self.config.half_open_max_calls {
                        inner.total_rejections += 1;
                        return Err(ProtectError::CircuitOpen {
                            name: self.name.clone(),
                            retry_after: Duration::ZERO,
                        });
                    }
                    inner.half_open_in_flight += 1;
                    inner.total_calls += 1;
                    changed = None;
                }
            }
        }
        self.fire(changed);
        Ok(())
    }

    /// Record a successful call admitted by [`CircuitBreaker::try_acquire`].
    pub fn record_success(&self) {
        self.record_success_timed(None);
    }

    /// Record a failed call admitted by [`CircuitBreaker::try_acquire`].
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let changed;
        {
            let mut inner = self.lock_inner();
            inner.total_failures += 1;
            inner.last_failure_at = Some(now);
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        changed = Some(inner.transition(CircuitState::Open));
                        inner.opened_at = Some(now);
                    } else {
                        changed = None;
                    }
                }
                CircuitState::HalfOpen => {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                    inner.consecutive_failures += 1;
                    changed = Some(inner.transition(CircuitState::Open));
                    inner.opened_at = Some(now);
                }
                CircuitState::Open => {
                    changed = None;
                }
            }
        }
        self.fire(changed);
    }

    /// Remaining cooldown of an open breaker, `None` once probes are
    /// admitted.
    #[must_use]
    pub fn time_until_retry(&self) -> Option<Duration> {
        let now = self.clock.now();
        let inner = self.lock_inner();
        if effective_state(&inner, &self.config, now) != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        Some(
            self.config
                .cooldown()
                .saturating_sub(now.saturating_duration_since(opened_at)),
        )
    }

    /// Force the breaker open, restarting the cooldown from now.
    pub fn force_open(&self) {
        let now = self.clock.now();
        let changed;
        {
            let mut inner = self.lock_inner();
            changed = if inner.state == CircuitState::Open {
                None
            } else {
                Some(inner.transition(CircuitState::Open))
            };
            inner.opened_at = Some(now);
            inner.half_open_in_flight = 0;
        }
        self.fire(changed);
    }

    /// Return to a clean closed state.
    pub fn reset(&self) {
        let changed;
        {
            let mut inner = self.lock_inner();
            changed = if inner.state == CircuitState::Closed {
                None
            } else {
                Some(inner.transition(CircuitState::Closed))
            };
            inner.consecutive_failures = 0;
            inner.half_open_successes = 0;
            inner.half_open_in_flight = 0;
            inner.opened_at = None;
        }
        self.fire(changed);
    }

    /// Snapshot of counters and recent transitions.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let now = self.clock.now();
        let inner = self.lock_inner();
        let avg_response_ms = if inner.response_times.is_empty() {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let n = inner.response_times.len() as f64;
            inner
                .response_times
                .iter()
                .map(Duration::as_secs_f64)
                .sum::<f64>()
                / n
                * 1000.0
        };
        let state = effective_state(&inner, &self.config, now);
        let time_until_retry_secs = if state == CircuitState::Open {
            inner.opened_at.map(|at| {
                self.config
                    .cooldown()
                    .saturating_sub(now.saturating_duration_since(at))
                    .as_secs_f64()
            })
        } else {
            None
        };
        BreakerStats {
            name: self.name.clone(),
            state,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            open_count: inner.open_count,
            consecutive_failures: inner.consecutive_failures,
            avg_response_ms,
            seconds_since_last_failure: inner
                .last_failure_at
                .map(|at| now.saturating_duration_since(at).as_secs_f64()),
            time_until_retry_secs,
            recent_transitions: inner.transitions.iter().cloned().collect(),
        }
    }

    fn record_success_timed(&self, elapsed: Option<Duration>) {
        let changed;
        {
            let mut inner = self.lock_inner();
            inner.total_successes += 1;
            if let Some(elapsed) = elapsed {
                inner.response_times.push_back(elapsed);
                while inner.response_times.len() > RESPONSE_TIME_WINDOW {
                    inner.response_times.pop_front();
                }
            }
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    changed = None;
                }
                CircuitState::HalfOpen => {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        changed = Some(inner.transition(CircuitState::Closed));
                        inner.consecutive_failures = 0;
                        inner.half_open_successes = 0;
                        inner.half_open_in_flight = 0;
                        inner.opened_at = None;
                    } else {
                        changed = None;
                    }
                }
                CircuitState::Open => {
                    changed = None;
                }
            }
        }
        self.fire(changed);
    }

    fn fire(&self, changed: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = changed else {
            return;
        };
        match to {
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, %from, %to, "circuit opened");
            }
            _ => {
                tracing::info!(breaker = %self.name, %from, %to, "circuit state changed");
            }
        }
        let hooks = match self.hooks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for hook in hooks.iter() {
            hook(&self.name, from, to);
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(breaker = %self.name, "breaker lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// State as an observer should see it: `Open` past its cooldown reads as
/// `HalfOpen` even though the stored transition is deferred to the next
/// admission.
fn effective_state(inner: &BreakerInner, config: &BreakerConfig, now: Instant) -> CircuitState {
    if inner.state == CircuitState::Open {
        if let Some(at) = inner.opened_at {
            if now.saturating_duration_since(at) >= config.cooldown() {
                return CircuitState::HalfOpen;
            }
        }
    }
    inner.state
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
