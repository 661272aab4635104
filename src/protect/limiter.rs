//! Token-bucket and sliding-window rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::LimiterConfig;
use crate::error::ProtectError;
use crate::traits::{Clock, SystemClock};

const MAX_SLEEP_SLICE: Duration = Duration::from_millis(100);
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Continuous-refill token bucket.
///
/// Tokens accrue at `rate` per second up to `capacity`; fractional
/// amounts are kept so precision does not drift at low rates.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket on the system clock.
    #[must_use]
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self::with_clock(rate, capacity, Arc::new(SystemClock))
    }

    /// Create a full bucket with an explicit clock.
    #[must_use]
    pub fn with_clock(rate: f64, capacity: f64, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(0.0);
        let now = clock.now();
        Self {
            rate: rate.max(0.0),
            capacity,
            clock,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// Take `n` tokens if available.
    pub fn try_acquire(&self, n: f64) -> bool {
        let now = self.clock.now();
        let mut state = self.lock_state();
        Self::refill(&mut state, now, self.rate, self.capacity);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Wait until `n` tokens are available, or until `timeout` passes.
    ///
    /// Sleeps in short slices so a raised refill rate takes effect quickly.
    /// Returns `false` on timeout.
    pub async fn acquire(&self, n: f64, timeout: Option<Duration>) -> bool {
        let started = self.clock.now();
        loop {
            if self.try_acquire(n) {
                return true;
            }
            let mut wait = self.wait_time(n).min(MAX_SLEEP_SLICE);
            if let Some(limit) = timeout {
                let elapsed = self.clock.now().saturating_duration_since(started);
                if elapsed >= limit {
                    return false;
                }
                wait = wait.min(limit - elapsed);
            }
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Time until `n` tokens will be available at the current rate.
    #[must_use]
    pub fn wait_time(&self, n: f64) -> Duration {
        let now = self.clock.now();
        let mut state = self.lock_state();
        Self::refill(&mut state, now, self.rate, self.capacity);
        if state.tokens >= n {
            return Duration::ZERO;
        }
        if self.rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((n - state.tokens) / self.rate)
    }

    /// Tokens currently available.
    #[must_use]
    pub fn available(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.lock_state();
        Self::refill(&mut state, now, self.rate, self.capacity);
        state.tokens
    }

    /// Return `n` tokens to the bucket, clamped at capacity.
    pub fn add_tokens(&self, n: f64) {
        let mut state = self.lock_state();
        state.tokens = (state.tokens + n.max(0.0)).min(self.capacity);
    }

    /// Refill rate in tokens per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Burst capacity.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(state: &mut BucketState, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * rate).min(capacity);
        state.last_refill = now;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("token bucket lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of one rate limiter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    /// Limiter name.
    pub name: String,
    /// Requests admitted.
    pub total_allowed: u64,
    /// Requests rejected for any reason.
    pub total_rejected: u64,
    /// Rejections caused by the global bucket.
    pub rejected_global: u64,
    /// Rejections caused by per-client buckets.
    pub rejected_client: u64,
    /// Admissions in the trailing second.
    pub current_rate: f64,
    /// Highest observed one-second admission rate.
    pub peak_rate: f64,
    /// Tokens left in the global bucket.
    pub available_tokens: f64,
    /// Distinct client buckets currently tracked.
    pub active_clients: usize,
}

struct ClientBucket {
    bucket: TokenBucket,
    last_seen: Instant,
}

struct RequestLog {
    admitted: VecDeque<Instant>,
    total_allowed: u64,
    rejected_global: u64,
    rejected_client: u64,
    peak_rate: f64,
}

/// Global plus per-client token-bucket limiter.
///
/// Every request spends one global token; with per-client limits on, it
/// must also pass the caller's own bucket. A request that clears the
/// global bucket but fails its client bucket refunds the global token,
/// so one noisy client cannot starve the shared budget.
///
/// The client map is bounded: buckets idle past the configured TTL are
/// swept, and at the cap the least-recently-seen bucket is evicted.
pub struct RateLimiter {
    name: String,
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
    global: TokenBucket,
    clients: Mutex<HashMap<String, ClientBucket>>,
    log: Mutex<RequestLog>,
}

impl RateLimiter {
    /// Create a limiter on the system clock.
    #[must_use]
    pub fn new(name: impl Into<String>, config: LimiterConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a limiter with an explicit clock, for deterministic tests.
    #[must_use]
    pub fn with_clock(
        name: impl Into<String>,
        config: LimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let global = TokenBucket::with_clock(config.rate_per_sec, config.burst_size, clock.clone());
        Self {
            name: name.into(),
            config,
            clock,
            global,
            clients: Mutex::new(HashMap::new()),
            log: Mutex::new(RequestLog {
                admitted: VecDeque::new(),
                total_allowed: 0,
                rejected_global: 0,
                rejected_client: 0,
                peak_rate: 0.0,
            }),
        }
    }

    /// Limiter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether one request from `client` is admitted right now.
    pub fn allow(&self, client: Option<&str>) -> bool {
        self.try_acquire(client).is_ok()
    }

    /// Admit one request from `client` or explain the rejection.
    ///
    /// # Errors
    ///
    /// [`ProtectError::RateLimited`] carrying the time until a token frees
    /// up and the admission rate over the trailing second.
    pub fn try_acquire(&self, client: Option<&str>) -> Result<(), ProtectError> {
        let now = self.clock.now();

        if !self.global.try_acquire(1.0) {
            let retry_after = self.global.wait_time(1.0);
            let current_rate = self.note_rejection(now, true);
            return Err(ProtectError::RateLimited {
                name: self.name.clone(),
                retry_after,
                current_rate,
            });
        }

        if self.config.per_client {
            if let Some(id) = client {
                let (admitted, retry_after) = self.client_admit(id, now);
                if !admitted {
                    // Give the unspent global token back
                    self.global.add_tokens(1.0);
                    let current_rate = self.note_rejection(now, false);
                    return Err(ProtectError::RateLimited {
                        name: format!("{}:{id}", self.name),
                        retry_after,
                        current_rate,
                    });
                }
            }
        }

        self.note_admission(now);
        Ok(())
    }

    /// Snapshot of counters, rates and bucket occupancy.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let now = self.clock.now();
        let active_clients = self.lock_clients().len();
        let available_tokens = self.global.available();
        let mut log = self.lock_log();
        let current_rate = Self::rate_in_window(&mut log, now, Duration::from_secs(1));
        RateLimiterStats {
            name: self.name.clone(),
            total_allowed: log.total_allowed,
            total_rejected: log.rejected_global + log.rejected_client,
            rejected_global: log.rejected_global,
            rejected_client: log.rejected_client,
            current_rate,
            peak_rate: log.peak_rate,
            available_tokens,
            active_clients,
        }
    }

    /// Drop one client's bucket; its next request starts a fresh burst.
    pub fn reset_client(&self, client: &str) -> bool {
        self.lock_clients().remove(client).is_some()
    }

    /// Drop all client buckets.
    pub fn clear_clients(&self) {
        self.lock_clients().clear();
    }

    fn client_admit(&self, id: &str, now: Instant) -> (bool, Duration) {
        let mut clients = self.lock_clients();

        if let Some(entry) = clients.get_mut(id) {
            entry.last_seen = now;
            if entry.bucket.try_acquire(1.0) {
                return (true, Duration::ZERO);
            }
            let wait = entry.bucket.wait_time(1.0);
            return (false, wait);
        }

        // New client: sweep idle buckets, then make room if still at the cap
        let ttl = self.config.client_idle_ttl();
        if !ttl.is_zero() {
            clients.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < ttl);
        }
        if clients.len() >= self.config.max_clients.max(1) {
            let oldest = clients
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                clients.remove(&key);
                tracing::debug!(limiter = %self.name, client = %key, "evicted idle client bucket");
            }
        }

        let bucket = TokenBucket::with_clock(
            self.config.client_rate_per_sec,
            self.config.client_burst_size,
            self.clock.clone(),
        );
        let admitted = bucket.try_acquire(1.0);
        let wait = if admitted {
            Duration::ZERO
        } else {
            bucket.wait_time(1.0)
        };
        clients.insert(id.to_string(), ClientBucket {
            bucket,
            last_seen: now,
        });
        (admitted, wait)
    }

    fn note_admission(&self, now: Instant) {
        let mut log = self.lock_log();
        log.total_allowed += 1;
        log.admitted.push_back(now);
        let current = Self::rate_in_window(&mut log, now, Duration::from_secs(1));
        if current > log.peak_rate {
            log.peak_rate = current;
        }
    }

    fn note_rejection(&self, now: Instant, global: bool) -> f64 {
        let mut log = self.lock_log();
        if global {
            log.rejected_global += 1;
        } else {
            log.rejected_client += 1;
        }
        Self::rate_in_window(&mut log, now, Duration::from_secs(1))
    }

    fn rate_in_window(log: &mut RequestLog, now: Instant, window: Duration) -> f64 {
        while let Some(front) = log.admitted.front() {
            if now.saturating_duration_since(*front) > RATE_WINDOW {
                log.admitted.pop_front();
            } else {
                break;
            }
        }
        #[allow(clippy::cast_precision_loss)]
        let count = log
            .admitted
            .iter()
            .rev()
            .take_while(|at| now.saturating_duration_since(**at) <= window)
            .count() as f64;
        count
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<String, ClientBucket>> {
        match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(limiter = %self.name, "client map lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, RequestLog> {
        match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Fixed-count limiter over a sliding time window.
///
/// Simpler than the token bucket and without bursts beyond the cap:
/// at most `max_requests` admissions in any trailing `window`.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    admitted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter on the system clock.
    #[must_use]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self::with_clock(max_requests, window, Arc::new(SystemClock))
    }

    /// Create a limiter with an explicit clock.
    #[must_use]
    pub fn with_clock(max_requests: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests,
            window,
            clock,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    /// Whether one more request fits into the current window.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut admitted = self.lock_admitted();
        Self::prune(&mut admitted, now, self.window);
        if admitted.len() < self.max_requests {
            admitted.push_back(now);
            true
        } else {
            false
        }
    }

    /// Admissions currently inside the window.
    #[must_use]
    pub fn current_count(&self) -> usize {
        let now = self.clock.now();
        let mut admitted = self.lock_admitted();
        Self::prune(&mut admitted, now, self.window);
        admitted.len()
    }

    /// Requests the current window still has room for.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.max_requests.saturating_sub(self.current_count())
    }

    /// Time until the oldest admission slides out of the window.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        let now = self.clock.now();
        let mut admitted = self.lock_admitted();
        Self::prune(&mut admitted, now, self.window);
        if admitted.len() < self.max_requests {
            return Duration::ZERO;
        }
        admitted.front().map_or(Duration::ZERO, |oldest| {
            self.window
                .saturating_sub(now.saturating_duration_since(*oldest))
        })
    }

    fn prune(admitted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = admitted.front() {
            if now.saturating_duration_since(*front) >= window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock_admitted(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        match self.admitted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
