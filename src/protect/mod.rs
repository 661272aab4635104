//! Traffic protection: circuit breakers and rate limiters.
//!
//! [`CircuitBreaker`] fails fast when a dependency is down;
//! [`RateLimiter`] bounds global and per-client request rates with token
//! buckets; [`SlidingWindowLimiter`] offers a strict windowed alternative.
//!
//! # Example
//!
//! ```
//! use vigil::config::BreakerConfig;
//! use vigil::protect::{CircuitBreaker, CircuitState};
//!
//! let breaker = CircuitBreaker::new("payments", BreakerConfig::default());
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! breaker.force_open();
//! assert!(breaker.try_acquire().is_err());
//! ```

mod breaker;
mod limiter;

pub use breaker::{BreakerStats, CallError, CircuitBreaker, CircuitState, StateTransition};
pub use limiter::{RateLimiter, RateLimiterStats, SlidingWindowLimiter, TokenBucket};
