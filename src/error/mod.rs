//! Error types for the vigil runtime.
//!
//! This module defines a hierarchical error system:
//! - [`MonitorError`]: Top-level errors returned by the runtime API
//! - [`ConfigError`]: Configuration loading errors
//! - [`ProtectError`]: Circuit breaker and rate limiter rejections
//! - [`AlertError`]: Alert queueing and channel dispatch errors
//! - [`RuntimeError`]: Lifecycle errors (start/stop/shutdown)
//!
//! All errors implement `Send + Sync` for async compatibility.
//!
//! Rejection errors ([`ProtectError`]) carry the data a caller needs to
//! schedule a retry; nothing in this module is fatal to the host process.

use std::time::Duration;

use thiserror::Error;

/// Top-level runtime error.
///
/// This is the main error type returned by public API functions.
/// It wraps all subsystem errors for unified error handling.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protection rejection (circuit breaker or rate limiter).
    #[error("Protection error: {0}")]
    Protect(#[from] ProtectError),

    /// Alert pipeline error.
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    /// Runtime lifecycle error.
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl MonitorError {
    /// Returns true if this error is an admission rejection that the
    /// caller can retry after waiting.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Protect(_))
    }
}

/// Configuration errors.
///
/// Range violations are not errors: [`crate::config::MonitorConfig::validate`]
/// returns those as a list of human-readable issues instead, and
/// construction proceeds with per-field defaults.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable was set but could not be parsed.
    #[error("Invalid value for {variable}: {message}")]
    InvalidValue {
        /// The environment variable name.
        variable: String,
        /// Description of what's invalid.
        message: String,
    },

    /// A configuration file could not be read.
    #[error("Cannot read config file {path}: {message}")]
    FileRead {
        /// Path of the file.
        path: String,
        /// Description of the I/O failure.
        message: String,
    },

    /// A configuration file could not be parsed.
    #[error("Cannot parse config file {path}: {message}")]
    FileParse {
        /// Path of the file.
        path: String,
        /// Description of the parse failure.
        message: String,
    },
}

/// Admission rejections raised by the protection layer.
///
/// These are the only errors expected on hot caller paths. Both variants
/// carry a computed retry delay.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtectError {
    /// The named circuit breaker is open and fails fast.
    #[error("Circuit '{name}' is open: retry after {:.2}s", retry_after.as_secs_f64())]
    CircuitOpen {
        /// The breaker name.
        name: String,
        /// Time until the breaker will admit a probe call.
        retry_after: Duration,
    },

    /// The named rate limiter rejected the acquisition.
    #[error("Rate limit exceeded for '{name}': retry after {:.2}s (current rate {current_rate:.1}/s)", retry_after.as_secs_f64())]
    RateLimited {
        /// The limiter name.
        name: String,
        /// Time until a token would be available.
        retry_after: Duration,
        /// Observed request rate over the trailing window.
        current_rate: f64,
    },
}

impl ProtectError {
    /// The computed delay after which the caller may retry.
    #[must_use]
    pub const fn retry_after(&self) -> Duration {
        match self {
            Self::CircuitOpen { retry_after, .. } | Self::RateLimited { retry_after, .. } => {
                *retry_after
            }
        }
    }

    /// The name of the breaker or limiter that rejected the call.
    #[must_use]
    pub fn resource_name(&self) -> &str {
        match self {
            Self::CircuitOpen { name, .. } | Self::RateLimited { name, .. } => name,
        }
    }
}

/// Alert pipeline errors.
///
/// Channel failures are swallowed by the dispatch worker (delivery is
/// best-effort); these types surface only through channel implementations
/// and the read-side API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlertError {
    /// A channel failed to deliver an alert.
    #[error("Channel '{channel}' delivery failed: {message}")]
    ChannelFailed {
        /// The channel name.
        channel: String,
        /// Description of the failure.
        message: String,
    },

    /// The dispatch queue is closed (manager shut down).
    #[error("Alert dispatch queue is closed")]
    QueueClosed,

    /// The dispatch queue is full; the alert was recorded but not delivered.
    #[error("Alert dispatch queue is full")]
    QueueFull,
}

/// Runtime lifecycle errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// `start` was called while the runtime is already running.
    #[error("Runtime is already running")]
    AlreadyRunning,

    /// A lifecycle operation requires a running runtime.
    #[error("Runtime is not running")]
    NotRunning,

    /// Background loops did not exit within the shutdown grace period.
    #[error("Shutdown grace of {:.1}s exceeded with {pending} loop(s) still running", grace.as_secs_f64())]
    ShutdownTimeout {
        /// The grace period that elapsed.
        grace: Duration,
        /// Number of loops that had not exited.
        pending: usize,
    },
}
