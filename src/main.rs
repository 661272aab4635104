//! Vigil standalone monitor binary.
//!
//! Runs the protection runtime on its own, which is useful for watching
//! a host interactively or smoke-testing a deployment's configuration.
//! All logs go to stderr.
//!
//! Coverage is excluded because main requires a live signal handler and
//! cannot be unit tested.

// Enable the coverage attribute when running with nightly for llvm-cov exclusions
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::time::Duration;

use vigil::{MonitorConfig, Vigil};

/// Period of the binary's own heartbeat towards the watchdog.
const HEARTBEAT_SECS: u64 = 5;

#[cfg_attr(coverage_nightly, coverage(off))]
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("LOG_LEVEL")
                .unwrap_or_else(|_| "info".to_string())
                .parse()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("vigil starting...");

    let config = match MonitorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        app = %config.app_name,
        environment = %config.environment,
        collection_interval_secs = config.sampler.collection_interval_secs,
        "Configuration loaded"
    );

    let vigil = Vigil::new(config);
    if let Err(e) = vigil.start() {
        tracing::error!("Startup error: {e}");
        std::process::exit(1);
    }

    // Beat on behalf of this binary's main loop until Ctrl-C arrives.
    let mut ticker = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => vigil.heartbeat(),
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::error!("Signal handler error: {e}");
                }
                break;
            }
        }
    }

    tracing::info!("Shutdown signal received");
    if let Err(e) = vigil.stop().await {
        tracing::error!("Shutdown error: {e}");
        std::process::exit(1);
    }

    tracing::info!("vigil shutdown complete");
}
