//! Environment variable based runtime tuning.
//!
//! All knobs are read once at startup with [`RuntimeConfig::from_env`];
//! malformed values fall back to the default rather than failing startup.
//!
//! ## Environment Variables
//!
//! ### `TUNEBRIDGE_POOL_WORKERS`
//!
//! Worker thread count for the shared thread-pool work queue. Default: `4`.
//!
//! ### `TUNEBRIDGE_EVENT_DISPATCH_MS`
//!
//! Coalescing delay between a player event being dispatched and the push to
//! active event streams. A larger value batches more bursty updates into one
//! frame; a smaller one lowers update latency. Default: `20`.
//!
//! ### `TUNEBRIDGE_PING_INTERVAL_MS`
//!
//! Interval of the `: ping` comment frame written to idle event streams so
//! dead sockets are detected. Default: `15000`.

use std::env;
use std::time::Duration;

const DEFAULT_POOL_WORKERS: usize = 4;
const DEFAULT_EVENT_DISPATCH_MS: u64 = 20;
const DEFAULT_PING_INTERVAL_MS: u64 = 15_000;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Threads in the shared pool work queue (default: 4).
    pub pool_workers: usize,
    /// Event-stream coalescing delay (default: 20 ms).
    pub event_dispatch_delay: Duration,
    /// Event-stream keep-alive ping interval (default: 15 s).
    pub ping_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            pool_workers: DEFAULT_POOL_WORKERS,
            event_dispatch_delay: Duration::from_millis(DEFAULT_EVENT_DISPATCH_MS),
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        RuntimeConfig {
            pool_workers: parsed_var("TUNEBRIDGE_POOL_WORKERS", DEFAULT_POOL_WORKERS).max(1),
            event_dispatch_delay: Duration::from_millis(parsed_var(
                "TUNEBRIDGE_EVENT_DISPATCH_MS",
                DEFAULT_EVENT_DISPATCH_MS,
            )),
            ping_interval: Duration::from_millis(parsed_var(
                "TUNEBRIDGE_PING_INTERVAL_MS",
                DEFAULT_PING_INTERVAL_MS,
            )),
        }
    }
}

fn parsed_var<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(val) => val.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}
