use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default retention of replicated ranges, which doubles as the eviction
/// delay for clients whose tables have emptied.
pub const DEFAULT_RETRYABLE_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default cap on the time span covered by a single replicated range. The
/// cap keeps a continuous stream of requests split into blocks that log
/// cleanup can drop independently.
pub const DEFAULT_RANGE_TIME_LIMIT_SECS: u64 = 30;

const TIMEOUT_ENV: &str = "KEEL_RETRYABLE_REQUEST_TIMEOUT_SECS";
const RANGE_TIME_LIMIT_ENV: &str = "KEEL_RETRYABLE_REQUEST_RANGE_TIME_LIMIT_SECS";

/// Runtime-adjustable tuning for the retryable-request index.
///
/// Shared across tablets via `Arc`; every algorithm rereads the value it
/// needs on entry, so a change takes effect on the next invocation.
#[derive(Debug)]
pub struct RetryableRequestSettings {
    retryable_request_timeout_secs: AtomicU64,
    retryable_request_range_time_limit_secs: AtomicU64,
}

impl Default for RetryableRequestSettings {
    fn default() -> Self {
        Self::new(
            DEFAULT_RETRYABLE_REQUEST_TIMEOUT_SECS,
            DEFAULT_RANGE_TIME_LIMIT_SECS,
        )
    }
}

impl RetryableRequestSettings {
    pub fn new(timeout_secs: u64, range_time_limit_secs: u64) -> Self {
        Self {
            retryable_request_timeout_secs: AtomicU64::new(timeout_secs),
            retryable_request_range_time_limit_secs: AtomicU64::new(range_time_limit_secs),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            read_env_u64(TIMEOUT_ENV, DEFAULT_RETRYABLE_REQUEST_TIMEOUT_SECS),
            read_env_u64(RANGE_TIME_LIMIT_ENV, DEFAULT_RANGE_TIME_LIMIT_SECS),
        )
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retryable_request_timeout_secs.load(Ordering::Relaxed))
    }

    pub fn set_retention_secs(&self, secs: u64) {
        self.retryable_request_timeout_secs
            .store(secs, Ordering::Relaxed);
    }

    pub fn range_time_limit(&self) -> Duration {
        Duration::from_secs(
            self.retryable_request_range_time_limit_secs
                .load(Ordering::Relaxed),
        )
    }

    pub fn set_range_time_limit_secs(&self, secs: u64) {
        self.retryable_request_range_time_limit_secs
            .store(secs, Ordering::Relaxed);
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
