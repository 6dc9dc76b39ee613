//! Per-tablet gauges for the retryable-request index.
//!
//! The gauges are lock-free so they can be updated on the write hot path
//! and scraped concurrently without coordination.

use std::sync::atomic::{AtomicI64, Ordering};

/// Gauge pair exported per tablet.
#[derive(Debug, Default)]
pub struct RetryableRequestsMetrics {
    /// Number of running retryable requests.
    running_retryable_requests: AtomicI64,
    /// Number of replicated retryable request ranges.
    replicated_retryable_request_ranges: AtomicI64,
}

impl RetryableRequestsMetrics {
    pub const fn new() -> Self {
        Self {
            running_retryable_requests: AtomicI64::new(0),
            replicated_retryable_request_ranges: AtomicI64::new(0),
        }
    }

    pub fn running_retryable_requests(&self) -> i64 {
        self.running_retryable_requests.load(Ordering::Relaxed)
    }

    pub fn replicated_retryable_request_ranges(&self) -> i64 {
        self.replicated_retryable_request_ranges.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_running(&self) {
        self.running_retryable_requests
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_running(&self) {
        self.running_retryable_requests
            .fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_ranges(&self) {
        self.replicated_retryable_request_ranges
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_ranges(&self) {
        self.dec_ranges_by(1);
    }

    pub(crate) fn dec_ranges_by(&self, count: i64) {
        self.replicated_retryable_request_ranges
            .fetch_sub(count, Ordering::Relaxed);
    }
}
