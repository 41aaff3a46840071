use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Backend API usage metrics
#[derive(Debug, Default)]
pub struct BackendApiMetrics {
    pub total_requests: AtomicU64,
    pub errors: AtomicU64,
    pub polls: AtomicU64,
    pub poll_failures: AtomicU64,
    pub stale_updates_discarded: AtomicU64,
}

impl BackendApiMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_update(&self) {
        self.stale_updates_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> BackendApiStats {
        BackendApiStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            stale_updates_discarded: self.stale_updates_discarded.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            requests = stats.total_requests,
            errors = stats.errors,
            polls = stats.polls,
            poll_failures = stats.poll_failures,
            stale_discarded = stats.stale_updates_discarded,
            "Backend API metrics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendApiStats {
    pub total_requests: u64,
    pub errors: u64,
    pub polls: u64,
    pub poll_failures: u64,
    pub stale_updates_discarded: u64,
}

/// Global metrics instance
static BACKEND_METRICS: std::sync::LazyLock<BackendApiMetrics> =
    std::sync::LazyLock::new(BackendApiMetrics::new);

pub fn backend_metrics() -> &'static BackendApiMetrics {
    &BACKEND_METRICS
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}
