//! Global atomic counters for Gantry observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    runs_started: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    triggers_deferred: AtomicU64,
    poll_failures: AtomicU64,
    deploys_attempted: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            triggers_deferred: AtomicU64::new(0),
            poll_failures: AtomicU64::new(0),
            deploys_attempted: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_started", "counter incremented");
    }

    pub fn inc_runs_succeeded(&self) {
        self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_succeeded", "counter incremented");
    }

    /// Counts both failed and aborted runs.
    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_failed", "counter incremented");
    }

    pub fn inc_triggers_deferred(&self) {
        self.triggers_deferred.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "triggers_deferred", "counter incremented");
    }

    pub fn inc_poll_failures(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "poll_failures", "counter incremented");
    }

    pub fn inc_deploys_attempted(&self) {
        self.deploys_attempted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deploys_attempted", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a run, daemon shutdown)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_started = self.runs_started(),
            runs_succeeded = self.runs_succeeded(),
            runs_failed = self.runs_failed(),
            triggers_deferred = self.triggers_deferred(),
            poll_failures = self.poll_failures(),
            deploys_attempted = self.deploys_attempted(),
        );
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_succeeded(&self) -> u64 {
        self.runs_succeeded.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn triggers_deferred(&self) -> u64 {
        self.triggers_deferred.load(Ordering::Relaxed)
    }

    pub fn poll_failures(&self) -> u64 {
        self.poll_failures.load(Ordering::Relaxed)
    }

    pub fn deploys_attempted(&self) -> u64 {
        self.deploys_attempted.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.runs_started,
            &self.runs_succeeded,
            &self.runs_failed,
            &self.triggers_deferred,
            &self.poll_failures,
            &self.deploys_attempted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
