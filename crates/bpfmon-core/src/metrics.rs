//! Global atomic counters for bpfmon observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a batch).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Atomic counters, no allocation or locking.
pub struct Metrics {
    sessions_started: AtomicU64,
    events_written: AtomicU64,
    diagnostics_written: AtomicU64,
    reports_written: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            events_written: AtomicU64::new(0),
            diagnostics_written: AtomicU64::new(0),
            reports_written: AtomicU64::new(0),
        }
    }

    pub fn inc_sessions_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_started", "counter incremented");
    }

    pub fn inc_events_written(&self) {
        self.events_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_diagnostics_written(&self) {
        self.diagnostics_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reports_written(&self) {
        self.reports_written.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "reports_written", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a batch, end of a command)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            sessions_started = self.sessions_started(),
            events_written = self.events_written(),
            diagnostics_written = self.diagnostics_written(),
            reports_written = self.reports_written(),
        );
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn events_written(&self) -> u64 {
        self.events_written.load(Ordering::Relaxed)
    }

    pub fn diagnostics_written(&self) -> u64 {
        self.diagnostics_written.load(Ordering::Relaxed)
    }

    pub fn reports_written(&self) -> u64 {
        self.reports_written.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.sessions_started.store(0, Ordering::Relaxed);
        self.events_written.store(0, Ordering::Relaxed);
        self.diagnostics_written.store(0, Ordering::Relaxed);
        self.reports_written.store(0, Ordering::Relaxed);
    }
}
