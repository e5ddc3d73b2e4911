//! Structured observability hooks for the session lifecycle.
//!
//! Events are emitted at `info!` level unless noted; filter with `RUST_LOG`.

use tracing::info;

/// Session-scoped span. Attach it to async work with `Instrument::instrument`
/// so every event below carries `session_id` and `probe`.
///
/// ```ignore
/// supervise(...).instrument(session_span("2026-03-01_12-30-05", "exec")).await
/// ```
pub fn session_span(session_id: &str, probe_id: &str) -> tracing::Span {
    tracing::info_span!("bpfmon.session", session_id = %session_id, probe = %probe_id)
}

/// Emit event: tracer spawned for a session.
pub fn emit_session_started(session_id: &str, probe_id: &str, pid: Option<u32>, bound_ms: Option<u64>) {
    info!(
        event = "session.started",
        session_id = %session_id,
        probe = %probe_id,
        pid = ?pid,
        bound_ms = ?bound_ms,
    );
}

/// Emit event: session finalized.
pub fn emit_session_finished(
    session_id: &str,
    probe_id: &str,
    status: &str,
    duration_ms: u64,
    events: u64,
    diagnostics: u64,
) {
    info!(
        event = "session.finished",
        session_id = %session_id,
        probe = %probe_id,
        status = %status,
        duration_ms = duration_ms,
        events = events,
        diagnostics = diagnostics,
    );
}

/// Emit event: a termination signal was sent to a probe's process group.
pub fn emit_signal_sent(session_id: &str, pgid: u32, signal: &str) {
    info!(event = "session.signal", session_id = %session_id, pgid = pgid, signal = %signal);
}

/// Emit event: a probe run failed (warning level).
pub fn emit_probe_failed(
    probe_id: &str,
    session_id: Option<&str>,
    error: &dyn std::fmt::Display,
    partial_data: bool,
) {
    tracing::warn!(
        event = "probe.failed",
        probe = %probe_id,
        session_id = session_id.unwrap_or("-"),
        error = %error,
        partial_data = partial_data,
    );
}

/// Emit event: report artifact written.
pub fn emit_report_written(session_id: &str, path: &std::path::Path, format: &str, total_events: u64) {
    info!(
        event = "report.written",
        session_id = %session_id,
        path = %path.display(),
        format = %format,
        total_events = total_events,
    );
}
