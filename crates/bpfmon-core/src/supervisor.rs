//! Probe supervisor: runs one tracer process for one session.
//!
//! Per launch three activities run concurrently: the child itself, a relay
//! task that owns the session's [`EventStreamWriter`] and drains stdout and
//! stderr, and the supervisor waiting on the earliest of child exit, the
//! duration bound, or an interrupt. On bound or interrupt the child's process
//! group gets SIGTERM, then SIGKILL after the grace period. The session is only
//! finalized after both pipes reach EOF and the logs are synced.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::catalog::ProbeDescriptor;
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::interrupt::InterruptListener;
use crate::metrics::METRICS;
use crate::obs;
use crate::progress::{ProgressTicker, ProgressUpdate};
use crate::session::{SessionClose, SessionHandle, SessionMeta, SessionStatus, SessionStore};
use crate::writer::{EventStreamWriter, WriteStats};

/// Process exit code for a run that ended on its own with status 0.
pub const EXIT_NORMAL: i32 = 0;
/// Process exit code for a run stopped by its duration bound.
pub const EXIT_TIMED_OUT: i32 = 124;
/// Process exit code for a run stopped by the user.
pub const EXIT_INTERRUPTED: i32 = 130;
/// Process exit code for a tracer that failed.
pub const EXIT_CHILD_FAILED: i32 = 3;

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitDisposition {
    /// The tracer exited with status 0.
    Normal,
    /// The duration bound elapsed and the tracer was stopped.
    TimedOut,
    /// An external interrupt stopped the tracer.
    Interrupted,
    /// The tracer exited unsuccessfully on its own, or its output could not be stored.
    Failed { code: Option<i32> },
}

impl ExitDisposition {
    pub fn status(self) -> SessionStatus {
        match self {
            ExitDisposition::Normal => SessionStatus::Completed,
            ExitDisposition::TimedOut => SessionStatus::TimedOut,
            ExitDisposition::Interrupted => SessionStatus::Interrupted,
            ExitDisposition::Failed { .. } => SessionStatus::Failed,
        }
    }

    /// Exit code the CLI reports for this disposition.
    pub fn exit_code(self) -> i32 {
        match self {
            ExitDisposition::Normal => EXIT_NORMAL,
            ExitDisposition::TimedOut => EXIT_TIMED_OUT,
            ExitDisposition::Interrupted => EXIT_INTERRUPTED,
            ExitDisposition::Failed { .. } => EXIT_CHILD_FAILED,
        }
    }

    /// Bound expiry counts as success.
    pub fn is_success(self) -> bool {
        matches!(self, ExitDisposition::Normal | ExitDisposition::TimedOut)
    }
}

/// Per-launch options.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Wall-clock bound; `None` runs until interrupted or the tracer exits.
    pub bound: Option<Duration>,
    pub interrupt: InterruptListener,
    /// Receives progress ticks while the tracer runs.
    pub progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl LaunchOptions {
    pub fn new(bound: Option<Duration>, interrupt: InterruptListener) -> Self {
        Self {
            bound,
            interrupt,
            progress: None,
        }
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        self.progress = Some(tx);
        self
    }
}

/// Structured result of one supervised run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session: SessionHandle,
    pub probe_id: String,
    pub disposition: ExitDisposition,
    /// Raw exit code of the tracer, when it exited normally.
    pub exit_code: Option<i32>,
    pub stats: WriteStats,
    pub duration: Duration,
    pub meta: SessionMeta,
}

impl SessionOutcome {
    pub fn status(&self) -> SessionStatus {
        self.disposition.status()
    }

    /// Whether the event log holds records a report can use.
    pub fn has_usable_data(&self) -> bool {
        self.stats.events > 0
    }
}

/// Runs a single probe session. Consumed by [`ProbeSupervisor::launch`], so an
/// instance never owns more than one running session.
pub struct ProbeSupervisor {
    config: Arc<MonitorConfig>,
    store: SessionStore,
}

impl ProbeSupervisor {
    pub fn new(config: Arc<MonitorConfig>, store: SessionStore) -> Self {
        Self { config, store }
    }

    /// Create the session, start the tracer and supervise it to completion.
    ///
    /// Returns `Err` only when the probe file is missing or the session cannot
    /// be set up and the tracer started; every other ending, including a failure
    /// to record the final metadata, is reported through the outcome.
    pub async fn launch(self, probe: &ProbeDescriptor, options: LaunchOptions) -> Result<SessionOutcome> {
        if !probe.file_exists() {
            return Err(MonitorError::ProbeFileMissing {
                probe: probe.id.clone(),
                path: probe.path.clone(),
            });
        }

        let session = self.store.create_session(probe, options.bound)?;
        let span = obs::session_span(&session.id, &probe.id);
        self.run(probe, session, options).instrument(span).await
    }

    async fn run(
        self,
        probe: &ProbeDescriptor,
        session: SessionHandle,
        options: LaunchOptions,
    ) -> Result<SessionOutcome> {
        let LaunchOptions {
            bound,
            mut interrupt,
            progress,
        } = options;

        // Both logs exist before the child starts, so early output has a home.
        let writer = match EventStreamWriter::open(&session).await {
            Ok(w) => w,
            Err(e) => {
                self.close_failed(&session, &probe.id, None);
                return Err(MonitorError::Io(e));
            }
        };

        let mut child = match self.command(&probe.path).spawn() {
            Ok(child) => child,
            Err(source) => {
                drop(writer);
                self.close_failed(&session, &probe.id, None);
                let err = MonitorError::ProcessLaunch {
                    probe: probe.id.clone(),
                    session_id: session.id.clone(),
                    source,
                };
                obs::emit_probe_failed(&probe.id, Some(&session.id), &err, false);
                return Err(err);
            }
        };

        let started = Instant::now();
        let pgid = child.id();
        METRICS.inc_sessions_started();
        obs::emit_session_started(
            &session.id,
            &probe.id,
            pgid,
            bound.map(|b| b.as_millis() as u64),
        );

        let mut relay = tokio::spawn(relay_output(
            child.stdout.take(),
            child.stderr.take(),
            writer,
        ));
        let ticker = progress.map(|tx| {
            ProgressTicker::spawn(
                session.id.clone(),
                probe.id.clone(),
                bound,
                self.config.progress_interval(),
                tx,
            )
        });

        let (mut disposition, exit_code) = self
            .supervise(&mut child, pgid, bound, &mut interrupt, &session.id)
            .await;
        drop(ticker);

        // Wait for the pipes to drain, not just for the exit notification.
        let drained = match tokio::time::timeout(self.config.drain_timeout(), &mut relay).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.drain_timeout_ms,
                    "output pipes still open after tracer exit, killing process group"
                );
                signal_group(&mut child, pgid, GroupSignal::Kill, &session.id);
                relay.await
            }
        };

        let stats = match drained {
            Ok(outcome) => {
                if let Some(e) = outcome.error {
                    tracing::error!(error = %e, "session output could not be stored completely");
                    if disposition == ExitDisposition::Normal {
                        disposition = ExitDisposition::Failed { code: exit_code };
                    }
                }
                outcome.stats
            }
            Err(e) => {
                tracing::error!(error = %e, "output relay task failed");
                if disposition == ExitDisposition::Normal {
                    disposition = ExitDisposition::Failed { code: exit_code };
                }
                WriteStats::default()
            }
        };

        let duration = started.elapsed();
        let close = SessionClose {
            status: disposition.status(),
            exit_code,
            event_count: stats.events,
            diagnostic_count: stats.diagnostics,
        };
        // The tracer already ran; a metadata failure must not discard its output.
        let meta = match self.store.finalize(&session, close) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::error!(error = %e, "cannot finalize session metadata");
                disposition = ExitDisposition::Failed { code: exit_code };
                detached_meta(
                    probe,
                    &session,
                    bound,
                    duration,
                    SessionClose {
                        status: disposition.status(),
                        ..close
                    },
                )
            }
        };

        obs::emit_session_finished(
            &session.id,
            &probe.id,
            meta.status.as_str(),
            duration.as_millis() as u64,
            stats.events,
            stats.diagnostics,
        );
        if let ExitDisposition::Failed { code } = disposition {
            let reason = match code {
                Some(0) => "session could not be recorded completely".to_string(),
                Some(code) => format!("tracer exited with code {code}"),
                None => "tracer terminated abnormally".to_string(),
            };
            obs::emit_probe_failed(&probe.id, Some(&session.id), &reason, stats.events > 0);
        }

        Ok(SessionOutcome {
            session,
            probe_id: probe.id.clone(),
            disposition,
            exit_code,
            stats,
            duration,
            meta,
        })
    }

    fn command(&self, probe_path: &Path) -> Command {
        let mut cmd = Command::new(&self.config.tracer);
        cmd.args(&self.config.tracer_args)
            .arg(probe_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: terminal SIGINT stays with us and we forward it.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Block until the tracer exits, the bound elapses or an interrupt fires.
    async fn supervise(
        &self,
        child: &mut Child,
        pgid: Option<u32>,
        bound: Option<Duration>,
        interrupt: &mut InterruptListener,
        session_id: &str,
    ) -> (ExitDisposition, Option<i32>) {
        let deadline = async {
            match bound {
                Some(bound) => tokio::time::sleep(bound).await,
                None => std::future::pending().await,
            }
        };

        let stopped = tokio::select! {
            status = child.wait() => return classify_exit(status),
            _ = deadline => ExitDisposition::TimedOut,
            _ = interrupt.fired() => ExitDisposition::Interrupted,
        };
        tracing::info!(reason = ?stopped, "stopping tracer");

        signal_group(child, pgid, GroupSignal::Terminate, session_id);
        let status = match tokio::time::timeout(self.config.grace_period(), child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    grace_ms = self.config.grace_period_ms,
                    "tracer ignored SIGTERM, sending SIGKILL"
                );
                signal_group(child, pgid, GroupSignal::Kill, session_id);
                child.wait().await
            }
        };

        let exit_code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "could not reap tracer");
                None
            }
        };
        (stopped, exit_code)
    }

    fn close_failed(&self, session: &SessionHandle, probe_id: &str, exit_code: Option<i32>) {
        let close = SessionClose {
            status: SessionStatus::Failed,
            exit_code,
            event_count: 0,
            diagnostic_count: 0,
        };
        if let Err(e) = self.store.finalize(session, close) {
            tracing::error!(probe = %probe_id, session_id = %session.id, error = %e, "cannot finalize failed session");
        }
    }
}

/// Metadata for a session whose `session.json` could not be finalized.
fn detached_meta(
    probe: &ProbeDescriptor,
    session: &SessionHandle,
    bound: Option<Duration>,
    duration: Duration,
    close: SessionClose,
) -> SessionMeta {
    let ended_at = Utc::now();
    let started_at = chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| ended_at.checked_sub_signed(d))
        .unwrap_or(ended_at);
    SessionMeta {
        id: session.id.clone(),
        probe_id: probe.id.clone(),
        probe_code: probe.code.clone(),
        probe_path: probe.path.clone(),
        started_at,
        ended_at: Some(ended_at),
        status: close.status,
        duration_bound_secs: bound.map(|b| b.as_secs_f64()),
        exit_code: close.exit_code,
        event_count: close.event_count,
        diagnostic_count: close.diagnostic_count,
    }
}

fn classify_exit(status: std::io::Result<ExitStatus>) -> (ExitDisposition, Option<i32>) {
    match status {
        Ok(status) if status.success() => (ExitDisposition::Normal, status.code()),
        Ok(status) => {
            let code = status.code();
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    tracing::warn!(signal, "tracer killed by signal");
                }
            }
            (ExitDisposition::Failed { code }, code)
        }
        Err(e) => {
            tracing::warn!(error = %e, "waiting for tracer failed");
            (ExitDisposition::Failed { code: None }, None)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal the tracer's whole process group.
#[cfg(unix)]
fn signal_group(child: &mut Child, pgid: Option<u32>, signal: GroupSignal, session_id: &str) {
    let (signo, name) = match signal {
        GroupSignal::Terminate => (libc::SIGTERM, "SIGTERM"),
        GroupSignal::Kill => (libc::SIGKILL, "SIGKILL"),
    };
    let Some(pgid) = pgid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        // Already reaped: nothing left to signal except stragglers we cannot name.
        let _ = child.start_kill();
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions; pgid is the group
    // created for this child via process_group(0).
    let rc = unsafe { libc::killpg(pgid, signo) };
    if rc == 0 {
        obs::emit_signal_sent(session_id, pgid as u32, name);
    } else {
        let err = std::io::Error::last_os_error();
        tracing::debug!(pgid, signal = name, error = %err, "killpg failed");
        if matches!(signal, GroupSignal::Kill) {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pgid: Option<u32>, _signal: GroupSignal, session_id: &str) {
    if child.start_kill().is_ok() {
        obs::emit_signal_sent(session_id, 0, "kill");
    }
}

struct RelayOutcome {
    stats: WriteStats,
    error: Option<std::io::Error>,
}

/// Drain both pipes into the writer until EOF, then sync the logs.
async fn relay_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    mut writer: EventStreamWriter,
) -> RelayOutcome {
    let mut error = pump(stdout, stderr, &mut writer).await;
    let stats = writer.stats();
    if let Err(e) = writer.finish().await {
        error.get_or_insert(e);
    }
    RelayOutcome { stats, error }
}

/// Route stdout lines through classification and stderr lines to the
/// diagnostic log. Keeps draining after a write failure so the tracer never
/// blocks on a full pipe; the first error is returned.
async fn pump<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
    writer: &mut EventStreamWriter,
) -> Option<std::io::Error>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = stdout.map(|s| BufReader::new(s).split(b'\n'));
    let mut err = stderr.map(|s| BufReader::new(s).split(b'\n'));
    let mut failure: Option<std::io::Error> = None;

    loop {
        tokio::select! {
            seg = next_segment(&mut out), if out.is_some() => match seg {
                Ok(Some(line)) => {
                    if failure.is_none() {
                        if let Err(e) = writer.write_line(&line).await {
                            failure = Some(e);
                        }
                    }
                }
                Ok(None) => out = None,
                Err(e) => {
                    failure.get_or_insert(e);
                    out = None;
                }
            },
            seg = next_segment(&mut err), if err.is_some() => match seg {
                Ok(Some(line)) => {
                    if failure.is_none() {
                        if let Err(e) = writer.write_diagnostic(&line).await {
                            failure = Some(e);
                        }
                    }
                }
                Ok(None) => err = None,
                Err(e) => {
                    failure.get_or_insert(e);
                    err = None;
                }
            },
            else => break,
        }
    }
    failure
}

async fn next_segment<R>(lines: &mut Option<Split<R>>) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_segment().await,
        None => Ok(None),
    }
}
