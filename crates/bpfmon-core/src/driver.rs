//! Orchestration driver: runs a batch of probes and collects their outcomes.
//!
//! Probes run one after another with a short interruptible cooldown between
//! them, unless parallel execution is requested. A failing probe never stops
//! the batch; an interrupt stops launching and marks the remaining probes as
//! skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::catalog::{ProbeCatalog, ProbeDescriptor};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::interrupt::InterruptListener;
use crate::obs;
use crate::progress::ProgressUpdate;
use crate::report::{summarize, write_report, ReportFormat, Summary};
use crate::session::{SessionHandle, SessionStatus, SessionStore};
use crate::supervisor::{
    ExitDisposition, LaunchOptions, ProbeSupervisor, SessionOutcome, EXIT_CHILD_FAILED,
    EXIT_INTERRUPTED, EXIT_NORMAL, EXIT_TIMED_OUT,
};

/// Process exit code when a probe could not be found or started.
pub const EXIT_LAUNCH_FAILED: i32 = 4;
/// Process exit code for any other failure.
pub const EXIT_ERROR: i32 = 1;

/// Starts one supervised session per call.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, probe: &ProbeDescriptor, options: LaunchOptions) -> Result<SessionOutcome>;
}

/// Launcher backed by the real tracer binary.
pub struct TracerLauncher {
    config: Arc<MonitorConfig>,
    store: SessionStore,
}

impl TracerLauncher {
    pub fn new(config: Arc<MonitorConfig>) -> Self {
        let store = SessionStore::new(&config.sessions_dir);
        Self { config, store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }
}

#[async_trait]
impl SessionLauncher for TracerLauncher {
    async fn launch(&self, probe: &ProbeDescriptor, options: LaunchOptions) -> Result<SessionOutcome> {
        ProbeSupervisor::new(Arc::clone(&self.config), self.store.clone())
            .launch(probe, options)
            .await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    /// Probe selectors: catalog key, code, listing index or a probe file path.
    pub selectors: Vec<String>,
    pub bound: Option<Duration>,
    /// Write a report for every finished session.
    pub report: Option<ReportFormat>,
    pub mode: ExecutionMode,
}

/// How one planned probe ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Finished { disposition: ExitDisposition },
    /// Not found, file missing or the tracer could not be started.
    LaunchFailed,
    /// Not started because the batch was interrupted.
    Skipped,
}

/// Per-probe entry of a [`BatchOutcome`].
#[derive(Debug, Clone, Serialize)]
pub struct ProbeRun {
    pub selector: String,
    /// Resolved probe id, or the selector when resolution failed.
    pub probe: String,
    pub state: RunState,
    pub session_id: Option<String>,
    pub session_dir: Option<PathBuf>,
    pub status: Option<SessionStatus>,
    pub events: u64,
    pub diagnostics: u64,
    pub report_path: Option<PathBuf>,
    pub error: Option<String>,
    pub report_error: Option<String>,
    pub partial_data_usable: bool,
}

impl ProbeRun {
    fn finished(selector: &str, outcome: &SessionOutcome) -> Self {
        Self {
            selector: selector.to_string(),
            probe: outcome.probe_id.clone(),
            state: RunState::Finished {
                disposition: outcome.disposition,
            },
            session_id: Some(outcome.session.id.clone()),
            session_dir: Some(outcome.session.dir.clone()),
            status: Some(outcome.status()),
            events: outcome.stats.events,
            diagnostics: outcome.stats.diagnostics,
            report_path: None,
            error: None,
            report_error: None,
            partial_data_usable: outcome.has_usable_data(),
        }
    }

    fn launch_failed(selector: &str, probe: &str, error: &MonitorError) -> Self {
        Self {
            selector: selector.to_string(),
            probe: probe.to_string(),
            state: RunState::LaunchFailed,
            session_id: error.session_id().map(str::to_string),
            session_dir: None,
            status: error.session_id().map(|_| SessionStatus::Failed),
            events: 0,
            diagnostics: 0,
            report_path: None,
            error: Some(error.to_string()),
            report_error: None,
            partial_data_usable: false,
        }
    }

    fn skipped(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            probe: selector.to_string(),
            state: RunState::Skipped,
            session_id: None,
            session_dir: None,
            status: None,
            events: 0,
            diagnostics: 0,
            report_path: None,
            error: None,
            report_error: None,
            partial_data_usable: false,
        }
    }

    pub fn disposition(&self) -> Option<ExitDisposition> {
        match self.state {
            RunState::Finished { disposition } => Some(disposition),
            _ => None,
        }
    }
}

/// Result of a batch, one entry per planned probe in plan order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub runs: Vec<ProbeRun>,
}

impl BatchOutcome {
    pub fn interrupted(&self) -> bool {
        self.runs.iter().any(|r| {
            r.state == RunState::Skipped || r.disposition() == Some(ExitDisposition::Interrupted)
        })
    }

    /// Exit code for the whole batch. Interrupts win, then launch failures,
    /// then child failures, then report errors; a batch with any timed-out
    /// run and no failure exits with the timeout code.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted() {
            return EXIT_INTERRUPTED;
        }
        if self.runs.iter().any(|r| r.state == RunState::LaunchFailed) {
            return EXIT_LAUNCH_FAILED;
        }
        if self
            .runs
            .iter()
            .any(|r| matches!(r.disposition(), Some(ExitDisposition::Failed { .. })))
        {
            return EXIT_CHILD_FAILED;
        }
        if self.runs.iter().any(|r| r.report_error.is_some()) {
            return EXIT_ERROR;
        }
        if self
            .runs
            .iter()
            .any(|r| r.disposition() == Some(ExitDisposition::TimedOut))
        {
            return EXIT_TIMED_OUT;
        }
        EXIT_NORMAL
    }
}

pub struct Orchestrator<L> {
    launcher: L,
    catalog: ProbeCatalog,
    config: Arc<MonitorConfig>,
    interrupt: InterruptListener,
    progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl<L: SessionLauncher> Orchestrator<L> {
    pub fn new(
        launcher: L,
        catalog: ProbeCatalog,
        config: Arc<MonitorConfig>,
        interrupt: InterruptListener,
    ) -> Self {
        Self {
            launcher,
            catalog,
            config,
            interrupt,
            progress: None,
        }
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub async fn run(&self, plan: &RunPlan) -> BatchOutcome {
        tracing::info!(
            probes = plan.selectors.len(),
            mode = ?plan.mode,
            bound_secs = plan.bound.map(|b| b.as_secs_f64()),
            "starting probe batch"
        );
        let runs = match plan.mode {
            ExecutionMode::Sequential => self.run_sequential(plan).await,
            ExecutionMode::Parallel => {
                futures::future::join_all(plan.selectors.iter().map(|s| self.run_one(s, plan))).await
            }
        };
        BatchOutcome { runs }
    }

    async fn run_sequential(&self, plan: &RunPlan) -> Vec<ProbeRun> {
        let mut interrupt = self.interrupt.clone();
        let cooldown = self.config.cooldown();
        let mut runs = Vec::with_capacity(plan.selectors.len());

        for (i, selector) in plan.selectors.iter().enumerate() {
            if interrupt.is_fired() {
                runs.push(ProbeRun::skipped(selector));
                continue;
            }
            if i > 0 && !cooldown.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(cooldown) => {}
                    _ = interrupt.fired() => {
                        runs.push(ProbeRun::skipped(selector));
                        continue;
                    }
                }
            }
            runs.push(self.run_one(selector, plan).await);
        }
        runs
    }

    async fn run_one(&self, selector: &str, plan: &RunPlan) -> ProbeRun {
        let probe = match self.select(selector) {
            Ok(probe) => probe,
            Err(e) => {
                obs::emit_probe_failed(selector, None, &e, false);
                return ProbeRun::launch_failed(selector, selector, &e);
            }
        };

        let mut options = LaunchOptions::new(plan.bound, self.interrupt.clone());
        if let Some(tx) = &self.progress {
            options = options.with_progress(tx.clone());
        }

        let outcome = match self.launcher.launch(&probe, options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                obs::emit_probe_failed(&probe.id, e.session_id(), &e, false);
                return ProbeRun::launch_failed(selector, &probe.id, &e);
            }
        };

        let mut run = ProbeRun::finished(selector, &outcome);
        if let Some(format) = plan.report {
            match self.report(&outcome.session, format).await {
                Ok(path) => run.report_path = path,
                Err(e) => {
                    tracing::warn!(session_id = %outcome.session.id, error = %e, "report generation failed");
                    run.report_error = Some(e.to_string());
                }
            }
        }
        run
    }

    /// Resolve through the catalog, falling back to a probe file path.
    fn select(&self, selector: &str) -> Result<ProbeDescriptor> {
        match self.catalog.resolve(selector) {
            Ok(probe) => Ok(probe.clone()),
            Err(MonitorError::ProbeNotFound { .. }) if looks_like_probe_file(selector) => {
                Ok(ProbeDescriptor::from_path(selector))
            }
            Err(e) => Err(e),
        }
    }

    async fn report(&self, session: &SessionHandle, format: ReportFormat) -> Result<Option<PathBuf>> {
        let session = session.clone();
        let reports_dir = self.config.reports_dir.clone();
        let policy = self.config.report_policy;
        tokio::task::spawn_blocking(move || match summarize(&session, format)? {
            Summary::Report(report) => write_report(&reports_dir, &report, policy).map(Some),
            Summary::Empty { .. } => Ok(None),
        })
        .await
        .map_err(|e| MonitorError::Io(std::io::Error::other(e)))?
    }
}

fn looks_like_probe_file(selector: &str) -> bool {
    let path = Path::new(selector);
    path.extension().is_some_and(|ext| ext == "bt") && path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(disposition: ExitDisposition) -> ProbeRun {
        ProbeRun {
            state: RunState::Finished { disposition },
            status: Some(disposition.status()),
            ..ProbeRun::skipped("p")
        }
    }

    fn batch(runs: Vec<ProbeRun>) -> BatchOutcome {
        BatchOutcome { runs }
    }

    #[test]
    fn exit_code_precedence() {
        assert_eq!(batch(vec![]).exit_code(), EXIT_NORMAL);
        assert_eq!(batch(vec![finished(ExitDisposition::Normal)]).exit_code(), EXIT_NORMAL);
        assert_eq!(
            batch(vec![finished(ExitDisposition::Normal), finished(ExitDisposition::TimedOut)]).exit_code(),
            EXIT_TIMED_OUT
        );
        assert_eq!(
            batch(vec![
                finished(ExitDisposition::TimedOut),
                finished(ExitDisposition::Failed { code: Some(1) })
            ])
            .exit_code(),
            EXIT_CHILD_FAILED
        );

        let not_found = MonitorError::ProbeNotFound {
            selector: "nope".into(),
        };
        assert_eq!(
            batch(vec![
                finished(ExitDisposition::Failed { code: None }),
                ProbeRun::launch_failed("nope", "nope", &not_found),
            ])
            .exit_code(),
            EXIT_LAUNCH_FAILED
        );
        assert_eq!(
            batch(vec![
                ProbeRun::launch_failed("nope", "nope", &not_found),
                finished(ExitDisposition::Interrupted),
            ])
            .exit_code(),
            EXIT_INTERRUPTED
        );
        assert_eq!(
            batch(vec![finished(ExitDisposition::Normal), ProbeRun::skipped("q")]).exit_code(),
            EXIT_INTERRUPTED
        );
    }

    #[test]
    fn report_error_fails_an_otherwise_clean_batch() {
        let mut run = finished(ExitDisposition::TimedOut);
        run.report_error = Some("report already exists".into());
        assert_eq!(batch(vec![run]).exit_code(), EXIT_ERROR);
    }

    #[test]
    fn launch_failure_records_session() {
        let err = MonitorError::ProcessLaunch {
            probe: "exec".into(),
            session_id: "2026-03-01_12-30-05".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "bpftrace"),
        };
        let run = ProbeRun::launch_failed("exec", "exec", &err);
        assert_eq!(run.session_id.as_deref(), Some("2026-03-01_12-30-05"));
        assert_eq!(run.status, Some(SessionStatus::Failed));
        assert!(!run.partial_data_usable);
    }
}
