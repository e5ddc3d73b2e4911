//! bpfmon - session-based bpftrace probe runner
//!
//! ## Commands
//!
//! - `probes`: List the probe catalog
//! - `run`: Run one or more probes, each in its own session
//! - `sessions`: List finished sessions
//! - `report`: Summarize a session's event log

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::Level;

use bpfmon_core::metrics::METRICS;
use bpfmon_core::report::render;
use bpfmon_core::{
    interrupt_channel, summarize, write_report, BatchOutcome, ExecutionMode, MonitorConfig,
    MonitorError, Orchestrator, ProbeCatalog, ProbeRun, ProgressUpdate, ReportFormat, ReportPolicy,
    RunPlan, RunState, SessionStore, Summary, TracerLauncher, DEFAULT_CONFIG_FILE, EXIT_ERROR,
    EXIT_LAUNCH_FAILED,
};

#[derive(Parser)]
#[command(name = "bpfmon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run bpftrace probes as recorded sessions and summarize them", long_about = None)]
struct Cli {
    /// Configuration file (default: ./bpfmon.toml when present)
    #[arg(long, global = true, env = "BPFMON_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines (and JSON batch results for `run`)
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cataloged probes
    Probes {
        /// Only list probes of this category
        #[arg(long)]
        category: Option<String>,
    },

    /// Run probes, one session each
    Run {
        /// Probe key, code, listing index or path to a .bt file
        #[arg(required = true)]
        selectors: Vec<String>,

        /// Stop each probe after this many seconds (default: until Ctrl-C)
        #[arg(short, long)]
        duration: Option<f64>,

        /// Write a report for every finished session
        #[arg(long)]
        report: Option<ReportFormat>,

        /// Run all probes at once instead of one after another
        #[arg(long)]
        parallel: bool,

        /// Do not print progress ticks
        #[arg(long)]
        no_progress: bool,
    },

    /// List finished sessions, oldest first
    Sessions,

    /// Summarize a session
    Report {
        /// Session id or listing index
        session: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: ReportFormat,

        /// Replace an existing report artifact
        #[arg(long)]
        regenerate: bool,

        /// Also print the report to stdout
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    bpfmon_core::telemetry::init_tracing(cli.json, level);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            error_exit_code(&e)
        }
    };
    METRICS.flush();
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Probes { category } => cmd_probes(&config, category.as_deref()).map(|()| 0),
        Commands::Run {
            selectors,
            duration,
            report,
            parallel,
            no_progress,
        } => {
            let bound = duration.map(duration_from_secs).transpose()?;
            let plan = RunPlan {
                selectors,
                bound,
                report,
                mode: if parallel {
                    ExecutionMode::Parallel
                } else {
                    ExecutionMode::Sequential
                },
            };
            cmd_run(config, plan, !no_progress, cli.json).await
        }
        Commands::Sessions => cmd_sessions(&config).map(|()| 0),
        Commands::Report {
            session,
            format,
            regenerate,
            print,
        } => cmd_report(&config, &session, format, regenerate, print),
    }
}

fn load_config(path: Option<&Path>) -> Result<MonitorConfig> {
    let config = match path {
        Some(path) => MonitorConfig::load(path, true)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MonitorConfig::load(Path::new(DEFAULT_CONFIG_FILE), false)
            .context("Failed to load default config")?,
    };
    Ok(config)
}

fn load_catalog(config: &MonitorConfig) -> Result<ProbeCatalog> {
    if !config.catalog.exists() {
        tracing::warn!(path = %config.catalog.display(), "probe catalog not found, only probe file paths can be run");
        return Ok(ProbeCatalog::default());
    }
    ProbeCatalog::load(&config.catalog, &config.probes_dir).context("Failed to load probe catalog")
}

fn duration_from_secs(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .with_context(|| format!("invalid duration: {secs} (expected a positive number of seconds)"))
}

/// Map an error to the process exit code.
fn error_exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<MonitorError>() {
        Some(e) if e.is_launch_fatal() => EXIT_LAUNCH_FAILED,
        _ => EXIT_ERROR,
    }
}

/// List cataloged probes
fn cmd_probes(config: &MonitorConfig, category: Option<&str>) -> Result<()> {
    let catalog = load_catalog(config)?;
    if catalog.is_empty() {
        println!("No probes cataloged in {}", config.catalog.display());
        return Ok(());
    }

    let probes: Vec<_> = match category {
        Some(category) => catalog.by_category(category).collect(),
        None => catalog.probes().iter().collect(),
    };

    println!("{:>3}  {:<6} {:<20} {:<12} DESCRIPTION", "#", "CODE", "PROBE", "TYPE");
    for probe in probes {
        // Listing index is the position in the full catalog, so it stays a valid selector.
        let index = catalog
            .probes()
            .iter()
            .position(|p| p.id == probe.id)
            .map(|i| i + 1)
            .unwrap_or(0);
        let missing = if probe.file_exists() { "" } else { " [missing file]" };
        println!(
            "{:>3}  {:<6} {:<20} {:<12} {}{}",
            index, probe.code, probe.id, probe.category, probe.description, missing
        );
    }
    Ok(())
}

/// Run probes and optionally report on each session
async fn cmd_run(config: MonitorConfig, plan: RunPlan, progress: bool, json: bool) -> Result<i32> {
    let catalog = load_catalog(&config)?;
    let config = Arc::new(config);

    let (interrupter, listener) = interrupt_channel();
    let signals = interrupter.fire_on_ctrl_c();

    let mut orchestrator = Orchestrator::new(
        TracerLauncher::new(Arc::clone(&config)),
        catalog,
        Arc::clone(&config),
        listener,
    );
    let printer = if progress {
        let (tx, rx) = mpsc::unbounded_channel();
        orchestrator = orchestrator.with_progress(tx);
        Some(tokio::spawn(print_progress(rx)))
    } else {
        None
    };

    let outcome = orchestrator.run(&plan).await;
    drop(orchestrator);
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    signals.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_batch(&outcome);
    }
    Ok(outcome.exit_code())
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ProgressUpdate>) {
    while let Some(update) = rx.recv().await {
        match update.remaining {
            Some(remaining) => eprintln!(
                "[{}] {} elapsed {}s, {}s remaining",
                update.session_id,
                update.probe_id,
                update.elapsed.as_secs(),
                remaining.as_secs()
            ),
            None => eprintln!(
                "[{}] {} elapsed {}s (Ctrl-C to stop)",
                update.session_id,
                update.probe_id,
                update.elapsed.as_secs()
            ),
        }
    }
}

fn print_batch(outcome: &BatchOutcome) {
    for run in &outcome.runs {
        match run.state {
            RunState::Skipped => println!("{}: skipped (interrupted)", run.selector),
            RunState::LaunchFailed => println!(
                "{}: launch failed: {}",
                run.probe,
                run.error.as_deref().unwrap_or("unknown error")
            ),
            RunState::Finished { .. } => {
                println!(
                    "{}: session {} {} ({} events, {} diagnostics)",
                    run.probe,
                    run.session_id.as_deref().unwrap_or("-"),
                    run.status.map(|s| s.as_str()).unwrap_or("-"),
                    run.events,
                    run.diagnostics
                );
                if let Some(dir) = &run.session_dir {
                    println!("  data:   {}", dir.display());
                }
                if let Some(note) = partial_data_note(run) {
                    println!("  {note}");
                }
                if let Some(path) = &run.report_path {
                    println!("  report: {}", path.display());
                }
                if let Some(err) = &run.report_error {
                    println!("  report failed: {err}");
                }
            }
        }
    }
}

/// Whether a run that did not succeed left anything worth reporting on.
fn partial_data_note(run: &ProbeRun) -> Option<&'static str> {
    match run.state {
        RunState::Finished { disposition } if !disposition.is_success() => {
            if run.partial_data_usable {
                Some("partial data usable for reporting")
            } else {
                Some("no usable data recorded")
            }
        }
        _ => None,
    }
}

/// List finished sessions
fn cmd_sessions(config: &MonitorConfig) -> Result<()> {
    let store = SessionStore::new(&config.sessions_dir);
    let sessions = store.list_sessions().context("Failed to list sessions")?;
    if sessions.is_empty() {
        println!("No sessions found in {}", config.sessions_dir.display());
        return Ok(());
    }

    println!(
        "{:>3}  {:<24} {:<16} {:<12} {:>8}",
        "#", "SESSION", "PROBE", "STATUS", "EVENTS"
    );
    for (i, meta) in sessions.iter().enumerate() {
        println!(
            "{:>3}  {:<24} {:<16} {:<12} {:>8}",
            i + 1,
            meta.id,
            meta.probe_id,
            meta.status.as_str(),
            meta.event_count
        );
    }
    Ok(())
}

/// Summarize a session and write the report artifact
fn cmd_report(
    config: &MonitorConfig,
    session: &str,
    format: ReportFormat,
    regenerate: bool,
    print: bool,
) -> Result<i32> {
    let store = SessionStore::new(&config.sessions_dir);
    let handle = store.resolve(session)?;

    let report = match summarize(&handle, format)? {
        Summary::Report(report) => report,
        Summary::Empty { session_id, reason } => {
            println!("Session {session_id}: nothing to report ({reason})");
            return Ok(0);
        }
    };

    let policy = if regenerate {
        ReportPolicy::Overwrite
    } else {
        config.report_policy
    };
    let path = write_report(&config.reports_dir, &report, policy)?;

    if print {
        print!("{}", render(&report, format)?);
    }
    println!("Report written to {}", path.display());
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_duration_and_report() {
        let cli = Cli::try_parse_from([
            "bpfmon", "run", "exec", "P02", "-d", "5", "--report", "md", "--parallel",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                selectors,
                duration,
                report,
                parallel,
                ..
            } => {
                assert_eq!(selectors, vec!["exec", "P02"]);
                assert_eq!(duration, Some(5.0));
                assert_eq!(report, Some(ReportFormat::Markdown));
                assert!(parallel);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_a_selector() {
        assert!(Cli::try_parse_from(["bpfmon", "run"]).is_err());
    }

    #[test]
    fn invalid_durations_are_rejected() {
        assert!(duration_from_secs(0.0).is_err());
        assert!(duration_from_secs(-1.0).is_err());
        assert!(duration_from_secs(f64::NAN).is_err());
        assert_eq!(duration_from_secs(1.5).unwrap(), Duration::from_millis(1500));
    }

    fn finished_run(disposition: bpfmon_core::ExitDisposition, usable: bool) -> ProbeRun {
        ProbeRun {
            selector: "exec".into(),
            probe: "exec".into(),
            state: RunState::Finished { disposition },
            session_id: Some("2026-03-01_12-30-05".into()),
            session_dir: None,
            status: Some(disposition.status()),
            events: u64::from(usable),
            diagnostics: 0,
            report_path: None,
            error: None,
            report_error: None,
            partial_data_usable: usable,
        }
    }

    #[test]
    fn unsuccessful_runs_say_whether_data_is_usable() {
        use bpfmon_core::ExitDisposition;

        let failed = finished_run(ExitDisposition::Failed { code: Some(1) }, true);
        assert_eq!(partial_data_note(&failed), Some("partial data usable for reporting"));
        let interrupted = finished_run(ExitDisposition::Interrupted, false);
        assert_eq!(partial_data_note(&interrupted), Some("no usable data recorded"));
        let timed_out = finished_run(ExitDisposition::TimedOut, true);
        assert_eq!(partial_data_note(&timed_out), None);
    }

    #[test]
    fn launch_errors_map_to_exit_code() {
        let err = anyhow::Error::new(MonitorError::ProbeNotFound {
            selector: "x".into(),
        });
        assert_eq!(error_exit_code(&err), EXIT_LAUNCH_FAILED);
        let other = anyhow::anyhow!("boom");
        assert_eq!(error_exit_code(&other), EXIT_ERROR);
    }
}
