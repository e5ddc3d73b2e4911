//! bpfmon core library
//!
//! Supervises bpftrace probe processes, stores each run as a session
//! directory, and aggregates session event logs into reports.

pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod interrupt;
pub mod metrics;
pub mod obs;
pub mod progress;
pub mod report;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod writer;

pub use catalog::{ProbeCatalog, ProbeDescriptor};
pub use config::{MonitorConfig, ReportPolicy, DEFAULT_CONFIG_FILE};
pub use driver::{
    BatchOutcome, ExecutionMode, Orchestrator, ProbeRun, RunPlan, RunState, SessionLauncher,
    TracerLauncher, EXIT_ERROR, EXIT_LAUNCH_FAILED,
};
pub use error::{MonitorError, Result};
pub use interrupt::{interrupt_channel, InterruptListener, Interrupter};
pub use progress::{ProgressTicker, ProgressUpdate};
pub use report::{summarize, write_report, Report, ReportFormat, Summary};
pub use session::{SessionHandle, SessionMeta, SessionStatus, SessionStore};
pub use supervisor::{
    ExitDisposition, LaunchOptions, ProbeSupervisor, SessionOutcome, EXIT_CHILD_FAILED,
    EXIT_INTERRUPTED, EXIT_NORMAL, EXIT_TIMED_OUT,
};
pub use writer::{classify_line, EventRecord, EventStreamWriter, LineClass, WriteStats};

/// Version of the bpfmon core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
