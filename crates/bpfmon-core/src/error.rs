//! Error taxonomy for the bpfmon core.
//!
//! Only [`MonitorError::ProbeNotFound`] and [`MonitorError::ProcessLaunch`]
//! abort a probe run. Abnormal child exits are recorded as a `failed` session
//! status, unparsable lines go to the diagnostic log, and reports over a
//! missing event log come back as an explicit empty summary.

use std::path::PathBuf;

/// Errors produced by the bpfmon core.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("probe not found: {selector}")]
    ProbeNotFound { selector: String },

    #[error("probe {probe}: file missing at {}", path.display())]
    ProbeFileMissing { probe: String, path: PathBuf },

    #[error("probe {probe}: failed to launch tracer for session {session_id}: {source}")]
    ProcessLaunch {
        probe: String,
        session_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} is already finalized")]
    SessionFinalized(String),

    #[error("report already exists at {} (regenerate explicitly to replace it)", path.display())]
    ReportExists { path: PathBuf },

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    /// Whether this error aborts the run of a single probe before any child
    /// process produced data.
    pub fn is_launch_fatal(&self) -> bool {
        matches!(
            self,
            MonitorError::ProbeNotFound { .. }
                | MonitorError::ProbeFileMissing { .. }
                | MonitorError::ProcessLaunch { .. }
        )
    }
}

impl MonitorError {
    /// Session the error refers to, when one was already created.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            MonitorError::ProcessLaunch { session_id, .. } => Some(session_id),
            MonitorError::SessionNotFound(id) | MonitorError::SessionFinalized(id) => Some(id),
            _ => None,
        }
    }
}

/// Result type for bpfmon core operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
