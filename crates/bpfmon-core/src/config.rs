//! Runtime configuration, loaded from an optional TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "bpfmon.toml";

/// How an existing report artifact is treated when a report is written again.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportPolicy {
    /// Fail with `ReportExists`.
    #[default]
    Refuse,
    /// Replace the artifact atomically.
    Overwrite,
    /// Keep the old artifact and write `<id>.v<N>.<ext>`.
    Version,
}

/// Configuration shared by the supervisor, store, aggregator and driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Root of the per-session directories.
    pub sessions_dir: PathBuf,
    /// Where report artifacts are written.
    pub reports_dir: PathBuf,
    /// Directory probe files are resolved against.
    pub probes_dir: PathBuf,
    /// Probe catalog file. Relative paths resolve against the working directory.
    pub catalog: PathBuf,
    /// Tracer executable.
    pub tracer: PathBuf,
    /// Extra arguments placed before the probe file.
    pub tracer_args: Vec<String>,
    /// Time between SIGTERM and SIGKILL for the probe's process group.
    pub grace_period_ms: u64,
    /// How long to wait for the output pipes to close after the child exits.
    pub drain_timeout_ms: u64,
    /// Pause between sequential probe runs.
    pub cooldown_ms: u64,
    /// Interval between progress ticks.
    pub progress_interval_ms: u64,
    pub report_policy: ReportPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sessions_dir: PathBuf::from("sessions"),
            reports_dir: PathBuf::from("reports"),
            probes_dir: PathBuf::from("probes"),
            catalog: PathBuf::from("probes/catalog.json"),
            tracer: PathBuf::from("bpftrace"),
            tracer_args: Vec::new(),
            grace_period_ms: 3_000,
            drain_timeout_ms: 5_000,
            cooldown_ms: 1_000,
            progress_interval_ms: 1_000,
            report_policy: ReportPolicy::Refuse,
        }
    }
}

impl MonitorConfig {
    /// Parse a configuration from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| MonitorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`. A missing file yields the defaults when `required` is false.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(MonitorError::Config(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.tracer.as_os_str().is_empty() {
            return Err(MonitorError::Config("tracer must not be empty".into()));
        }
        if self.progress_interval_ms == 0 {
            return Err(MonitorError::Config(
                "progress_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_session_layout() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.sessions_dir, PathBuf::from("sessions"));
        assert_eq!(cfg.tracer, PathBuf::from("bpftrace"));
        assert_eq!(cfg.report_policy, ReportPolicy::Refuse);
        assert_eq!(cfg.grace_period(), Duration::from_secs(3));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = MonitorConfig::from_toml_str(
            r#"
            tracer = "/usr/local/bin/bpftrace"
            cooldown_ms = 250
            report_policy = "version"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.tracer, PathBuf::from("/usr/local/bin/bpftrace"));
        assert_eq!(cfg.cooldown(), Duration::from_millis(250));
        assert_eq!(cfg.report_policy, ReportPolicy::Version);
        assert_eq!(cfg.reports_dir, PathBuf::from("reports"));
    }

    #[test]
    fn zero_progress_interval_rejected() {
        let err = MonitorConfig::from_toml_str("progress_interval_ms = 0").unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));
    }

    #[test]
    fn missing_optional_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = MonitorConfig::load(&dir.path().join("absent.toml"), false).unwrap();
        assert_eq!(cfg, MonitorConfig::default());
        assert!(MonitorConfig::load(&dir.path().join("absent.toml"), true).is_err());
    }
}
