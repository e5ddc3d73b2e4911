use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{render, Report, ReportFormat};
use crate::config::ReportPolicy;
use crate::error::{MonitorError, Result};
use crate::metrics::METRICS;
use crate::obs;

/// Canonical artifact path: `<reports_dir>/<session id>.<ext>`.
pub fn report_path(reports_dir: &Path, session_id: &str, format: ReportFormat) -> PathBuf {
    reports_dir.join(format!("{session_id}.{}", format.extension()))
}

/// Render `report` and store it under `reports_dir` according to `policy`.
///
/// The content is written to a temp file in the same directory and then
/// moved into place, so readers never see a partial report. Returns the path
/// actually written.
pub fn write_report(reports_dir: &Path, report: &Report, policy: ReportPolicy) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)?;
    let content = render(report, report.format)?;
    let target = report_path(reports_dir, &report.session_id, report.format);

    let path = match policy {
        ReportPolicy::Overwrite => {
            staged(reports_dir, &content)?
                .persist(&target)
                .map_err(|e| e.error)?;
            target
        }
        ReportPolicy::Refuse => match persist_new(reports_dir, &content, &target)? {
            true => target,
            false => return Err(MonitorError::ReportExists { path: target }),
        },
        ReportPolicy::Version => {
            let mut path = target;
            let mut version = 2u32;
            while !persist_new(reports_dir, &content, &path)? {
                path = reports_dir.join(format!(
                    "{}.v{version}.{}",
                    report.session_id,
                    report.format.extension()
                ));
                version += 1;
            }
            path
        }
    };

    METRICS.inc_reports_written();
    obs::emit_report_written(&report.session_id, &path, report.format.as_str(), report.total_events);
    Ok(path)
}

fn staged(dir: &Path, content: &str) -> Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Move a staged copy of `content` to `path` unless something is already
/// there. `Ok(false)` means the path was taken.
fn persist_new(dir: &Path, content: &str, path: &Path) -> Result<bool> {
    match staged(dir, content)?.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(MonitorError::Io(e.error)),
    }
}
