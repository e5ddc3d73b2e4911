//! Session store: one directory per probe run.
//!
//! Layout: `<sessions_dir>/<id>/{events.jsonl, stderr.log, session.json}`.
//! Ids are local timestamps (`YYYY-MM-DD_HH-MM-SS`); a second session in the
//! same second gets `-1`, the next `-2`, and so on. Directories are created
//! with an exclusive `create_dir`, so concurrent invocations never share one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::catalog::ProbeDescriptor;
use crate::error::{MonitorError, Result};

pub const EVENTS_FILE: &str = "events.jsonl";
pub const DIAGNOSTICS_FILE: &str = "stderr.log";
pub const META_FILE: &str = "session.json";

const ID_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    TimedOut,
    Failed,
    Interrupted,
}

impl SessionStatus {
    /// Terminal statuses are never changed again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::TimedOut => "timed_out",
            SessionStatus::Failed => "failed",
            SessionStatus::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMeta {
    pub id: String,
    pub probe_id: String,
    pub probe_code: String,
    pub probe_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    /// Wall-clock bound in seconds, if one was applied.
    pub duration_bound_secs: Option<f64>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub event_count: u64,
    #[serde(default)]
    pub diagnostic_count: u64,
}

/// Final values recorded when a session is closed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionClose {
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub event_count: u64,
    pub diagnostic_count: u64,
}

/// Explicit reference to one session directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub id: String,
    pub dir: PathBuf,
}

impl SessionHandle {
    /// Handle for an existing session directory.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { id, dir }
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    pub fn diagnostics_path(&self) -> PathBuf {
        self.dir.join(DIAGNOSTICS_FILE)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    /// Read `session.json`.
    pub fn read_meta(&self) -> Result<SessionMeta> {
        let raw = fs::read(self.meta_path()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MonitorError::SessionNotFound(self.id.clone())
            } else {
                MonitorError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Creates, lists and resolves session directories.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a new running session for `probe`.
    pub fn create_session(
        &self,
        probe: &ProbeDescriptor,
        bound: Option<Duration>,
    ) -> Result<SessionHandle> {
        self.create_session_at(probe, bound, Local::now())
    }

    /// Create a session whose id derives from `now`.
    pub fn create_session_at(
        &self,
        probe: &ProbeDescriptor,
        bound: Option<Duration>,
        now: DateTime<Local>,
    ) -> Result<SessionHandle> {
        fs::create_dir_all(&self.root)?;
        let base = now.format(ID_FORMAT).to_string();

        let mut suffix = 0u32;
        let handle = loop {
            let id = if suffix == 0 {
                base.clone()
            } else {
                format!("{base}-{suffix}")
            };
            let dir = self.root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => break SessionHandle { id, dir },
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(MonitorError::Io(e)),
            }
        };

        let meta = SessionMeta {
            id: handle.id.clone(),
            probe_id: probe.id.clone(),
            probe_code: probe.code.clone(),
            probe_path: probe.path.clone(),
            started_at: now.with_timezone(&Utc),
            ended_at: None,
            status: SessionStatus::Running,
            duration_bound_secs: bound.map(|d| d.as_secs_f64()),
            exit_code: None,
            event_count: 0,
            diagnostic_count: 0,
        };
        fs::File::create(handle.events_path())?;
        fs::File::create(handle.diagnostics_path())?;
        write_meta(&handle, &meta)?;

        tracing::debug!(session_id = %handle.id, dir = %handle.dir.display(), "session directory created");
        Ok(handle)
    }

    /// Record the final status of a running session.
    pub fn finalize(&self, handle: &SessionHandle, close: SessionClose) -> Result<SessionMeta> {
        let mut meta = handle.read_meta()?;
        if meta.status.is_terminal() {
            return Err(MonitorError::SessionFinalized(handle.id.clone()));
        }
        meta.status = close.status;
        meta.ended_at = Some(Utc::now());
        meta.exit_code = close.exit_code;
        meta.event_count = close.event_count;
        meta.diagnostic_count = close.diagnostic_count;
        write_meta(handle, &meta)?;
        Ok(meta)
    }

    /// Finished sessions with an event log, in creation order.
    ///
    /// Sessions still running or lacking `events.jsonl` are skipped, not removed.
    pub fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MonitorError::Io(e)),
        };

        let mut sessions = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let handle = SessionHandle::from_dir(entry.path());
            if !handle.events_path().is_file() {
                continue;
            }
            match handle.read_meta() {
                Ok(meta) if meta.status.is_terminal() => sessions.push(meta),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(session_id = %handle.id, error = %e, "skipping unreadable session")
                }
            }
        }

        sessions.sort_by(|a, b| id_order_key(&a.id).cmp(&id_order_key(&b.id)));
        Ok(sessions)
    }

    /// Resolve a 1-based listing index or an exact session id.
    pub fn resolve(&self, id_or_index: &str) -> Result<SessionHandle> {
        let key = id_or_index.trim();
        if let Ok(index) = key.parse::<usize>() {
            let sessions = self.list_sessions()?;
            if index >= 1 && index <= sessions.len() {
                return Ok(self.handle(&sessions[index - 1].id));
            }
        }

        let valid_name = !key.is_empty() && !key.contains(['/', '\\']) && key != "." && key != "..";
        if valid_name {
            let handle = self.handle(key);
            if handle.meta_path().is_file() || handle.events_path().is_file() {
                return Ok(handle);
            }
        }
        Err(MonitorError::SessionNotFound(key.to_string()))
    }

    /// Handle for `id` under this store, without checking it exists.
    pub fn handle(&self, id: &str) -> SessionHandle {
        SessionHandle {
            id: id.to_string(),
            dir: self.root.join(id),
        }
    }
}

/// Sort key: the timestamp part, then the numeric collision suffix.
fn id_order_key(id: &str) -> (&str, u32) {
    // The timestamp part is fixed width: YYYY-MM-DD_HH-MM-SS.
    const BASE_LEN: usize = 19;
    if id.len() > BASE_LEN && id.is_char_boundary(BASE_LEN) {
        let (base, rest) = id.split_at(BASE_LEN);
        if let Some(n) = rest.strip_prefix('-').and_then(|s| s.parse().ok()) {
            return (base, n);
        }
    }
    (id, 0)
}

fn write_meta(handle: &SessionHandle, meta: &SessionMeta) -> Result<()> {
    let json = serde_json::to_vec_pretty(meta)?;
    // Atomic write: temp file in the session directory, then rename.
    let mut tmp = NamedTempFile::new_in(&handle.dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(handle.meta_path()).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn probe() -> ProbeDescriptor {
        ProbeDescriptor::from_path("probes/exec.bt")
    }

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap()
    }

    fn close(status: SessionStatus) -> SessionClose {
        SessionClose {
            status,
            exit_code: Some(0),
            event_count: 0,
            diagnostic_count: 0,
        }
    }

    #[test]
    fn collision_appends_increasing_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let a = store.create_session_at(&probe(), None, fixed_time()).unwrap();
        let b = store.create_session_at(&probe(), None, fixed_time()).unwrap();
        let c = store.create_session_at(&probe(), None, fixed_time()).unwrap();
        assert_eq!(a.id, "2026-03-01_12-30-05");
        assert_eq!(b.id, "2026-03-01_12-30-05-1");
        assert_eq!(c.id, "2026-03-01_12-30-05-2");
        assert_ne!(a.dir, b.dir);
    }

    #[test]
    fn new_session_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let h = store
            .create_session_at(&probe(), Some(Duration::from_secs(5)), fixed_time())
            .unwrap();
        let meta = h.read_meta().unwrap();
        assert_eq!(meta.status, SessionStatus::Running);
        assert_eq!(meta.probe_id, "exec");
        assert_eq!(meta.duration_bound_secs, Some(5.0));
        assert!(meta.ended_at.is_none());
        assert_eq!(fs::metadata(h.events_path()).unwrap().len(), 0);
        assert!(h.diagnostics_path().is_file());
    }

    #[test]
    fn finalize_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let h = store.create_session_at(&probe(), None, fixed_time()).unwrap();
        let meta = store.finalize(&h, close(SessionStatus::Completed)).unwrap();
        assert_eq!(meta.status, SessionStatus::Completed);
        assert!(meta.ended_at.is_some());

        let err = store.finalize(&h, close(SessionStatus::Failed)).unwrap_err();
        assert!(matches!(err, MonitorError::SessionFinalized(_)));
        assert_eq!(h.read_meta().unwrap().status, SessionStatus::Completed);
    }

    #[test]
    fn id_order_key_sorts_suffix_numerically() {
        let mut ids = vec![
            "2026-03-01_12-30-05-10",
            "2026-03-01_12-30-05-2",
            "2026-03-01_12-30-05",
            "2026-02-28_23-59-59",
        ];
        ids.sort_by_key(|id| id_order_key(*id));
        assert_eq!(
            ids,
            vec![
                "2026-02-28_23-59-59",
                "2026-03-01_12-30-05",
                "2026-03-01_12-30-05-2",
                "2026-03-01_12-30-05-10",
            ]
        );
    }

    #[test]
    fn resolve_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        assert!(store.resolve("../etc").is_err());
        assert!(store.resolve("..").is_err());
    }
}
