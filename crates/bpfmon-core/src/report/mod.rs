//! Report aggregator: single-pass summaries of a session's event log.
//!
//! The log is streamed line by line, never loaded whole, so it can be
//! summarized while the writer is still appending. Only `\n`-terminated lines
//! count; an unterminated tail is reported as incomplete and left out of both
//! the counts and the digest.

mod artifact;
mod histogram;
mod render;

pub use artifact::{report_path, write_report};
pub use histogram::{LatencyHistogram, LatencyStats};
pub use render::{render, render_json, render_markdown, render_text};

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{MonitorError, Result};
use crate::session::SessionHandle;
use crate::writer::EventRecord;

pub const SCHEMA_VERSION: &str = "1.0";

/// Number of processes listed in [`Report::top_processes`].
pub const TOP_PROCESSES: usize = 10;

/// Output rendering of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Text,
    Markdown,
}

impl ReportFormat {
    /// File extension of the report artifact.
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Text => "txt",
            ReportFormat::Markdown => "md",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Text => "text",
            ReportFormat::Markdown => "markdown",
        }
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportFormat {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "text" | "txt" => Ok(ReportFormat::Text),
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            other => Err(MonitorError::Config(format!(
                "unknown report format {other:?} (expected json, text or markdown)"
            ))),
        }
    }
}

/// Name and count pair, used for ranked listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountEntry {
    pub name: String,
    pub count: u64,
}

/// Return-value statistics for one event name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReturnStats {
    /// Records carrying an integer `ret`.
    pub calls: u64,
    pub nonzero: u64,
    /// Negative returns.
    pub errors: u64,
}

impl ReturnStats {
    pub fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.errors as f64 / self.calls as f64
        }
    }
}

/// How the event log's lines were accounted for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LineAccounting {
    /// Complete lines read, including skipped ones.
    pub lines: u64,
    /// Complete lines that were not valid event records.
    pub skipped: u64,
    /// Whether an unterminated trailing line was left out.
    pub incomplete_tail: bool,
    /// Bytes covered by [`Report::sha256`].
    pub bytes: u64,
}

/// Aggregated view of one session's event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub schema_version: String,
    pub session_id: String,
    pub probe_id: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub format: ReportFormat,
    pub total_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub events_by_name: BTreeMap<String, u64>,
    pub top_processes: Vec<CountEntry>,
    /// Keyed by event name; only events that carried `ret`.
    pub returns: BTreeMap<String, ReturnStats>,
    pub latency: Option<LatencyStats>,
    pub lines: LineAccounting,
    /// Hex SHA-256 of the consumed event-log bytes.
    pub sha256: String,
}

/// Result of [`summarize`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Summary {
    /// The session has no event log to summarize.
    Empty { session_id: String, reason: String },
    Report(Box<Report>),
}

impl Summary {
    pub fn report(&self) -> Option<&Report> {
        match self {
            Summary::Report(report) => Some(report),
            Summary::Empty { .. } => None,
        }
    }

    pub fn into_report(self) -> Option<Report> {
        match self {
            Summary::Report(report) => Some(*report),
            Summary::Empty { .. } => None,
        }
    }
}

/// Summarize the event log of `session`.
///
/// A missing log yields [`Summary::Empty`]; an empty one yields a report with
/// zero totals.
pub fn summarize(session: &SessionHandle, format: ReportFormat) -> Result<Summary> {
    let file = match File::open(session.events_path()) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(session_id = %session.id, "no event log, returning empty summary");
            return Ok(Summary::Empty {
                session_id: session.id.clone(),
                reason: "event log not found".to_string(),
            });
        }
        Err(e) => return Err(MonitorError::Io(e)),
    };

    let probe_id = session.read_meta().ok().map(|meta| meta.probe_id);
    let mut aggregator = Aggregator::new();
    aggregator.consume(BufReader::new(file))?;
    Ok(Summary::Report(Box::new(
        aggregator.finish(&session.id, probe_id, format),
    )))
}

/// Streaming accumulator behind [`summarize`].
pub struct Aggregator {
    total: u64,
    by_type: HashMap<String, u64>,
    by_name: HashMap<String, u64>,
    by_comm: HashMap<String, u64>,
    returns: HashMap<String, ReturnStats>,
    latency: LatencyHistogram,
    lines: LineAccounting,
    hasher: Sha256,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            total: 0,
            by_type: HashMap::new(),
            by_name: HashMap::new(),
            by_comm: HashMap::new(),
            returns: HashMap::new(),
            latency: LatencyHistogram::new(),
            lines: LineAccounting::default(),
            hasher: Sha256::new(),
        }
    }

    /// Read complete lines from `reader` until EOF.
    pub fn consume<R: BufRead>(&mut self, mut reader: R) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(512);
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                return Ok(());
            }
            if buf.last() != Some(&b'\n') {
                self.lines.incomplete_tail = true;
                return Ok(());
            }
            self.ingest(&buf);
        }
    }

    /// Account for one complete line, terminator included.
    pub fn ingest(&mut self, line: &[u8]) {
        self.hasher.update(line);
        self.lines.bytes += line.len() as u64;
        self.lines.lines += 1;

        let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(line) else {
            self.lines.skipped += 1;
            return;
        };
        let Some(record) = EventRecord::from_object(&obj) else {
            self.lines.skipped += 1;
            return;
        };

        self.total += 1;
        if let Some(category) = &record.category {
            bump(&mut self.by_type, category);
        }
        bump(&mut self.by_name, &record.event);
        if let Some(comm) = &record.comm {
            bump(&mut self.by_comm, comm);
        }

        if let Some(ret) = field(&record, &obj, "ret").and_then(Value::as_i64) {
            let stats = self.returns.entry(record.event.clone()).or_default();
            stats.calls += 1;
            if ret != 0 {
                stats.nonzero += 1;
            }
            if ret < 0 {
                stats.errors += 1;
            }
        }
        if let Some(lat) = field(&record, &obj, "lat_us").and_then(Value::as_f64) {
            self.latency.record(lat);
        }
    }

    pub fn finish(self, session_id: &str, probe_id: Option<String>, format: ReportFormat) -> Report {
        let mut top_processes: Vec<CountEntry> = self
            .by_comm
            .into_iter()
            .map(|(name, count)| CountEntry { name, count })
            .collect();
        top_processes.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        top_processes.truncate(TOP_PROCESSES);

        Report {
            schema_version: SCHEMA_VERSION.to_string(),
            session_id: session_id.to_string(),
            probe_id,
            generated_at: Utc::now(),
            format,
            total_events: self.total,
            events_by_type: self.by_type.into_iter().collect(),
            events_by_name: self.by_name.into_iter().collect(),
            top_processes,
            returns: self.returns.into_iter().collect(),
            latency: self.latency.stats(),
            lines: self.lines,
            sha256: hex::encode(self.hasher.finalize()),
        }
    }
}

/// `data.<key>` when present, else the top-level `<key>`.
fn field<'a>(record: &'a EventRecord, obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    record
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .or_else(|| obj.get(key))
}

fn bump(counts: &mut HashMap<String, u64>, key: &str) {
    match counts.get_mut(key) {
        Some(count) => *count += 1,
        None => {
            counts.insert(key.to_string(), 1);
        }
    }
}
