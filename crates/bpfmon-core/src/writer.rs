//! Event stream writer: splits probe output between the event log and the
//! diagnostic log.
//!
//! Classification is a pure function of one line. A line is an event when it
//! is a JSON object carrying a non-null timestamp (`ts` or `timestamp`) and a
//! non-empty string `event`. Everything else, and everything read from the
//! tracer's stderr, lands verbatim in the diagnostic log. Each record is
//! written with a single append followed by a flush, so a crash can at worst
//! leave one unterminated trailing line, which readers ignore.

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};

use crate::metrics::METRICS;
use crate::session::SessionHandle;

/// One structured event emitted by a probe.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventRecord {
    pub ts: Value,
    /// Event category, the `type` key on the wire.
    #[serde(rename = "type")]
    pub category: Option<String>,
    pub event: String,
    pub pid: Option<i64>,
    pub tid: Option<i64>,
    pub uid: Option<i64>,
    pub comm: Option<String>,
    /// Probe-specific fields, the `data` key on the wire.
    pub data: Option<Value>,
}

impl EventRecord {
    /// Parse a record from a JSON object, or `None` when the line is not an event.
    pub fn parse(line: &str) -> Option<Self> {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
            return None;
        };
        Self::from_object(&obj)
    }

    pub(crate) fn from_object(obj: &Map<String, Value>) -> Option<Self> {
        let ts = obj
            .get("ts")
            .or_else(|| obj.get("timestamp"))
            .filter(|v| !v.is_null())?
            .clone();
        let event = obj
            .get("event")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())?
            .to_string();
        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        let int = |key: &str| obj.get(key).and_then(Value::as_i64);

        Some(Self {
            ts,
            category: text("type").or_else(|| text("category")),
            event,
            pid: int("pid"),
            tid: int("tid"),
            uid: int("uid"),
            comm: text("comm"),
            data: obj.get("data").cloned(),
        })
    }
}

/// Outcome of classifying one raw line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineClass {
    Event(EventRecord),
    Diagnostic,
}

/// Classify a raw line from the structured channel.
///
/// A trailing `\n` or `\r\n` is ignored. Invalid UTF-8 is a diagnostic.
pub fn classify_line(raw: &[u8]) -> LineClass {
    let line = strip_terminator(raw);
    match std::str::from_utf8(line).ok().and_then(EventRecord::parse) {
        Some(record) => LineClass::Event(record),
        None => LineClass::Diagnostic,
    }
}

fn strip_terminator(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Counters for one writer.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct WriteStats {
    /// Records appended to the event log.
    pub events: u64,
    /// Lines appended to the diagnostic log, from either channel.
    pub diagnostics: u64,
    /// Structured-channel lines that failed classification.
    pub rejected: u64,
}

/// Single owner of a session's event log and diagnostic log.
pub struct EventStreamWriter {
    session_id: String,
    events: File,
    diagnostics: File,
    stats: WriteStats,
}

impl EventStreamWriter {
    /// Open (creating if needed) both logs of `session` for appending.
    pub async fn open(session: &SessionHandle) -> std::io::Result<Self> {
        let events = open_append(&session.events_path()).await?;
        let diagnostics = open_append(&session.diagnostics_path()).await?;
        Ok(Self {
            session_id: session.id.clone(),
            events,
            diagnostics,
            stats: WriteStats::default(),
        })
    }

    /// Route one line from the structured channel.
    pub async fn write_line(&mut self, raw: &[u8]) -> std::io::Result<bool> {
        match classify_line(raw) {
            LineClass::Event(_) => {
                append_record(&mut self.events, strip_terminator(raw)).await?;
                self.stats.events += 1;
                METRICS.inc_events_written();
                Ok(true)
            }
            LineClass::Diagnostic => {
                self.stats.rejected += 1;
                tracing::trace!(session_id = %self.session_id, "unparsable line routed to diagnostic log");
                self.write_diagnostic(raw).await?;
                Ok(false)
            }
        }
    }

    /// Append one line verbatim to the diagnostic log.
    pub async fn write_diagnostic(&mut self, raw: &[u8]) -> std::io::Result<()> {
        let line = raw.strip_suffix(b"\n").unwrap_or(raw);
        append_record(&mut self.diagnostics, line).await?;
        self.stats.diagnostics += 1;
        METRICS.inc_diagnostics_written();
        Ok(())
    }

    /// Feed every line of `reader` through [`Self::write_line`].
    ///
    /// A final line without a terminator is still routed.
    pub async fn consume<R>(&mut self, reader: R) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.split(b'\n');
        while let Some(line) = lines.next_segment().await? {
            self.write_line(&line).await?;
        }
        Ok(())
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Flush and fsync both logs.
    pub async fn finish(mut self) -> std::io::Result<WriteStats> {
        self.events.flush().await?;
        self.diagnostics.flush().await?;
        self.events.sync_all().await?;
        self.diagnostics.sync_all().await?;
        tracing::debug!(
            session_id = %self.session_id,
            events = self.stats.events,
            diagnostics = self.stats.diagnostics,
            "session logs closed"
        );
        Ok(self.stats)
    }
}

async fn open_append(path: &std::path::Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn append_record(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    let mut record = Vec::with_capacity(line.len() + 1);
    record.extend_from_slice(line);
    record.push(b'\n');
    file.write_all(&record).await?;
    file.flush().await
}
