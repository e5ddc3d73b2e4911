//! Probe catalog: an in-memory table of the probes bpfmon knows how to run.
//!
//! The catalog file is a JSON object keyed by probe identifier:
//!
//! ```json
//! {
//!   "exec": { "code": "P01", "type": "process", "event": ["exec"], "description": "execve calls" },
//!   "openat": { "code": "S02", "type": "syscall", "event": "openat", "file": "syscalls/openat.bt" }
//! }
//! ```
//!
//! Entries that do not have the expected shape are kept with placeholder
//! values so that listing never fails because of one bad entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::error::{MonitorError, Result};

/// Code shown for entries whose `code` field is missing or malformed.
pub const PLACEHOLDER_CODE: &str = "??";
/// Category shown for entries whose `type` field is missing or malformed.
pub const PLACEHOLDER_CATEGORY: &str = "unknown";

/// Metadata for one cataloged probe.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProbeDescriptor {
    /// Catalog key, unique.
    pub id: String,
    /// Short code, e.g. `P01`.
    pub code: String,
    /// Event category (`type` in the catalog file).
    pub category: String,
    /// Event names the probe is expected to emit.
    pub events: Vec<String>,
    pub description: String,
    /// Probe file handed to the tracer.
    pub path: PathBuf,
    /// True when the entry was degraded to placeholders.
    pub malformed: bool,
}

impl ProbeDescriptor {
    /// Build a descriptor for an ad hoc probe file that is not in any catalog.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "probe".to_string());
        Self {
            id,
            code: PLACEHOLDER_CODE.to_string(),
            category: PLACEHOLDER_CATEGORY.to_string(),
            events: Vec::new(),
            description: String::new(),
            path,
            malformed: false,
        }
    }

    /// Whether the probe file is present on disk.
    pub fn file_exists(&self) -> bool {
        self.path.is_file()
    }

    fn from_entry(id: &str, entry: &Value, probes_dir: &Path) -> Self {
        let Some(obj) = entry.as_object() else {
            tracing::warn!(probe = %id, "catalog entry is not an object, using placeholder");
            return Self {
                id: id.to_string(),
                code: PLACEHOLDER_CODE.to_string(),
                category: PLACEHOLDER_CATEGORY.to_string(),
                events: Vec::new(),
                description: "<malformed catalog entry>".to_string(),
                path: probes_dir.join(format!("{id}.bt")),
                malformed: true,
            };
        };

        let mut malformed = false;
        let mut text = |key: &str, placeholder: &str| match obj.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => {
                malformed = true;
                placeholder.to_string()
            }
        };
        let code = text("code", PLACEHOLDER_CODE);
        let category = text("type", PLACEHOLDER_CATEGORY);

        let events = match obj.get("event") {
            Some(Value::String(s)) => split_events(s),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .flat_map(split_events)
                .collect(),
            _ => {
                malformed = true;
                Vec::new()
            }
        };

        let description = obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let path = match obj.get("file").and_then(Value::as_str) {
            Some(file) => probes_dir.join(file),
            None => probes_dir.join(format!("{id}.bt")),
        };

        if malformed {
            tracing::warn!(probe = %id, "catalog entry has malformed fields, using placeholders");
        }

        Self {
            id: id.to_string(),
            code,
            category,
            events,
            description,
            path,
            malformed,
        }
    }
}

fn split_events(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// All cataloged probes, ordered by identifier.
#[derive(Debug, Clone, Default)]
pub struct ProbeCatalog {
    probes: Vec<ProbeDescriptor>,
}

impl ProbeCatalog {
    /// Parse catalog JSON. Probe files resolve against `probes_dir`.
    pub fn from_json_str(raw: &str, probes_dir: &Path) -> Result<Self> {
        let root: Value = serde_json::from_str(raw)?;
        let Value::Object(entries) = root else {
            return Err(MonitorError::Catalog(
                "catalog root must be an object keyed by probe id".into(),
            ));
        };
        // Sorted by key so listing indexes are stable across loads.
        let sorted: BTreeMap<&String, &Value> = entries.iter().collect();
        let probes = sorted
            .into_iter()
            .map(|(id, entry)| ProbeDescriptor::from_entry(id, entry, probes_dir))
            .collect();
        Ok(Self { probes })
    }

    /// Load the catalog file once at startup.
    pub fn load(path: &Path, probes_dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MonitorError::Catalog(format!("cannot read {}: {e}", path.display()))
        })?;
        let catalog = Self::from_json_str(&raw, probes_dir)?;
        tracing::debug!(path = %path.display(), probes = catalog.len(), "catalog loaded");
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Probes in listing order.
    pub fn probes(&self) -> &[ProbeDescriptor] {
        &self.probes
    }

    /// Look a probe up by identifier.
    pub fn get(&self, id: &str) -> Option<&ProbeDescriptor> {
        self.probes.iter().find(|p| p.id == id)
    }

    /// Look a probe up by code, case-insensitively.
    pub fn by_code(&self, code: &str) -> Option<&ProbeDescriptor> {
        self.probes
            .iter()
            .filter(|p| !p.malformed)
            .find(|p| p.code.eq_ignore_ascii_case(code))
    }

    /// Probes declared in `category`.
    pub fn by_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a ProbeDescriptor> {
        self.probes.iter().filter(move |p| p.category == category)
    }

    /// Resolve a selector (identifier, code or 1-based listing index) to a
    /// probe whose file exists.
    pub fn resolve(&self, selector: &str) -> Result<&ProbeDescriptor> {
        let selector = selector.trim();
        let found = self
            .get(selector)
            .or_else(|| self.by_code(selector))
            .or_else(|| {
                selector
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n >= 1)
                    .and_then(|n| self.probes.get(n - 1))
            })
            .ok_or_else(|| MonitorError::ProbeNotFound {
                selector: selector.to_string(),
            })?;

        if !found.file_exists() {
            return Err(MonitorError::ProbeFileMissing {
                probe: found.id.clone(),
                path: found.path.clone(),
            });
        }
        Ok(found)
    }
}
