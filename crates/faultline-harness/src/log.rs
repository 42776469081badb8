//! Run bundles: on-disk record of one suite run.
//!
//! Layout under `<artifact_dir>/<suite>-<run_id>/`:
//! - `meta.json` for run metadata
//! - `events.jsonl` with one line per case, phase and verdict
//! - `failure.txt` with the rendered diagnostic of the failing case, if any

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use faultline_error::{HarnessError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

pub const BUNDLE_SCHEMA_VERSION: u32 = 1;

pub const REQUIRED_BUNDLE_FILES: [&str; 2] = ["meta.json", "events.jsonl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    RunStart,
    CaseStart,
    Phase,
    Verdict,
    CaseEnd,
    RunEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    pub schema_version: u32,
    pub suite: String,
    pub run_id: String,
    pub harness_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: RunEventKind,
    pub step: u64,
    pub source_tag: Option<String>,
    pub target: Option<String>,
    pub message: String,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub payload: BTreeMap<String, Value>,
}

impl RunEvent {
    #[must_use]
    pub fn new(kind: RunEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            step: 0,
            source_tag: None,
            target: None,
            message: message.into(),
            status: None,
            payload: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn for_case(mut self, source_tag: &str, target: &str) -> Self {
        self.source_tag = Some(source_tag.to_owned());
        self.target = Some(target.to_owned());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }
}

#[derive(Debug)]
struct BundleWriter {
    events_file: File,
    next_step: u64,
}

/// Open run bundle. Shared by the per-target runner threads, so appends go
/// through a mutex.
#[derive(Debug)]
pub struct RunBundle {
    root: PathBuf,
    writer: Mutex<BundleWriter>,
}

impl RunBundle {
    /// Create the bundle directory, write `meta.json` and the run-start event.
    pub fn create(base_dir: &Path, suite: &str, run_id: &str) -> Result<Self> {
        if suite.is_empty() || run_id.is_empty() {
            return Err(HarnessError::internal("suite and run_id must be non-empty"));
        }
        let root = base_dir.join(format!(
            "{}-{}",
            sanitize_segment(suite),
            sanitize_segment(run_id)
        ));
        fs::create_dir_all(&root)?;

        let meta = BundleMeta {
            schema_version: BUNDLE_SCHEMA_VERSION,
            suite: suite.to_owned(),
            run_id: run_id.to_owned(),
            harness_version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        fs::write(root.join("meta.json"), serde_json::to_vec_pretty(&meta)?)?;

        let events_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join("events.jsonl"))?;
        let bundle = Self {
            root,
            writer: Mutex::new(BundleWriter {
                events_file,
                next_step: 0,
            }),
        };
        bundle.emit(RunEvent::new(RunEventKind::RunStart, "run_start"))?;
        info!(suite, run_id, root = %bundle.root.display(), "run bundle initialized");
        Ok(bundle)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append one event; the step number is assigned here.
    pub fn emit(&self, mut event: RunEvent) -> Result<()> {
        let mut writer = self.writer.lock();
        event.step = writer.next_step;
        writer.next_step = writer.next_step.saturating_add(1);
        let encoded = serde_json::to_string(&event)?;
        writeln!(writer.events_file, "{encoded}")?;
        writer.events_file.flush()?;
        Ok(())
    }

    /// Record the diagnostic of a failed case in `failure.txt`.
    pub fn record_failure(&self, source_tag: &str, target: &str, report: &str) -> Result<PathBuf> {
        let path = self.root.join("failure.txt");
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "== {source_tag} on {target} ==")?;
        writeln!(file, "{report}")?;
        error!(source_tag, target, path = %path.display(), "case failure recorded");
        Ok(path)
    }

    pub fn finish(self, status: RunStatus) -> Result<PathBuf> {
        self.emit(RunEvent::new(RunEventKind::RunEnd, "run_end").with_status(status))?;
        info!(root = %self.root.display(), ?status, "run bundle finalized");
        Ok(self.root)
    }
}

/// Read `events.jsonl` back, checking every line parses and the run is
/// bracketed by start and end events.
pub fn read_events(bundle_root: &Path) -> Result<Vec<RunEvent>> {
    let missing: Vec<&str> = REQUIRED_BUNDLE_FILES
        .iter()
        .copied()
        .filter(|name| !bundle_root.join(name).is_file())
        .collect();
    if !missing.is_empty() {
        return Err(HarnessError::integrity(format!(
            "missing bundle files: {}",
            missing.join(", ")
        )));
    }

    let meta: BundleMeta = serde_json::from_slice(&fs::read(bundle_root.join("meta.json"))?)?;
    if meta.schema_version != BUNDLE_SCHEMA_VERSION {
        return Err(HarnessError::integrity(format!(
            "unsupported bundle schema {}, expected {BUNDLE_SCHEMA_VERSION}",
            meta.schema_version
        )));
    }

    let reader = BufReader::new(File::open(bundle_root.join("events.jsonl"))?);
    let mut events = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let event: RunEvent = serde_json::from_str(&line).map_err(|err| {
            HarnessError::integrity(format!("events.jsonl line {}: {err}", line_no + 1))
        })?;
        events.push(event);
    }

    if events.first().map(|e| e.kind) != Some(RunEventKind::RunStart) {
        return Err(HarnessError::integrity("events.jsonl must start with run_start"));
    }
    if events.last().map(|e| e.kind) != Some(RunEventKind::RunEnd) {
        return Err(HarnessError::integrity("events.jsonl must end with run_end"));
    }
    Ok(events)
}

fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
