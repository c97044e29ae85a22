//! JSON-lines run log: one line per record outcome.
//!
//! The log is an audit trail for long cohort runs. It complements the
//! `tracing` events emitted by the pipeline and never replaces them.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub const RUN_LOG_FILE: &str = "cohort.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Accepted,
    Excluded,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordLogEntry {
    pub record_id: String,
    pub status: RecordStatus,
    /// Exclusion reason; absent for accepted records
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    /// Slice-major shape of an accepted record
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub shape: Option<[usize; 3]>,
    pub timestamp_ms: u128,
}

impl RecordLogEntry {
    pub fn accepted(record_id: &str, shape: [usize; 3]) -> Self {
        Self {
            record_id: record_id.to_string(),
            status: RecordStatus::Accepted,
            reason: None,
            shape: Some(shape),
            timestamp_ms: now_ms(),
        }
    }

    pub fn excluded(record_id: &str, reason: &str) -> Self {
        Self {
            record_id: record_id.to_string(),
            status: RecordStatus::Excluded,
            reason: Some(reason.to_string()),
            shape: None,
            timestamp_ms: now_ms(),
        }
    }

    pub fn cancelled(record_id: &str) -> Self {
        Self {
            record_id: record_id.to_string(),
            status: RecordStatus::Cancelled,
            reason: None,
            shape: None,
            timestamp_ms: now_ms(),
        }
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn append_json_line<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, value)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    file.write_all(b"\n")
}

/// Appends record outcomes to `{dir}/cohort.jsonl`.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn open<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.as_ref().join(RUN_LOG_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry; failures are reported and swallowed.
    pub fn record(&self, entry: &RecordLogEntry) {
        if let Err(err) = append_json_line(&self.path, entry) {
            tracing::warn!(path = %self.path.display(), %err, "failed to append run log entry");
        }
    }
}

/// Read back every entry of a run log.
pub fn read_run_log<P: AsRef<Path>>(path: P) -> io::Result<Vec<RecordLogEntry>> {
    let contents = fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
        })
        .collect()
}
