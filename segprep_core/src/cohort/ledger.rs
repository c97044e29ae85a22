//! Record of every subject excluded from a run, and why.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointError, Checkpointable};
use crate::error::{CohortError, PipelineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub id: String,
    /// Error kind tag, e.g. `source_not_found`
    pub kind: String,
    pub reason: String,
}

/// Excluded ids with human-readable reasons, in the order they were excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionLedger {
    entries: Vec<Exclusion>,
}

impl ExclusionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the ledger at `path` when it exists, otherwise start empty.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, CohortError> {
        match path {
            Some(path) if path.exists() => {
                Self::load_checkpoint(path).map_err(|err| CohortError::persistence(path, err))
            }
            _ => Ok(Self::new()),
        }
    }

    pub fn record(&mut self, id: &str, error: &PipelineError) {
        self.record_reason(id, error.kind(), error.to_string());
    }

    /// Add or replace the entry for `id`.
    pub fn record_reason(&mut self, id: &str, kind: &str, reason: impl Into<String>) {
        let entry = Exclusion {
            id: id.to_string(),
            kind: kind.to_string(),
            reason: reason.into(),
        };
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn reason(&self, id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.reason.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exclusion> {
        self.entries.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }
}

impl Checkpointable for ExclusionLedger {
    type Snapshot = Vec<Exclusion>;
    const VERSION: u32 = 1;

    fn snapshot(&self) -> Vec<Exclusion> {
        self.entries.clone()
    }

    fn restore(entries: Vec<Exclusion>) -> Result<Self, CheckpointError> {
        let mut ledger = Self::new();
        for entry in entries {
            if ledger.contains(&entry.id) {
                return Err(CheckpointError::InvalidFormat(format!(
                    "duplicate ledger entry for {}",
                    entry.id
                )));
            }
            ledger.entries.push(entry);
        }
        Ok(ledger)
    }
}
