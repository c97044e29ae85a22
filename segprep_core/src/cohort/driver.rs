//! Runs the pipeline over a whole cohort with per-record failure isolation.
//!
//! Records are processed on a bounded rayon pool. Results come back in input
//! order and are folded by a single collector, which is the only place that
//! touches the ledger, the accumulators, the run log and the disk.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use super::ledger::ExclusionLedger;
use super::record::CohortRecord;
use crate::checkpoint::Checkpointable;
use crate::config::{CohortConfig, LoadMode, PipelineConfig};
use crate::error::{CohortError, PipelineError, PipelineResult};
use crate::logging::{RecordLogEntry, RunLog};
use crate::pipeline::{NormalizedRecord, Pipeline};
use crate::volume::Labels;

/// Shared flag checked at every stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> PipelineResult<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Result of a cohort run.
#[derive(Debug, Clone, Default)]
pub struct CohortOutcome {
    /// Accepted records in input order
    pub records: Vec<NormalizedRecord>,
    pub ledger: ExclusionLedger,
    /// Ids that were neither accepted nor excluded because the run was cancelled
    pub cancelled: Vec<String>,
    /// Canonical grid shape every accepted record was fitted to
    pub target_shape: Option<[usize; 3]>,
}

impl CohortOutcome {
    pub fn accepted_ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.id.as_str())
    }

    pub fn was_cancelled(&self) -> bool {
        !self.cancelled.is_empty()
    }
}

pub struct CohortDriver {
    pipeline: Pipeline,
    config: CohortConfig,
    run_log: Option<RunLog>,
}

impl CohortDriver {
    pub fn new(config: &PipelineConfig, pipeline: Pipeline) -> Self {
        let run_log = config.cohort.log_dir.as_ref().and_then(|dir| {
            RunLog::open(dir)
                .map_err(|err| {
                    tracing::warn!(dir = %dir.display(), %err, "run log disabled");
                })
                .ok()
        });
        Self {
            pipeline,
            config: config.cohort.clone(),
            run_log,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Process `records`, recording failures in `ledger`.
    ///
    /// Ids already present in the ledger are skipped. Fails only on
    /// persistence errors, on pool construction, or when nothing was accepted.
    pub fn run(
        &self,
        records: Vec<CohortRecord>,
        ledger: ExclusionLedger,
        cancel: &CancellationToken,
    ) -> Result<CohortOutcome, CohortError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|err| CohortError::ThreadPool(err.to_string()))?;

        let mut outcome = CohortOutcome {
            ledger,
            ..CohortOutcome::default()
        };
        let pending: Vec<CohortRecord> = records
            .into_iter()
            .filter(|record| {
                let skip = outcome.ledger.contains(&record.id);
                if skip {
                    tracing::info!(record = %record.id, "already excluded, skipping");
                }
                !skip
            })
            .collect();
        tracing::info!(records = pending.len(), workers = pool.current_num_threads(), "cohort run started");

        // Until the grid shape is frozen, records go one at a time.
        let mut rest = pending.as_slice();
        while let Some((record, tail)) = rest.split_first() {
            if self.pipeline.grid().is_frozen() || self.pipeline.mode() == LoadMode::Cached {
                break;
            }
            let result = self.pipeline.process(record, cancel);
            self.collect(&mut outcome, record, result)?;
            rest = tail;
        }

        let results: Vec<PipelineResult<NormalizedRecord>> = pool.install(|| {
            rest.par_iter()
                .map(|record| self.pipeline.process(record, cancel))
                .collect()
        });
        for (record, result) in rest.iter().zip(results) {
            self.collect(&mut outcome, record, result)?;
        }

        outcome.target_shape = self.pipeline.grid().shape();
        if let Some(path) = &self.config.ledger_path {
            outcome
                .ledger
                .save_checkpoint(path)
                .map_err(|err| CohortError::persistence(path, err))?;
        }

        tracing::info!(
            accepted = outcome.records.len(),
            excluded = outcome.ledger.len(),
            cancelled = outcome.cancelled.len(),
            "cohort run finished"
        );
        if outcome.records.is_empty() && !outcome.was_cancelled() {
            return Err(CohortError::NoRecordsAccepted {
                ledger: outcome.ledger,
            });
        }
        Ok(outcome)
    }

    fn collect(
        &self,
        outcome: &mut CohortOutcome,
        record: &CohortRecord,
        result: PipelineResult<NormalizedRecord>,
    ) -> Result<(), CohortError> {
        match result {
            Ok(normalized) => {
                self.persist(&normalized)?;
                tracing::info!(record = %normalized.id, shape = ?normalized.shape(), "record accepted");
                self.log(RecordLogEntry::accepted(&normalized.id, normalized.shape()));
                outcome.records.push(normalized);
            }
            Err(PipelineError::Cancelled) => {
                tracing::info!(record = %record.id, "record cancelled");
                self.log(RecordLogEntry::cancelled(&record.id));
                outcome.cancelled.push(record.id.clone());
            }
            Err(err) => {
                tracing::warn!(record = %record.id, kind = err.kind(), reason = %err, "record excluded");
                self.log(RecordLogEntry::excluded(&record.id, &err.to_string()));
                outcome.ledger.record(&record.id, &err);
            }
        }
        Ok(())
    }

    fn log(&self, entry: RecordLogEntry) {
        if let Some(run_log) = &self.run_log {
            run_log.record(&entry);
        }
    }

    /// Paths a normalized record is written to when persistence is enabled.
    pub fn processed_paths(&self, id: &str) -> (PathBuf, PathBuf) {
        let ext = &self.config.processed_extension;
        (
            self.config.processed_volume_dir.join(format!("{id}{ext}")),
            self.config.processed_label_dir.join(format!("{id}{ext}")),
        )
    }

    fn persist(&self, record: &NormalizedRecord) -> Result<(), CohortError> {
        if !self.config.persist_normalized {
            return Ok(());
        }
        // Cached records were read from these very files.
        let (Some(affine), Labels::Single(labels)) = (&record.affine, &record.labels) else {
            return Ok(());
        };
        let (volume_path, label_path) = self.processed_paths(&record.id);
        let scans = self.pipeline.scan_io();
        scans
            .save(record.volume.view().into_dyn(), affine, &volume_path)
            .map_err(|err| CohortError::persistence(&volume_path, err))?;
        let labels = labels.mapv(f64::from);
        scans
            .save(labels.view().into_dyn(), affine, &label_path)
            .map_err(|err| CohortError::persistence(&label_path, err))?;
        tracing::debug!(record = %record.id, path = %volume_path.display(), "normalized arrays persisted");
        Ok(())
    }
}
