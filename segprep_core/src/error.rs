//! Error types for the normalization pipeline and the cohort driver.
//!
//! [`PipelineError`] covers everything that can go wrong while a single record
//! moves through the stages. Every variant except [`PipelineError::Cancelled`]
//! is recovered by the cohort driver and written to the exclusion ledger.
//! [`CohortError`] is reserved for conditions that end a whole run.

use std::path::PathBuf;

use thiserror::Error;

use crate::cohort::ledger::ExclusionLedger;

/// Result type alias for per-record pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure of one record inside the pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Input file does not exist
    #[error("source not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Header fields missing or unusable for resampling
    #[error("geometry mismatch: {0}")]
    GeometryMismatch(String),

    /// Shape equalization produced a degenerate array
    #[error("shape reconciliation failed: {0}")]
    ShapeReconciliation(String),

    /// Labelmap cannot be weighted (empty, no slices)
    #[error("weight computation failed: {0}")]
    WeightComputation(String),

    /// A class id outside `[0, num_classes)`
    #[error("label {label} is outside the class range 0..{num_classes}")]
    LabelOutOfRange { label: u16, num_classes: usize },

    /// Label input that cannot be turned into a class id
    #[error("invalid label value {value}: {reason}")]
    InvalidLabel { value: f64, reason: &'static str },

    /// File exists but its contents could not be decoded
    #[error("malformed {format} file {}: {details}", path.display())]
    Format {
        format: &'static str,
        path: PathBuf,
        details: String,
    },

    /// Input layout that the current mode does not handle
    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cooperative cancellation observed at a stage boundary
    #[error("processing cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn geometry(details: impl Into<String>) -> Self {
        PipelineError::GeometryMismatch(details.into())
    }

    pub fn shape(details: impl Into<String>) -> Self {
        PipelineError::ShapeReconciliation(details.into())
    }

    pub fn weights(details: impl Into<String>) -> Self {
        PipelineError::WeightComputation(details.into())
    }

    pub fn format(format: &'static str, path: impl Into<PathBuf>, details: impl ToString) -> Self {
        PipelineError::Format {
            format,
            path: path.into(),
            details: details.to_string(),
        }
    }

    /// Map an I/O error, turning `NotFound` into [`PipelineError::SourceNotFound`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            PipelineError::SourceNotFound { path }
        } else {
            PipelineError::Io { path, source }
        }
    }

    /// Short machine-friendly tag used in the run log.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceNotFound { .. } => "source_not_found",
            PipelineError::GeometryMismatch(_) => "geometry_mismatch",
            PipelineError::ShapeReconciliation(_) => "shape_reconciliation",
            PipelineError::WeightComputation(_) => "weight_computation",
            PipelineError::LabelOutOfRange { .. } => "label_out_of_range",
            PipelineError::InvalidLabel { .. } => "invalid_label",
            PipelineError::Format { .. } => "format",
            PipelineError::Unsupported(_) => "unsupported",
            PipelineError::Io { .. } => "io",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

/// Conditions that abort a cohort run.
#[derive(Debug, Error)]
pub enum CohortError {
    /// Every record was excluded; the ledger explains why.
    #[error("no record of the cohort was accepted ({} excluded)", ledger.len())]
    NoRecordsAccepted { ledger: ExclusionLedger },

    /// Writing normalized arrays, dataset buckets or the ledger failed.
    #[error("persistence failed for {}: {details}", path.display())]
    Persistence { path: PathBuf, details: String },

    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),
}

impl CohortError {
    pub fn persistence(path: impl Into<PathBuf>, details: impl ToString) -> Self {
        CohortError::Persistence {
            path: path.into(),
            details: details.to_string(),
        }
    }
}
