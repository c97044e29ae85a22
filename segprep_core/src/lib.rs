//! # segprep core
//!
//! Geometry normalization and weighting for paired medical volumes and label
//! maps. Each subject's scan and annotation are brought onto one voxel lattice
//! (common orientation, spacing and shape) without corrupting class ids, and
//! class and slice weights are derived to counter class imbalance.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//!
//! use segprep_core::io::NpzDatasetWriter;
//! use segprep_core::{
//!     CancellationToken, CohortDriver, CohortResolver, ExclusionLedger, Pipeline, PipelineConfig,
//!     SplitDataset, SplitPartition,
//! };
//!
//! let config = PipelineConfig::load_from_file("segprep.toml")?;
//! let ids = segprep_core::cohort::list_ids(&config.paths.data_dir)?;
//!
//! let ledger = ExclusionLedger::load_or_default(config.cohort.ledger_path.as_deref())?;
//! let records = CohortResolver::from_config(&config)?.resolve(&ids, &ledger)?;
//!
//! let driver = CohortDriver::new(&config, Pipeline::with_file_io(&config)?);
//! let outcome = driver.run(records, ledger, &CancellationToken::new())?;
//! println!("accepted {} records", outcome.records.len());
//!
//! let partition = SplitPartition::from_id_files(Path::new("train.txt"), Path::new("test.txt"))?;
//! SplitDataset::package(&outcome, &partition).write(&NpzDatasetWriter::from_config(&config))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Core Modules
//!
//! - [`config`] - Pipeline configuration via TOML
//! - [`volume`] - Headers, affines and label containers
//! - [`io`] - Scan and array file formats
//! - [`pipeline`] - The per-record stages
//! - [`cohort`] - Cohort driver, exclusion ledger and dataset packaging
//! - [`logging`] - JSON line-delimited run log

pub mod checkpoint;
pub mod cohort;
pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod volume;

pub use checkpoint::{CheckpointError, Checkpointable};
pub use cohort::{
    CancellationToken, CohortDriver, CohortOutcome, CohortRecord, CohortResolver,
    ExclusionLedger, LabelSource, PathTemplate, SplitDataset, SplitPartition,
};
pub use config::{ConfigError, LoadMode, PipelineConfig};
pub use error::{CohortError, PipelineError, PipelineResult};
pub use io::{ArrayStore, FileIo, ScanFormat, ScanIo};
pub use pipeline::intensity::Normalization;
pub use pipeline::resample::Interpolation;
pub use pipeline::shape::TargetGrid;
pub use pipeline::weights::{AbsentClassWeight, SliceWeighting};
pub use pipeline::{NormalizedRecord, Pipeline};
pub use volume::{Header, LabelMap, Labels, Volume};
