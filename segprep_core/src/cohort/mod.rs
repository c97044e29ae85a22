//! Cohort-level orchestration: record resolution, the driver loop, the
//! exclusion ledger and dataset packaging.

pub mod dataset;
pub mod driver;
pub mod ledger;
pub mod record;

pub use dataset::{Split, SplitDataset, SplitPartition};
pub use driver::{CancellationToken, CohortDriver, CohortOutcome};
pub use ledger::{Exclusion, ExclusionLedger};
pub use record::{
    list_ids, read_id_file, CohortRecord, CohortResolver, LabelSource, PathTemplate, TemplateError,
};
