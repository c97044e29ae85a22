//! Packaging accepted records into train and test buckets.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::driver::CohortOutcome;
use super::record::read_id_file;
use crate::error::{CohortError, PipelineResult};
use crate::io::npz::{BucketArray, DatasetWriter};
use crate::pipeline::NormalizedRecord;
use crate::volume::Labels;

pub const BUCKETS: [&str; 4] = ["data", "label", "weights", "class_weights"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// Externally decided split membership by subject id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitPartition {
    train: BTreeSet<String>,
    test: BTreeSet<String>,
}

impl SplitPartition {
    pub fn new<I, J, S, T>(train: I, test: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            train: train.into_iter().map(Into::into).collect(),
            test: test.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_id_files(train: &Path, test: &Path) -> PipelineResult<Self> {
        Ok(Self::new(read_id_file(train)?, read_id_file(test)?))
    }

    /// Train membership wins when an id is listed in both sets.
    pub fn split_of(&self, id: &str) -> Option<Split> {
        if self.train.contains(id) {
            Some(Split::Train)
        } else if self.test.contains(id) {
            Some(Split::Test)
        } else {
            None
        }
    }
}

/// Accepted records grouped by split, in acceptance order.
#[derive(Debug, Clone)]
pub struct SplitDataset<'a> {
    pub train: Vec<&'a NormalizedRecord>,
    pub test: Vec<&'a NormalizedRecord>,
    /// Accepted ids in neither split
    pub unassigned: Vec<String>,
}

impl<'a> SplitDataset<'a> {
    pub fn package(outcome: &'a CohortOutcome, partition: &SplitPartition) -> Self {
        let mut dataset = Self {
            train: Vec::new(),
            test: Vec::new(),
            unassigned: Vec::new(),
        };
        for record in &outcome.records {
            match partition.split_of(&record.id) {
                Some(Split::Train) => dataset.train.push(record),
                Some(Split::Test) => dataset.test.push(record),
                None => {
                    tracing::warn!(record = %record.id, "accepted record belongs to no split");
                    dataset.unassigned.push(record.id.clone());
                }
            }
        }
        dataset
    }

    pub fn records(&self, split: Split) -> &[&'a NormalizedRecord] {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }

    /// Write every non-empty split through `writer`; returns the written paths.
    pub fn write(&self, writer: &dyn DatasetWriter) -> Result<Vec<PathBuf>, CohortError> {
        let mut written = Vec::new();
        for split in [Split::Train, Split::Test] {
            let records = self.records(split);
            if records.is_empty() {
                continue;
            }
            let labels: Vec<_> = records.iter().map(|r| label_array(&r.labels)).collect();
            for bucket in BUCKETS {
                let entries: Vec<(String, BucketArray<'_>)> = records
                    .iter()
                    .zip(&labels)
                    .enumerate()
                    .map(|(index, (record, labels))| {
                        let array = match bucket {
                            "data" => BucketArray::Float(record.volume.view().into_dyn()),
                            "label" => BucketArray::Label(labels.view()),
                            "weights" => BucketArray::Float(record.slice_weights.view().into_dyn()),
                            _ => BucketArray::Float(record.class_weights.view().into_dyn()),
                        };
                        (entry_key(index, &record.id), array)
                    })
                    .collect();
                written.push(writer.write_bucket(split.name(), bucket, &entries)?);
            }
            tracing::info!(split = split.name(), records = records.len(), "split packaged");
        }
        Ok(written)
    }
}

pub fn entry_key(index: usize, id: &str) -> String {
    format!("{index:05}_{id}")
}

fn label_array(labels: &Labels) -> ndarray::ArrayD<u16> {
    labels.clone().into_dyn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use ndarray::{Array1, Array3};

    fn record(id: &str) -> NormalizedRecord {
        NormalizedRecord {
            id: id.to_string(),
            volume: Array3::zeros((2, 2, 2)),
            labels: Labels::Single(Array3::zeros((2, 2, 2))),
            slice_weights: Array1::zeros(2),
            class_weights: Array1::ones(2),
            affine: None,
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        calls: RefCell<Vec<(String, String, Vec<String>)>>,
    }

    impl DatasetWriter for RecordingWriter {
        fn write_bucket(
            &self,
            split: &str,
            bucket: &str,
            entries: &[(String, BucketArray<'_>)],
        ) -> Result<PathBuf, CohortError> {
            let keys = entries.iter().map(|(k, _)| k.clone()).collect();
            self.calls
                .borrow_mut()
                .push((split.to_string(), bucket.to_string(), keys));
            Ok(PathBuf::from(format!("{split}_{bucket}.npz")))
        }
    }

    #[test]
    fn package_groups_by_partition() {
        let outcome = CohortOutcome {
            records: vec![record("a"), record("b"), record("c")],
            ..CohortOutcome::default()
        };
        let partition = SplitPartition::new(["c", "a"], ["b"]);
        let dataset = SplitDataset::package(&outcome, &partition);
        let train: Vec<_> = dataset.train.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(train, vec!["a", "c"]);
        assert_eq!(dataset.test.len(), 1);
        assert!(dataset.unassigned.is_empty());
    }

    #[test]
    fn records_outside_partition_are_unassigned() {
        let outcome = CohortOutcome {
            records: vec![record("x")],
            ..CohortOutcome::default()
        };
        let dataset = SplitDataset::package(&outcome, &SplitPartition::default());
        assert_eq!(dataset.unassigned, vec!["x".to_string()]);
    }

    #[test]
    fn writes_every_bucket_with_ordered_keys() {
        let outcome = CohortOutcome {
            records: vec![record("p"), record("q")],
            ..CohortOutcome::default()
        };
        let dataset = SplitDataset::package(&outcome, &SplitPartition::new(["p", "q"], Vec::<String>::new()));
        let writer = RecordingWriter::default();
        let paths = dataset.write(&writer).unwrap();
        assert_eq!(paths.len(), 4);

        let calls = writer.calls.borrow();
        let buckets: Vec<_> = calls.iter().map(|(_, b, _)| b.as_str()).collect();
        assert_eq!(buckets, BUCKETS.to_vec());
        assert!(calls.iter().all(|(s, _, _)| s == "train"));
        assert_eq!(calls[0].2, vec!["00000_p".to_string(), "00001_q".to_string()]);
    }
}
