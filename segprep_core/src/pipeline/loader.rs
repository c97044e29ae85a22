//! Reading one record's volume and annotation from disk.

use std::path::Path;
use std::sync::Arc;

use ndarray::{stack, ArrayD, Axis, Ix3};

use crate::cohort::{CohortRecord, LabelSource};
use crate::config::LoadMode;
use crate::error::{PipelineError, PipelineResult};
use crate::io::{ArrayStore, ScanIo};
use crate::volume::{labels_from_continuous, Header, LabelMap, Labels, Volume};

/// Arrays of one record as read from disk.
///
/// Headers are present in raw mode and absent for cached arrays.
#[derive(Debug, Clone)]
pub struct LoadedPair {
    pub volume: Volume,
    pub labels: Labels,
    pub volume_header: Option<Header>,
    pub label_header: Option<Header>,
}

#[derive(Clone)]
pub struct VolumeLoader {
    scans: Arc<dyn ScanIo>,
    arrays: Arc<dyn ArrayStore>,
    mode: LoadMode,
}

impl std::fmt::Debug for VolumeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeLoader").field("mode", &self.mode).finish()
    }
}

impl VolumeLoader {
    pub fn new(scans: Arc<dyn ScanIo>, arrays: Arc<dyn ArrayStore>, mode: LoadMode) -> Self {
        Self {
            scans,
            arrays,
            mode,
        }
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    pub fn load(&self, record: &CohortRecord) -> PipelineResult<LoadedPair> {
        match self.mode {
            LoadMode::Raw => self.load_raw(record),
            LoadMode::Cached => self.load_cached(record),
        }
    }

    fn load_raw(&self, record: &CohortRecord) -> PipelineResult<LoadedPair> {
        let label_path = match &record.labels {
            LabelSource::Single(path) => path,
            LabelSource::Stacked(paths) => {
                return Err(PipelineError::Unsupported(format!(
                    "{} annotation masks for {}; multi-mask records need cached mode",
                    paths.len(),
                    record.id
                )))
            }
        };

        let (volume, volume_header) = self.scans.load(&record.volume)?;
        let (labels, label_header) = self.scans.load(label_path)?;
        let volume = into_volume(volume, &record.volume)?;
        let labels = labels_from_continuous(into_volume(labels, label_path)?)?;

        Ok(LoadedPair {
            volume,
            labels: Labels::Single(labels),
            volume_header: Some(volume_header),
            label_header: Some(label_header),
        })
    }

    fn load_cached(&self, record: &CohortRecord) -> PipelineResult<LoadedPair> {
        let volume = into_volume(self.arrays.load_array(&record.volume)?, &record.volume)?;
        let labels = match &record.labels {
            LabelSource::Single(path) => Labels::Single(self.load_label_map(path)?),
            LabelSource::Stacked(paths) => {
                let masks = paths
                    .iter()
                    .map(|path| self.load_label_map(path))
                    .collect::<PipelineResult<Vec<LabelMap>>>()?;
                if masks.is_empty() {
                    return Err(PipelineError::Unsupported(format!(
                        "record {} lists no annotation masks",
                        record.id
                    )));
                }
                let views: Vec<_> = masks.iter().map(|m| m.view()).collect();
                let stacked = stack(Axis(0), &views).map_err(|err| {
                    PipelineError::shape(format!("annotation masks of {} disagree: {err}", record.id))
                })?;
                Labels::Stacked(stacked)
            }
        };

        Ok(LoadedPair {
            volume,
            labels,
            volume_header: None,
            label_header: None,
        })
    }

    fn load_label_map(&self, path: &Path) -> PipelineResult<LabelMap> {
        labels_from_continuous(into_volume(self.arrays.load_array(path)?, path)?)
    }
}

/// Coerce a loaded array to three axes.
///
/// Trailing singleton axes (a single frame or channel) are dropped and
/// lower-rank arrays gain trailing singleton axes.
pub fn into_volume<T>(array: ArrayD<T>, path: &Path) -> PipelineResult<ndarray::Array3<T>> {
    let mut array = array;
    while array.ndim() > 3 && array.shape()[array.ndim() - 1] == 1 {
        let last = array.ndim() - 1;
        array = array.index_axis_move(Axis(last), 0);
    }
    while array.ndim() < 3 {
        let next = array.ndim();
        array = array.insert_axis(Axis(next));
    }
    let shape = array.shape().to_vec();
    array.into_dimensionality::<Ix3>().map_err(|_| {
        PipelineError::Unsupported(format!(
            "{} has shape {shape:?}; only single-frame 3D data is handled",
            path.display()
        ))
    })
}
