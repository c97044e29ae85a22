//! The per-record normalization pipeline.
//!
//! Stage order for raw records:
//!
//! 1. [`loader`] reads volume, labels and headers.
//! 2. [`geometry`] centers, reorients and resamples both arrays.
//! 3. [`shape`] equalizes the pair and fits it onto the cohort grid.
//! 4. [`intensity`] moves the slice axis first, optionally trims background
//!    slices and matches histograms, then normalizes intensities.
//! 5. [`weights`] derives class and slice weights.
//!
//! Cached records skip stages 2 to 4.

pub mod geometry;
pub mod intensity;
pub mod loader;
pub mod resample;
pub mod shape;
pub mod weights;

use std::sync::Arc;

use nalgebra::{Matrix4, Vector3};
use ndarray::{Array1, Array3};

use self::geometry::GeometryNormalizer;
use self::intensity::{
    match_histogram, normalize, sanitize, slice_major_order, to_slice_major,
    trim_background_slices, Normalization, ReferenceHistogram,
};
use self::loader::{into_volume, LoadedPair, VolumeLoader};
use self::shape::{fit_to_shape, placement_offset, ShapeEqualizer, TargetGrid};
use self::weights::WeightEstimator;
use crate::cohort::{CancellationToken, CohortRecord};
use crate::config::{LoadMode, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::io::{ArrayStore, FileIo, ScanIo};
use crate::volume::{from_matvec, voxel_to_world, LabelMap, Labels, Volume};

/// A record that passed every stage.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub id: String,
    /// Slice-major intensities
    pub volume: Volume,
    pub labels: Labels,
    pub slice_weights: Array1<f64>,
    pub class_weights: Array1<f64>,
    /// Voxel→world transform of the slice-major grid; unknown for cached arrays
    pub affine: Option<Matrix4<f64>>,
}

impl NormalizedRecord {
    pub fn shape(&self) -> [usize; 3] {
        let (a, b, c) = self.volume.dim();
        [a, b, c]
    }
}

pub struct Pipeline {
    mode: LoadMode,
    loader: VolumeLoader,
    scans: Arc<dyn ScanIo>,
    geometry: GeometryNormalizer,
    grid: TargetGrid,
    estimator: WeightEstimator,
    slice_axis: usize,
    remove_background_slices: bool,
    normalization: Normalization,
    reference: Option<ReferenceHistogram>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("mode", &self.mode)
            .field("grid", &self.grid)
            .field("slice_axis", &self.slice_axis)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build a pipeline on the given I/O backends.
    ///
    /// The histogram reference, when matching is enabled, is read here once.
    pub fn new(
        config: &PipelineConfig,
        scans: Arc<dyn ScanIo>,
        arrays: Arc<dyn ArrayStore>,
    ) -> PipelineResult<Self> {
        let reference = match (&config.intensity.histogram_reference, config.intensity.histogram_matching) {
            (Some(path), true) => {
                let (array, _) = scans.load(path)?;
                let volume = into_volume(array, path)?;
                let table = ReferenceHistogram::from_volume(volume.view(), config.intensity.histogram_points)?;
                tracing::info!(path = %path.display(), points = table.len(), "histogram reference loaded");
                Some(table)
            }
            _ => None,
        };

        Ok(Self {
            mode: config.cohort.mode,
            loader: VolumeLoader::new(Arc::clone(&scans), arrays, config.cohort.mode),
            scans,
            geometry: GeometryNormalizer::new(
                config.grid.target_spacing,
                config.intensity.interpolation,
            ),
            grid: TargetGrid::new(
                config.grid.target_spacing,
                config.grid.target_shape,
                config.grid.shape_multiple,
            ),
            estimator: WeightEstimator::new(
                config.labels.num_classes,
                config.labels.slice_weighting,
                config.labels.absent_class_weight,
            ),
            slice_axis: config.grid.slice_axis,
            remove_background_slices: config.labels.remove_background_slices,
            normalization: config.intensity.normalization,
            reference,
        })
    }

    /// Pipeline reading and writing files through [`FileIo`].
    pub fn with_file_io(config: &PipelineConfig) -> PipelineResult<Self> {
        let io = Arc::new(FileIo::new());
        Self::new(config, io.clone(), io)
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    pub fn grid(&self) -> &TargetGrid {
        &self.grid
    }

    pub fn scan_io(&self) -> &dyn ScanIo {
        self.scans.as_ref()
    }

    /// Run every stage on one record, checking `cancel` between stages.
    pub fn process(
        &self,
        record: &CohortRecord,
        cancel: &CancellationToken,
    ) -> PipelineResult<NormalizedRecord> {
        cancel.check()?;
        let loaded = self.loader.load(record)?;
        tracing::debug!(record = %record.id, volume = ?loaded.volume.dim(), "loaded");
        cancel.check()?;

        let (volume, labels, affine, target) = match self.mode {
            LoadMode::Raw => {
                let (volume, labels, affine, target) = self.reconcile(&record.id, loaded, cancel)?;
                (volume, Labels::Single(labels), Some(affine), Some(target))
            }
            LoadMode::Cached => {
                let (a, b, c) = loaded.volume.dim();
                if loaded.labels.spatial_shape() != [a, b, c] {
                    return Err(PipelineError::shape(format!(
                        "cached volume {:?} and labels {:?} differ",
                        [a, b, c],
                        loaded.labels.spatial_shape()
                    )));
                }
                (loaded.volume, loaded.labels, None, None)
            }
        };
        cancel.check()?;

        let weights = self.estimator.estimate(&labels)?;
        tracing::debug!(record = %record.id, slices = weights.slice.len(), "weighted");

        // Only a fully processed record may fix the cohort grid.
        if let Some(target) = target {
            if self.grid.freeze(target) != target {
                tracing::debug!(record = %record.id, "grid frozen meanwhile, refitting");
                return self.process(record, cancel);
            }
        }

        Ok(NormalizedRecord {
            id: record.id.clone(),
            volume,
            labels,
            slice_weights: weights.slice,
            class_weights: weights.class,
            affine,
        })
    }

    /// Geometry, shape and intensity stages of a raw record.
    fn reconcile(
        &self,
        id: &str,
        loaded: LoadedPair,
        cancel: &CancellationToken,
    ) -> PipelineResult<(Volume, LabelMap, Matrix4<f64>, [usize; 3])> {
        let LoadedPair {
            volume,
            labels,
            volume_header,
            label_header,
        } = loaded;
        let (Some(volume_header), Some(label_header)) = (volume_header, label_header) else {
            return Err(PipelineError::geometry(format!("raw record {id} has no header")));
        };
        let Labels::Single(labels) = labels else {
            return Err(PipelineError::Unsupported(format!(
                "raw record {id} carries stacked masks"
            )));
        };

        let normalized = self
            .geometry
            .normalize(volume, &volume_header, labels, &label_header)?;
        tracing::debug!(record = id, shape = ?normalized.volume.dim(), "geometry normalized");
        cancel.check()?;

        let resampled = dims(&normalized.volume);
        let (volume, labels) = ShapeEqualizer::equalize(normalized.volume, normalized.labels)?;
        let equalized = dims(&volume);
        let target = self.grid.candidate(equalized);
        let volume = fit_to_shape(volume.view(), target)?;
        let labels = fit_to_shape(labels.view(), target)?;
        let mut affine = shift_origin(&normalized.affine, placement_offset(resampled, equalized));
        affine = shift_origin(&affine, placement_offset(equalized, target));
        tracing::debug!(record = id, ?target, "shape equalized");
        cancel.check()?;

        let mut volume = to_slice_major(volume, self.slice_axis);
        let mut labels = to_slice_major(labels, self.slice_axis);
        affine = permute_columns(&affine, slice_major_order(self.slice_axis));

        if self.remove_background_slices {
            let trimmed = trim_background_slices(volume, labels)?;
            affine = shift_origin(&affine, [trimmed.first as isize, 0, 0]);
            volume = trimmed.volume;
            labels = trimmed.labels;
        }

        let mut volume = sanitize(volume);
        if let Some(reference) = &self.reference {
            volume = match_histogram(&volume, reference);
        }
        let volume = normalize(&volume, self.normalization);
        Ok((volume, labels, affine, target))
    }
}

fn dims<T>(array: &Array3<T>) -> [usize; 3] {
    let (a, b, c) = array.dim();
    [a, b, c]
}

/// Move the origin to the voxel at `offset` of the current grid.
fn shift_origin(affine: &Matrix4<f64>, offset: [isize; 3]) -> Matrix4<f64> {
    let index = Vector3::new(offset[0] as f64, offset[1] as f64, offset[2] as f64);
    let origin = voxel_to_world(affine, &index);
    let linear = affine.fixed_view::<3, 3>(0, 0).into_owned();
    from_matvec(&linear, &origin)
}

/// Reorder the voxel axes of `affine`; new axis `n` is old axis `order[n]`.
fn permute_columns(affine: &Matrix4<f64>, order: [usize; 3]) -> Matrix4<f64> {
    let mut out = *affine;
    for (n, &old) in order.iter().enumerate() {
        out.set_column(n, &affine.column(old));
    }
    out
}
