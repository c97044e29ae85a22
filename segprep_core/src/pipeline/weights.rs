//! Class and slice weights derived from a normalized label map.
//!
//! Class weights use median-frequency balancing over the whole label map:
//! `w_c = median(counts of present classes) / count(c)`. Slice weights are
//! computed from each slice's own labels, so any subset of slices can be
//! re-weighted without looking at its neighbours.

use ndarray::{Array1, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::volume::Labels;

/// Importance score of one slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceWeighting {
    /// Share of non-background voxels
    #[default]
    ForegroundFraction,
    /// Share of the class range present in the slice
    ClassCoverage,
}

/// Weight given to classes that do not occur in a label map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsentClassWeight {
    #[default]
    Zero,
    /// Largest weight among the present classes
    MaxObserved,
}

/// Class and slice weight vectors of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights {
    /// One entry per class id in `0..num_classes`
    pub class: Array1<f64>,
    /// One entry per slice
    pub slice: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct WeightEstimator {
    num_classes: usize,
    slice_weighting: SliceWeighting,
    absent: AbsentClassWeight,
}

impl WeightEstimator {
    pub fn new(num_classes: usize, slice_weighting: SliceWeighting, absent: AbsentClassWeight) -> Self {
        Self {
            num_classes,
            slice_weighting,
            absent,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn estimate(&self, labels: &Labels) -> PipelineResult<Weights> {
        Ok(Weights {
            class: self.class_weights(labels)?,
            slice: self.slice_weights(labels)?,
        })
    }

    /// Voxel count per class id, pooled over every mask.
    pub fn class_counts(&self, labels: &Labels) -> PipelineResult<Vec<u64>> {
        if labels.voxel_count() == 0 {
            return Err(PipelineError::weights("label map is empty"));
        }
        let mut counts = vec![0u64; self.num_classes];
        for mask in labels.masks() {
            for &label in mask.iter() {
                let slot = counts
                    .get_mut(usize::from(label))
                    .ok_or(PipelineError::LabelOutOfRange {
                        label,
                        num_classes: self.num_classes,
                    })?;
                *slot += 1;
            }
        }
        Ok(counts)
    }

    /// Median-frequency balanced weights, one per class id.
    pub fn class_weights(&self, labels: &Labels) -> PipelineResult<Array1<f64>> {
        let counts = self.class_counts(labels)?;
        let mut present: Vec<f64> = counts.iter().filter(|&&n| n > 0).map(|&n| n as f64).collect();
        let median = median(&mut present)
            .ok_or_else(|| PipelineError::weights("no class present in label map"))?;

        let mut weights: Array1<f64> = counts
            .iter()
            .map(|&n| if n > 0 { median / n as f64 } else { 0.0 })
            .collect();

        if self.absent == AbsentClassWeight::MaxObserved {
            let max = weights.iter().copied().fold(0.0, f64::max);
            for (w, &n) in weights.iter_mut().zip(&counts) {
                if n == 0 {
                    *w = max;
                }
            }
        }
        Ok(weights)
    }

    /// Weight of every slice along the leading axis; stacked masks are averaged.
    pub fn slice_weights(&self, labels: &Labels) -> PipelineResult<Array1<f64>> {
        let slices = labels.spatial_shape()[0];
        if slices == 0 || labels.voxel_count() == 0 {
            return Err(PipelineError::weights("label map has no slices"));
        }

        let mut weights = Array1::<f64>::zeros(slices);
        for mask in labels.masks() {
            for (weight, slice) in weights.iter_mut().zip(mask.axis_iter(Axis(0))) {
                *weight += self.slice_weight(slice.view().insert_axis(Axis(0)))?;
            }
        }
        weights /= labels.mask_count() as f64;
        Ok(weights)
    }

    fn slice_weight(&self, slice: ArrayView3<'_, u16>) -> PipelineResult<f64> {
        let voxels = slice.len();
        if voxels == 0 {
            return Ok(0.0);
        }
        match self.slice_weighting {
            SliceWeighting::ForegroundFraction => {
                let foreground = slice.iter().filter(|&&v| v != 0).count();
                Ok(foreground as f64 / voxels as f64)
            }
            SliceWeighting::ClassCoverage => {
                let mut seen = vec![false; self.num_classes];
                for &label in slice.iter() {
                    let slot = seen.get_mut(usize::from(label)).ok_or(
                        PipelineError::LabelOutOfRange {
                            label,
                            num_classes: self.num_classes,
                        },
                    )?;
                    *slot = true;
                }
                let present = seen.iter().filter(|&&s| s).count();
                Ok(present as f64 / self.num_classes as f64)
            }
        }
    }
}

/// Median with the mean of the two middle values for even lengths.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array3, Array4};

    fn estimator(num_classes: usize) -> WeightEstimator {
        WeightEstimator::new(num_classes, SliceWeighting::default(), AbsentClassWeight::default())
    }

    fn labels_with_counts(counts: &[usize]) -> Labels {
        let total: usize = counts.iter().sum();
        let mut flat = Vec::with_capacity(total);
        for (class, &n) in counts.iter().enumerate() {
            flat.extend(std::iter::repeat(class as u16).take(n));
        }
        Labels::Single(Array3::from_shape_vec((1, 1, total), flat).unwrap())
    }

    #[test]
    fn rare_class_gets_larger_weight() {
        let labels = labels_with_counts(&[9000, 1000]);
        let w = estimator(2).class_weights(&labels).unwrap();
        assert!(w[0] < w[1]);
        assert_relative_eq!(w[0] * 9000.0, w[1] * 1000.0, max_relative = 1e-12);
        assert_relative_eq!(w[0] * 9000.0, 5000.0, max_relative = 1e-12);
    }

    #[test]
    fn absent_classes_default_to_zero() {
        let labels = labels_with_counts(&[30, 0, 10]);
        let w = estimator(4).class_weights(&labels).unwrap();
        assert_eq!(w.len(), 4);
        assert_eq!(w[1], 0.0);
        assert_eq!(w[3], 0.0);
        assert!(w.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn absent_classes_can_take_max_weight() {
        let labels = labels_with_counts(&[30, 0, 10]);
        let w = WeightEstimator::new(3, SliceWeighting::default(), AbsentClassWeight::MaxObserved)
            .class_weights(&labels)
            .unwrap();
        assert_eq!(w[1], w[2]);
        assert!(w[1] > w[0]);
    }

    #[test]
    fn out_of_range_label_is_reported() {
        let labels = labels_with_counts(&[4, 4, 4]);
        let err = estimator(2).class_weights(&labels).unwrap_err();
        assert!(matches!(err, PipelineError::LabelOutOfRange { label: 2, num_classes: 2 }));
    }

    #[test]
    fn empty_label_map_fails() {
        let labels = Labels::Single(Array3::zeros((0, 4, 4)));
        let err = estimator(2).estimate(&labels).unwrap_err();
        assert!(matches!(err, PipelineError::WeightComputation(_)));
    }

    #[test]
    fn foreground_fraction_per_slice() {
        let mut map = Array3::<u16>::zeros((3, 2, 2));
        map[[1, 0, 0]] = 1;
        map[[2, 0, 0]] = 1;
        map[[2, 1, 1]] = 1;
        let w = estimator(2).slice_weights(&Labels::Single(map)).unwrap();
        assert_eq!(w.to_vec(), vec![0.0, 0.25, 0.5]);
    }

    #[test]
    fn slice_weight_ignores_other_slices() {
        let mut map = Array3::<u16>::zeros((4, 3, 3));
        map[[0, 1, 1]] = 1;
        let full = estimator(2).slice_weights(&Labels::Single(map.clone())).unwrap();
        let subset = map.slice(ndarray::s![0..1, .., ..]).to_owned();
        let partial = estimator(2).slice_weights(&Labels::Single(subset)).unwrap();
        assert_eq!(full[0], partial[0]);
    }

    #[test]
    fn class_coverage_counts_distinct_classes() {
        let mut map = Array3::<u16>::zeros((2, 2, 2));
        map[[1, 0, 0]] = 2;
        map[[1, 0, 1]] = 3;
        let w = WeightEstimator::new(4, SliceWeighting::ClassCoverage, AbsentClassWeight::Zero)
            .slice_weights(&Labels::Single(map))
            .unwrap();
        assert_eq!(w.to_vec(), vec![0.25, 0.75]);
    }

    #[test]
    fn stacked_masks_pool_counts_and_average_slices() {
        let mut stack = Array4::<u16>::zeros((2, 2, 1, 2));
        stack[[0, 0, 0, 0]] = 1;
        stack[[1, 0, 0, 0]] = 1;
        stack[[1, 0, 0, 1]] = 1;
        let labels = Labels::Stacked(stack);
        let est = estimator(2);
        assert_eq!(est.class_counts(&labels).unwrap(), vec![5, 3]);
        let w = est.slice_weights(&labels).unwrap();
        assert_eq!(w.to_vec(), vec![0.75, 0.0]);
    }

    #[test]
    fn median_matches_numpy_semantics() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&mut []), None);
    }
}
