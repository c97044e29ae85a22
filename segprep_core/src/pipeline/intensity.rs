//! Slice-major layout, background slice trimming and intensity normalization.

use ndarray::{s, Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::volume::{LabelMap, Volume};

/// Per-volume intensity rescaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Rescale to `[0, 1]`
    #[default]
    MinMax,
    /// Zero mean, unit variance
    ZScore,
}

/// Axis permutation that brings `axis` to the front, keeping the others in order.
pub fn slice_major_order(axis: usize) -> [usize; 3] {
    match axis {
        0 => [0, 1, 2],
        1 => [1, 0, 2],
        _ => [2, 0, 1],
    }
}

/// Move `axis` to the front so that `array[i]` is slice `i`.
pub fn to_slice_major<T: Clone>(array: Array3<T>, axis: usize) -> Array3<T> {
    if axis == 0 {
        return array;
    }
    array
        .permuted_axes(slice_major_order(axis))
        .as_standard_layout()
        .into_owned()
}

/// Slice-major arrays left after background trimming.
#[derive(Debug, Clone)]
pub struct Trimmed {
    pub volume: Volume,
    pub labels: LabelMap,
    /// Index of the first kept slice in the untrimmed arrays
    pub first: usize,
}

/// Drop leading and trailing slices whose labels are all background.
///
/// Inner background slices are kept so the remaining block stays contiguous.
pub fn trim_background_slices(volume: Volume, labels: LabelMap) -> PipelineResult<Trimmed> {
    let annotated: Vec<usize> = labels
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, slice)| slice.iter().any(|&v| v != 0))
        .map(|(i, _)| i)
        .collect();
    let (Some(&first), Some(&last)) = (annotated.first(), annotated.last()) else {
        return Err(PipelineError::shape(
            "every slice is background; nothing left after slice filtering",
        ));
    };
    if first == 0 && last + 1 == labels.len_of(Axis(0)) {
        return Ok(Trimmed {
            volume,
            labels,
            first,
        });
    }
    tracing::debug!(first, last, "trimming background slices");
    Ok(Trimmed {
        volume: volume.slice(s![first..=last, .., ..]).to_owned(),
        labels: labels.slice(s![first..=last, .., ..]).to_owned(),
        first,
    })
}

/// Monotone quantile → intensity table of a reference scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceHistogram {
    quantiles: Vec<f64>,
    values: Vec<f64>,
}

impl ReferenceHistogram {
    /// Build the table from a reference volume, keeping at most `points` entries.
    pub fn from_volume(reference: ArrayView3<'_, f64>, points: usize) -> PipelineResult<Self> {
        let mut sorted: Vec<f64> = reference.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Err(PipelineError::geometry(
                "histogram reference has no finite intensities",
            ));
        }
        sorted.sort_by(f64::total_cmp);

        let (values, quantiles) = unique_quantiles(&sorted);
        let points = points.max(2);
        if values.len() <= points {
            return Ok(Self { quantiles, values });
        }
        let last = values.len() - 1;
        let picks: Vec<usize> = (0..points).map(|i| i * last / (points - 1)).collect();
        Ok(Self {
            quantiles: picks.iter().map(|&i| quantiles[i]).collect(),
            values: picks.iter().map(|&i| values[i]).collect(),
        })
    }

    /// Intensity at quantile `q`, linearly interpolated and clamped to the table ends.
    pub fn value_at(&self, q: f64) -> f64 {
        let idx = self.quantiles.partition_point(|&x| x < q);
        if idx == 0 {
            return self.values[0];
        }
        if idx >= self.quantiles.len() {
            return self.values[self.values.len() - 1];
        }
        let (q0, q1) = (self.quantiles[idx - 1], self.quantiles[idx]);
        let (v0, v1) = (self.values[idx - 1], self.values[idx]);
        if q1 <= q0 {
            return v1;
        }
        v0 + (v1 - v0) * (q - q0) / (q1 - q0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Sorted unique values and their cumulative quantiles.
fn unique_quantiles(sorted: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let total = sorted.len() as f64;
    let mut values = Vec::new();
    let mut quantiles = Vec::new();
    for (i, &v) in sorted.iter().enumerate() {
        let is_last_of_run = sorted.get(i + 1).map_or(true, |next| *next != v);
        if is_last_of_run {
            values.push(v);
            quantiles.push((i + 1) as f64 / total);
        }
    }
    (values, quantiles)
}

/// Map the intensity distribution of `volume` onto `reference`.
///
/// Every distinct intensity is replaced by the reference intensity found at
/// the same cumulative quantile, so the ordering of voxels is preserved.
pub fn match_histogram(volume: &Volume, reference: &ReferenceHistogram) -> Volume {
    let flat: Vec<f64> = volume.iter().copied().collect();
    let mut order: Vec<usize> = (0..flat.len()).collect();
    order.sort_by(|&a, &b| flat[a].total_cmp(&flat[b]));

    let total = flat.len() as f64;
    let mut mapped = vec![0.0; flat.len()];
    let mut start = 0;
    while start < order.len() {
        let value = flat[order[start]];
        let mut end = start + 1;
        while end < order.len() && flat[order[end]] == value {
            end += 1;
        }
        let target = reference.value_at(end as f64 / total);
        for &idx in &order[start..end] {
            mapped[idx] = target;
        }
        start = end;
    }

    let mut out = volume.clone();
    for (voxel, value) in out.iter_mut().zip(mapped) {
        *voxel = value;
    }
    out
}

/// Rescale a volume; constant volumes map to zeros.
pub fn normalize(volume: &Volume, method: Normalization) -> Volume {
    if volume.is_empty() {
        return volume.clone();
    }
    match method {
        Normalization::MinMax => {
            let (min, max) = volume
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            let range = max - min;
            if range <= f64::EPSILON {
                return Array3::zeros(volume.raw_dim());
            }
            volume.mapv(|v| (v - min) / range)
        }
        Normalization::ZScore => {
            let count = volume.len() as f64;
            let mean = volume.sum() / count;
            let variance = volume.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count;
            let std = variance.sqrt();
            if std <= f64::EPSILON {
                return Array3::zeros(volume.raw_dim());
            }
            volume.mapv(|v| (v - mean) / std)
        }
    }
}

/// Replace NaN and infinite intensities with zero.
pub fn sanitize(volume: Volume) -> Volume {
    if volume.iter().all(|v| v.is_finite()) {
        return volume;
    }
    tracing::debug!("replacing non-finite intensities with zero");
    volume.mapv(|v| if v.is_finite() { v } else { 0.0 })
}
