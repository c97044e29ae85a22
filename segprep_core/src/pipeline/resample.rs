//! Spacing-aware resampling of 3D grids.
//!
//! Intensities are resampled with a separable kernel: each axis is processed in
//! turn, lane by lane, in parallel through `ndarray::Zip`. The cubic kernel is
//! an order-3 B-spline whose coefficients come from a recursive prefilter with
//! mirror boundaries. Labels never go through a continuous kernel; they are
//! gathered with nearest-neighbour indices and keep their integer type.
//!
//! Output extents follow `round(len * spacing / target_spacing)` and sample
//! positions follow `x_out * (len_in - 1) / (len_out - 1)`, the convention of
//! `scipy.ndimage.zoom`.

use ndarray::{Array3, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Interpolation kernel for continuous data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    Linear,
    #[default]
    Cubic,
}

/// Pole of the cubic B-spline prefilter, `sqrt(3) - 2`.
const CUBIC_POLE: f64 = -0.267_949_192_431_122_7;
const PREFILTER_TOLERANCE: f64 = 1e-12;

/// Extent of the resampled grid for the given current and target spacing.
pub fn resampled_shape(
    shape: [usize; 3],
    spacing: [f64; 3],
    target_spacing: [f64; 3],
) -> PipelineResult<[usize; 3]> {
    let mut out = [0usize; 3];
    for axis in 0..3 {
        let zoom = spacing[axis] / target_spacing[axis];
        if !zoom.is_finite() || zoom <= 0.0 {
            return Err(PipelineError::geometry(format!(
                "cannot resample axis {axis}: spacing {} to {}",
                spacing[axis], target_spacing[axis]
            )));
        }
        out[axis] = ((shape[axis] as f64 * zoom).round() as usize).max(1);
    }
    Ok(out)
}

/// Resample a continuous volume from `spacing` onto `target_spacing`.
pub fn resample_volume(
    volume: ArrayView3<'_, f64>,
    spacing: [f64; 3],
    target_spacing: [f64; 3],
    interpolation: Interpolation,
) -> PipelineResult<Array3<f64>> {
    let (a, b, c) = volume.dim();
    let shape = resampled_shape([a, b, c], spacing, target_spacing)?;
    resize_volume(volume, shape, interpolation)
}

/// Resample a volume to an explicit output shape.
pub fn resize_volume(
    volume: ArrayView3<'_, f64>,
    shape: [usize; 3],
    interpolation: Interpolation,
) -> PipelineResult<Array3<f64>> {
    if volume.is_empty() {
        return Err(PipelineError::shape("cannot resample an empty volume"));
    }
    let mut current = volume.to_owned();
    for (axis, &out_len) in shape.iter().enumerate() {
        if current.len_of(Axis(axis)) == out_len {
            continue;
        }
        current = resample_axis(&current, axis, out_len, interpolation);
    }
    Ok(current)
}

/// Resample a label map with nearest-neighbour sampling.
pub fn resample_labels(
    labels: ArrayView3<'_, u16>,
    spacing: [f64; 3],
    target_spacing: [f64; 3],
) -> PipelineResult<Array3<u16>> {
    let (a, b, c) = labels.dim();
    let shape = resampled_shape([a, b, c], spacing, target_spacing)?;
    resize_nearest(labels, shape)
}

/// Gather `source` onto `shape` by nearest-neighbour index lookup.
pub fn resize_nearest<T>(source: ArrayView3<'_, T>, shape: [usize; 3]) -> PipelineResult<Array3<T>>
where
    T: Copy + Default + Send + Sync,
{
    if source.is_empty() {
        return Err(PipelineError::shape("cannot resample an empty label map"));
    }
    let (a, b, c) = source.dim();
    let lookup = [
        nearest_indices(a, shape[0]),
        nearest_indices(b, shape[1]),
        nearest_indices(c, shape[2]),
    ];

    let mut out = Array3::from_elem((shape[0], shape[1], shape[2]), T::default());
    Zip::indexed(&mut out).par_for_each(|(i, j, k), value| {
        *value = source[[lookup[0][i], lookup[1][j], lookup[2][k]]];
    });
    Ok(out)
}

fn resample_axis(
    source: &Array3<f64>,
    axis: usize,
    out_len: usize,
    interpolation: Interpolation,
) -> Array3<f64> {
    let in_len = source.len_of(Axis(axis));
    let mut shape = source.raw_dim();
    shape[axis] = out_len;
    let mut out = Array3::zeros(shape);
    let coordinates = sample_coordinates(in_len, out_len);

    Zip::from(out.lanes_mut(Axis(axis)))
        .and(source.lanes(Axis(axis)))
        .par_for_each(|mut dst, src| {
            let mut samples = src.to_vec();
            match interpolation {
                Interpolation::Nearest => {
                    for (value, &x) in dst.iter_mut().zip(&coordinates) {
                        *value = samples[nearest(x, in_len)];
                    }
                }
                Interpolation::Linear => {
                    for (value, &x) in dst.iter_mut().zip(&coordinates) {
                        *value = linear_at(&samples, x);
                    }
                }
                Interpolation::Cubic => {
                    cubic_prefilter(&mut samples);
                    for (value, &x) in dst.iter_mut().zip(&coordinates) {
                        *value = cubic_at(&samples, x);
                    }
                }
            }
        });
    out
}

fn sample_coordinates(in_len: usize, out_len: usize) -> Vec<f64> {
    if out_len <= 1 || in_len <= 1 {
        return vec![0.0; out_len];
    }
    let step = (in_len - 1) as f64 / (out_len - 1) as f64;
    (0..out_len).map(|i| i as f64 * step).collect()
}

fn nearest_indices(in_len: usize, out_len: usize) -> Vec<usize> {
    sample_coordinates(in_len, out_len)
        .into_iter()
        .map(|x| nearest(x, in_len))
        .collect()
}

fn nearest(x: f64, len: usize) -> usize {
    ((x + 0.5).floor().max(0.0) as usize).min(len - 1)
}

fn linear_at(samples: &[f64], x: f64) -> f64 {
    let last = samples.len() - 1;
    let left = (x.floor().max(0.0) as usize).min(last);
    let right = (left + 1).min(last);
    let t = x - left as f64;
    samples[left] * (1.0 - t) + samples[right] * t
}

/// Mirror an out-of-range index back into `0..len` (whole-sample symmetric).
fn mirror_index(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let folded = index.rem_euclid(period);
    if folded >= len as isize {
        (period - folded) as usize
    } else {
        folded as usize
    }
}

/// In-place conversion of samples to cubic B-spline coefficients.
fn cubic_prefilter(coefficients: &mut [f64]) {
    let len = coefficients.len();
    if len < 2 {
        return;
    }
    let z = CUBIC_POLE;
    let gain = (1.0 - z) * (1.0 - 1.0 / z);
    for c in coefficients.iter_mut() {
        *c *= gain;
    }

    coefficients[0] = causal_initial(coefficients, z);
    for k in 1..len {
        coefficients[k] += z * coefficients[k - 1];
    }
    coefficients[len - 1] =
        (z / (z * z - 1.0)) * (coefficients[len - 1] + z * coefficients[len - 2]);
    for k in (0..len - 1).rev() {
        coefficients[k] = z * (coefficients[k + 1] - coefficients[k]);
    }
}

fn causal_initial(c: &[f64], z: f64) -> f64 {
    let len = c.len();
    let horizon = (PREFILTER_TOLERANCE.ln() / z.abs().ln()).ceil() as usize;
    if horizon < len {
        let mut zn = z;
        let mut sum = c[0];
        for &value in &c[1..horizon] {
            sum += zn * value;
            zn *= z;
        }
        sum
    } else {
        let mut zn = z;
        let iz = 1.0 / z;
        let mut z2n = z.powi(len as i32 - 1);
        let mut sum = c[0] + z2n * c[len - 1];
        z2n *= z2n * iz;
        for &value in &c[1..len - 1] {
            sum += (zn + z2n) * value;
            zn *= z;
            z2n *= iz;
        }
        sum / (1.0 - zn * zn)
    }
}

fn cubic_at(coefficients: &[f64], x: f64) -> f64 {
    let len = coefficients.len();
    if len == 1 {
        return coefficients[0];
    }
    let base = x.floor();
    let t = x - base;
    let base = base as isize;

    let t2 = t * t;
    let t3 = t2 * t;
    let weights = [
        (1.0 - t).powi(3) / 6.0,
        (4.0 - 6.0 * t2 + 3.0 * t3) / 6.0,
        (1.0 + 3.0 * t + 3.0 * t2 - 3.0 * t3) / 6.0,
        t3 / 6.0,
    ];

    weights
        .iter()
        .enumerate()
        .map(|(offset, w)| w * coefficients[mirror_index(base - 1 + offset as isize, len)])
        .sum()
}
