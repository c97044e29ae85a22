//! Shape reconciliation: volume against label map, then both against the cohort grid.
//!
//! All padding and cropping is centered. The leading margin on an axis is
//! `floor(difference / 2)`, the trailing margin takes the rest.

use std::sync::OnceLock;

use ndarray::{s, Array3, ArrayView3};

use crate::error::{PipelineError, PipelineResult};

/// Canonical spacing and shape shared by every record of a run.
///
/// The shape is either given up front or frozen by the first record that
/// completes processing. Once set it never changes, and concurrent
/// readers only ever observe the frozen value.
#[derive(Debug)]
pub struct TargetGrid {
    spacing: [f64; 3],
    shape: OnceLock<[usize; 3]>,
    multiple: usize,
}

impl TargetGrid {
    pub fn new(spacing: [f64; 3], shape: Option<[usize; 3]>, multiple: usize) -> Self {
        let cell = OnceLock::new();
        if let Some(shape) = shape {
            let _ = cell.set(shape);
        }
        Self {
            spacing,
            shape: cell,
            multiple: multiple.max(1),
        }
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn shape(&self) -> Option<[usize; 3]> {
        self.shape.get().copied()
    }

    pub fn is_frozen(&self) -> bool {
        self.shape.get().is_some()
    }

    /// Shape a record of extent `equalized` is fitted to.
    ///
    /// Returns the frozen shape when there is one. Otherwise the derived shape
    /// is returned without being committed; see [`TargetGrid::freeze`].
    pub fn candidate(&self, equalized: [usize; 3]) -> [usize; 3] {
        self.shape()
            .unwrap_or_else(|| nearest_multiple(equalized, self.multiple))
    }

    /// Commit `shape` unless another shape is already frozen; returns the frozen one.
    pub fn freeze(&self, shape: [usize; 3]) -> [usize; 3] {
        let mut committed = false;
        let frozen = *self.shape.get_or_init(|| {
            committed = true;
            shape
        });
        if committed {
            tracing::info!(shape = ?frozen, "target shape frozen for the cohort");
        }
        frozen
    }
}

/// Round every extent to the nearest multiple of `multiple` (at least one multiple).
pub fn nearest_multiple(shape: [usize; 3], multiple: usize) -> [usize; 3] {
    let m = multiple.max(1);
    shape.map(|n| ((n + m / 2) / m).max(1) * m)
}

pub struct ShapeEqualizer;

impl ShapeEqualizer {
    /// Pad both arrays, centered, to their element-wise maximum shape.
    pub fn equalize<A, B>(
        first: Array3<A>,
        second: Array3<B>,
    ) -> PipelineResult<(Array3<A>, Array3<B>)>
    where
        A: Copy + Default,
        B: Copy + Default,
    {
        let a = dims(&first.view());
        let b = dims(&second.view());
        if a == b {
            return Ok((first, second));
        }
        let bound = [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])];
        tracing::debug!(?a, ?b, ?bound, "equalizing volume and label shapes");
        Ok((
            fit_to_shape(first.view(), bound)?,
            fit_to_shape(second.view(), bound)?,
        ))
    }
}

/// Center-crop or center-pad `source` to exactly `target`.
pub fn fit_to_shape<T: Copy + Default>(
    source: ArrayView3<'_, T>,
    target: [usize; 3],
) -> PipelineResult<Array3<T>> {
    let current = dims(&source);
    if current.iter().chain(target.iter()).any(|&n| n == 0) {
        return Err(PipelineError::shape(format!(
            "cannot fit shape {current:?} to {target:?}"
        )));
    }
    if current == target {
        return Ok(source.to_owned());
    }

    let mut src = [(0usize, 0usize); 3];
    let mut dst = [(0usize, 0usize); 3];
    for axis in 0..3 {
        let (n, t) = (current[axis], target[axis]);
        if n > t {
            let start = (n - t) / 2;
            src[axis] = (start, start + t);
            dst[axis] = (0, t);
        } else {
            let start = (t - n) / 2;
            src[axis] = (0, n);
            dst[axis] = (start, start + n);
        }
    }

    let mut out = Array3::from_elem((target[0], target[1], target[2]), T::default());
    out.slice_mut(s![dst[0].0..dst[0].1, dst[1].0..dst[1].1, dst[2].0..dst[2].1])
        .assign(&source.slice(s![src[0].0..src[0].1, src[1].0..src[1].1, src[2].0..src[2].1]));
    Ok(out)
}

/// Index, in `current`, of voxel 0 after a centered fit to `target`.
///
/// Positive on cropped axes, negative on padded ones.
pub fn placement_offset(current: [usize; 3], target: [usize; 3]) -> [isize; 3] {
    let mut offset = [0isize; 3];
    for axis in 0..3 {
        let (n, t) = (current[axis] as isize, target[axis] as isize);
        offset[axis] = if n > t { (n - t) / 2 } else { -((t - n) / 2) };
    }
    offset
}

fn dims<T>(view: &ArrayView3<'_, T>) -> [usize; 3] {
    let (a, b, c) = view.dim();
    [a, b, c]
}
