use ndarray::{Array, Array3, Array4, ArrayD, ArrayView3, Axis, Dimension};

use crate::error::{PipelineError, PipelineResult};

/// Integer class-id map on the same grid as its volume.
pub type LabelMap = Array3<u16>;

/// Annotation side of a record: one map, or several masks stacked on a leading axis.
#[derive(Debug, Clone, PartialEq)]
pub enum Labels {
    Single(LabelMap),
    /// `[mask, slice, row, col]`
    Stacked(Array4<u16>),
}

impl Labels {
    /// Views of every mask, in stacking order.
    pub fn masks(&self) -> Vec<ArrayView3<'_, u16>> {
        match self {
            Labels::Single(map) => vec![map.view()],
            Labels::Stacked(stack) => stack.axis_iter(Axis(0)).collect(),
        }
    }

    pub fn mask_count(&self) -> usize {
        match self {
            Labels::Single(_) => 1,
            Labels::Stacked(stack) => stack.len_of(Axis(0)),
        }
    }

    /// Shape of one mask.
    pub fn spatial_shape(&self) -> [usize; 3] {
        match self {
            Labels::Single(map) => {
                let (a, b, c) = map.dim();
                [a, b, c]
            }
            Labels::Stacked(stack) => {
                let (_, a, b, c) = stack.dim();
                [a, b, c]
            }
        }
    }

    pub fn voxel_count(&self) -> usize {
        match self {
            Labels::Single(map) => map.len(),
            Labels::Stacked(stack) => stack.len(),
        }
    }

    pub fn into_dyn(self) -> ArrayD<u16> {
        match self {
            Labels::Single(map) => map.into_dyn(),
            Labels::Stacked(stack) => stack.into_dyn(),
        }
    }

    pub fn max_label(&self) -> Option<u16> {
        let max = |view: ArrayView3<'_, u16>| view.iter().copied().max();
        self.masks().into_iter().filter_map(max).max()
    }
}

/// Round a continuous label array to class ids.
///
/// Interpolated or float-typed label files can carry values like `0.9999`;
/// those are rounded. Negative, non-finite or out-of-`u16` values are rejected.
pub fn labels_from_continuous<D: Dimension>(array: Array<f64, D>) -> PipelineResult<Array<u16, D>> {
    if let Some(&value) = array.iter().find(|v| !v.is_finite()) {
        return Err(PipelineError::InvalidLabel {
            value,
            reason: "not finite",
        });
    }
    if let Some(&value) = array.iter().find(|v| v.round() < 0.0) {
        return Err(PipelineError::InvalidLabel {
            value,
            reason: "negative",
        });
    }
    if let Some(&value) = array.iter().find(|v| v.round() > f64::from(u16::MAX)) {
        return Err(PipelineError::InvalidLabel {
            value,
            reason: "exceeds the class id range",
        });
    }
    Ok(array.mapv(|v| v.round() as u16))
}
