use nalgebra::{Matrix3, Matrix4, Vector3};

use super::affine::{from_matvec, voxel_to_world};
use crate::error::{PipelineError, PipelineResult};

/// Spatial metadata of one scan: voxel spacing, voxel→world affine and grid shape.
///
/// Built once at load time. Construction validates every field, so a header
/// that exists can always drive resampling.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    spacing: [f64; 3],
    affine: Matrix4<f64>,
    shape: [usize; 3],
}

impl Header {
    pub fn new(spacing: [f64; 3], affine: Matrix4<f64>, shape: [usize; 3]) -> PipelineResult<Self> {
        if let Some(bad) = spacing.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(PipelineError::geometry(format!(
                "voxel spacing must be positive and finite, got {bad}"
            )));
        }
        if affine.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::geometry("affine contains non-finite entries"));
        }
        if affine.fixed_view::<3, 3>(0, 0).determinant().abs() <= f64::EPSILON {
            return Err(PipelineError::geometry("affine linear part is singular"));
        }
        if shape.iter().any(|&n| n == 0) {
            return Err(PipelineError::geometry(format!("empty grid {shape:?}")));
        }
        Ok(Self {
            spacing,
            affine,
            shape,
        })
    }

    /// Axis-aligned header with the origin at voxel zero.
    pub fn from_spacing(spacing: [f64; 3], shape: [usize; 3]) -> PipelineResult<Self> {
        let linear = Matrix3::from_diagonal(&Vector3::from(spacing));
        Self::new(spacing, from_matvec(&linear, &Vector3::zeros()), shape)
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn affine(&self) -> &Matrix4<f64> {
        &self.affine
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn linear(&self) -> Matrix3<f64> {
        self.affine.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Physical position of the grid center.
    pub fn center(&self) -> Vector3<f64> {
        let mid = Vector3::new(
            (self.shape[0] as f64 - 1.0) / 2.0,
            (self.shape[1] as f64 - 1.0) / 2.0,
            (self.shape[2] as f64 - 1.0) / 2.0,
        );
        voxel_to_world(&self.affine, &mid)
    }

    /// Same geometry applied to a grid of a different shape.
    pub fn with_shape(&self, shape: [usize; 3]) -> PipelineResult<Self> {
        Self::new(self.spacing, self.affine, shape)
    }
}
