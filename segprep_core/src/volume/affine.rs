//! Affine helpers: composing voxel→world transforms and reading axis orientation.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};

use crate::error::{PipelineError, PipelineResult};

/// Build a 4×4 affine from a 3×3 linear part and a translation.
pub fn from_matvec(linear: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    let mut affine = Matrix4::identity();
    affine.fixed_view_mut::<3, 3>(0, 0).copy_from(linear);
    affine.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    affine
}

/// Map a (possibly fractional) voxel index to world coordinates.
pub fn voxel_to_world(affine: &Matrix4<f64>, index: &Vector3<f64>) -> Vector3<f64> {
    let world = affine * Vector4::new(index.x, index.y, index.z, 1.0);
    world.xyz()
}

/// World axis (0 = R, 1 = A, 2 = S) an array axis runs along, and whether it runs backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisCode {
    pub world_axis: usize,
    pub flipped: bool,
}

/// Assign every array axis to the world axis its direction cosine points at most.
///
/// The assignment is one-to-one: candidates are taken in decreasing order of
/// absolute cosine and an axis pair is only used once, so oblique acquisitions
/// still yield a valid permutation.
pub fn io_orientation(affine: &Matrix4<f64>) -> PipelineResult<[AxisCode; 3]> {
    let linear = affine.fixed_view::<3, 3>(0, 0).into_owned();
    let mut cosines = Matrix3::zeros();
    for j in 0..3 {
        let column = linear.column(j);
        let norm = column.norm();
        if !norm.is_finite() || norm <= f64::EPSILON {
            return Err(PipelineError::geometry(format!(
                "affine column {j} is degenerate (norm {norm})"
            )));
        }
        cosines.set_column(j, &(column / norm));
    }

    let mut candidates: Vec<(f64, usize, usize)> = (0..3)
        .flat_map(|j| (0..3).map(move |w| (j, w)))
        .map(|(j, w)| (cosines[(w, j)].abs(), j, w))
        .collect();
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut codes: [Option<AxisCode>; 3] = [None; 3];
    let mut world_used = [false; 3];
    for (_, j, w) in candidates {
        if codes[j].is_some() || world_used[w] {
            continue;
        }
        world_used[w] = true;
        codes[j] = Some(AxisCode {
            world_axis: w,
            flipped: cosines[(w, j)] < 0.0,
        });
    }

    let mut resolved = [AxisCode {
        world_axis: 0,
        flipped: false,
    }; 3];
    for (slot, code) in resolved.iter_mut().zip(codes) {
        *slot = code.ok_or_else(|| PipelineError::geometry("affine axes are not separable"))?;
    }
    Ok(resolved)
}
