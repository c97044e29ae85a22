//! NIfTI-1 backend on top of the `nifti` crate.

use std::path::Path;

use ::nifti::writer::WriterOptions;
use ::nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use nalgebra::{Matrix3, Matrix4, Quaternion, UnitQuaternion, Vector3};
use ndarray::{ArrayD, ArrayViewD};

use super::{ensure_exists, ensure_parent, ScanIo};
use crate::error::{PipelineError, PipelineResult};
use crate::volume::{from_matvec, Header};

const FORMAT: &str = "NIfTI";

#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiIo;

impl ScanIo for NiftiIo {
    fn load(&self, path: &Path) -> PipelineResult<(ArrayD<f64>, Header)> {
        ensure_exists(path)?;
        let object = ReaderOptions::new()
            .read_file(path)
            .map_err(|err| PipelineError::format(FORMAT, path, err))?;
        let header = header_from_nifti(object.header())?;
        let array = object
            .into_volume()
            .into_ndarray::<f64>()
            .map_err(|err| PipelineError::format(FORMAT, path, err))?
            .as_standard_layout()
            .into_owned();
        Ok((array, header))
    }

    fn save(
        &self,
        array: ArrayViewD<'_, f64>,
        affine: &Matrix4<f64>,
        path: &Path,
    ) -> PipelineResult<()> {
        ensure_parent(path)?;
        let header = nifti_header_for(affine);
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&array)
            .map_err(|err| PipelineError::format(FORMAT, path, err))
    }
}

/// Build a validated [`Header`] from the NIfTI fields.
///
/// The transform comes from the sform when its code is set, then from the
/// qform quaternion, and falls back to the bare voxel sizes.
pub fn header_from_nifti(raw: &NiftiHeader) -> PipelineResult<Header> {
    let rank = usize::from(raw.dim[0]);
    if rank == 0 || rank > 7 {
        return Err(PipelineError::geometry(format!("invalid NIfTI rank {rank}")));
    }
    let mut shape = [1usize; 3];
    for (axis, extent) in shape.iter_mut().enumerate().take(rank.min(3)) {
        *extent = usize::from(raw.dim[axis + 1]);
    }
    let mut spacing = [1.0f64; 3];
    for (axis, s) in spacing.iter_mut().enumerate().take(rank.min(3)) {
        *s = f64::from(raw.pixdim[axis + 1]).abs();
    }

    let affine = if raw.sform_code > 0 {
        sform_affine(raw)
    } else if raw.qform_code > 0 {
        qform_affine(raw, spacing)
    } else {
        tracing::debug!("NIfTI header has neither sform nor qform; using voxel sizes");
        from_matvec(&Matrix3::from_diagonal(&Vector3::from(spacing)), &Vector3::zeros())
    };
    Header::new(spacing, affine, shape)
}

fn sform_affine(raw: &NiftiHeader) -> Matrix4<f64> {
    let mut affine = Matrix4::identity();
    for (row, srow) in [raw.srow_x, raw.srow_y, raw.srow_z].iter().enumerate() {
        for (col, &value) in srow.iter().enumerate() {
            affine[(row, col)] = f64::from(value);
        }
    }
    affine
}

fn qform_affine(raw: &NiftiHeader, spacing: [f64; 3]) -> Matrix4<f64> {
    let (b, c, d) = (
        f64::from(raw.quatern_b),
        f64::from(raw.quatern_c),
        f64::from(raw.quatern_d),
    );
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(a, b, c, d));
    let qfac = if raw.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let scale = Matrix3::from_diagonal(&Vector3::new(spacing[0], spacing[1], spacing[2] * qfac));
    let linear = rotation.to_rotation_matrix().into_inner() * scale;
    let offset = Vector3::new(
        f64::from(raw.quatern_x),
        f64::from(raw.quatern_y),
        f64::from(raw.quatern_z),
    );
    from_matvec(&linear, &offset)
}

/// Reference header carrying `affine` as sform; the writer fills in dims and datatype.
fn nifti_header_for(affine: &Matrix4<f64>) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    let linear = affine.fixed_view::<3, 3>(0, 0);
    header.pixdim = [1.0; 8];
    for axis in 0..3 {
        header.pixdim[axis + 1] = linear.column(axis).norm() as f32;
    }
    header.qform_code = 0;
    header.sform_code = 1;
    let row = |r: usize| {
        [
            affine[(r, 0)] as f32,
            affine[(r, 1)] as f32,
            affine[(r, 2)] as f32,
            affine[(r, 3)] as f32,
        ]
    };
    header.srow_x = row(0);
    header.srow_y = row(1);
    header.srow_z = row(2);
    header
}
