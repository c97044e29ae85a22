//! Bring a volume and its label map into one physical frame and one voxel spacing.
//!
//! Three steps, in order: axis centralization (only when the two grids differ
//! in shape), reorientation of each array to RAS index order, and resampling to
//! the target spacing. Arrays are consumed and new arrays are returned.

use nalgebra::{Matrix3, Matrix4, Vector3};
use ndarray::{s, Array3, ArrayView3, Axis};

use super::resample::{resample_labels, resample_volume, Interpolation};
use crate::error::{PipelineError, PipelineResult};
use crate::volume::{from_matvec, io_orientation, voxel_to_world, Header, LabelMap, Volume};

/// An array permuted and flipped so that its index axes run R, A, S.
#[derive(Debug, Clone)]
pub struct Reoriented<T> {
    pub data: Array3<T>,
    /// Header of the reoriented grid; its translation is the world position of voxel 0.
    pub header: Header,
}

/// Output of [`GeometryNormalizer::normalize`].
#[derive(Debug, Clone)]
pub struct NormalizedGeometry {
    pub volume: Volume,
    pub labels: LabelMap,
    /// Voxel→world transform of the resampled volume grid
    pub affine: Matrix4<f64>,
}

#[derive(Debug, Clone)]
pub struct GeometryNormalizer {
    target_spacing: [f64; 3],
    interpolation: Interpolation,
}

impl GeometryNormalizer {
    pub fn new(target_spacing: [f64; 3], interpolation: Interpolation) -> Self {
        Self {
            target_spacing,
            interpolation,
        }
    }

    pub fn normalize(
        &self,
        volume: Volume,
        volume_header: &Header,
        labels: LabelMap,
        label_header: &Header,
    ) -> PipelineResult<NormalizedGeometry> {
        ensure_matches(volume.dim(), volume_header, "volume")?;
        ensure_matches(labels.dim(), label_header, "label map")?;

        // Same-shape pairs are treated as co-registered: the label header is
        // replaced by the volume header and no centering happens.
        let (labels, label_header) = if volume.dim() == labels.dim() {
            (labels, volume_header)
        } else {
            let centered = centralize(labels, volume_header, label_header)?;
            (centered, label_header)
        };

        let volume = reorient(volume, volume_header)?;
        let labels = reorient(labels, label_header)?;
        tracing::debug!(
            volume_spacing = ?volume.header.spacing(),
            label_spacing = ?labels.header.spacing(),
            "reoriented to RAS index order"
        );

        let resampled_volume = resample_volume(
            volume.data.view(),
            volume.header.spacing(),
            self.target_spacing,
            self.interpolation,
        )?;
        let resampled_labels = resample_labels(
            labels.data.view(),
            labels.header.spacing(),
            self.target_spacing,
        )?;

        let origin = volume.header.affine().fixed_view::<3, 1>(0, 3).into_owned();
        let affine = from_matvec(
            &Matrix3::from_diagonal(&Vector3::from(self.target_spacing)),
            &origin,
        );

        Ok(NormalizedGeometry {
            volume: resampled_volume,
            labels: resampled_labels,
            affine,
        })
    }
}

fn ensure_matches(dim: (usize, usize, usize), header: &Header, what: &str) -> PipelineResult<()> {
    let shape = [dim.0, dim.1, dim.2];
    if shape != header.shape() {
        return Err(PipelineError::geometry(format!(
            "{what} array shape {shape:?} disagrees with its header shape {:?}",
            header.shape()
        )));
    }
    Ok(())
}

/// Shift `labels` so that the label grid center lands on the volume grid center.
///
/// The center offset is measured in world space and converted to label voxel
/// units; the array is moved by the rounded offset with background fill.
pub fn centralize(
    labels: LabelMap,
    volume_header: &Header,
    label_header: &Header,
) -> PipelineResult<LabelMap> {
    let inverse = label_header
        .linear()
        .try_inverse()
        .ok_or_else(|| PipelineError::geometry("label affine is not invertible"))?;
    let delta = inverse * (volume_header.center() - label_header.center());
    let offset = [
        delta.x.round() as isize,
        delta.y.round() as isize,
        delta.z.round() as isize,
    ];
    if offset == [0, 0, 0] {
        return Ok(labels);
    }
    tracing::debug!(?offset, "centering label grid on volume grid");
    Ok(shift(labels.view(), offset))
}

/// Translate array contents by whole voxels: `out[i] = src[i - offset]`, zero elsewhere.
pub fn shift<T: Copy + Default>(source: ArrayView3<'_, T>, offset: [isize; 3]) -> Array3<T> {
    let dim = source.raw_dim();
    let mut out = Array3::from_elem(dim.clone(), T::default());

    let mut src_range = [(0isize, 0isize); 3];
    let mut dst_range = [(0isize, 0isize); 3];
    for axis in 0..3 {
        let len = dim[axis] as isize;
        let start = offset[axis].max(0);
        let end = (len + offset[axis]).min(len);
        if start >= end {
            return out;
        }
        dst_range[axis] = (start, end);
        src_range[axis] = (start - offset[axis], end - offset[axis]);
    }

    out.slice_mut(s![
        dst_range[0].0..dst_range[0].1,
        dst_range[1].0..dst_range[1].1,
        dst_range[2].0..dst_range[2].1
    ])
    .assign(&source.slice(s![
        src_range[0].0..src_range[0].1,
        src_range[1].0..src_range[1].1,
        src_range[2].0..src_range[2].1
    ]));
    out
}

/// Flip and permute `data` so that increasing indices run left→right,
/// posterior→anterior and inferior→superior.
pub fn reorient<T: Clone>(data: Array3<T>, header: &Header) -> PipelineResult<Reoriented<T>> {
    let codes = io_orientation(header.affine())?;
    let spacing = header.spacing();
    let shape = header.shape();
    let linear = header.linear();

    let mut perm = [0usize; 3];
    for (array_axis, code) in codes.iter().enumerate() {
        perm[code.world_axis] = array_axis;
    }

    let mut first_voxel = Vector3::zeros();
    let mut data = data;
    for (array_axis, code) in codes.iter().enumerate() {
        if code.flipped {
            data.invert_axis(Axis(array_axis));
            first_voxel[array_axis] = shape[array_axis] as f64 - 1.0;
        }
    }
    let origin = voxel_to_world(header.affine(), &first_voxel);

    let mut new_linear = Matrix3::zeros();
    let mut new_spacing = [0.0; 3];
    let mut new_shape = [0usize; 3];
    for world_axis in 0..3 {
        let source_axis = perm[world_axis];
        let sign = if codes[source_axis].flipped { -1.0 } else { 1.0 };
        new_linear.set_column(world_axis, &(linear.column(source_axis) * sign));
        new_spacing[world_axis] = spacing[source_axis];
        new_shape[world_axis] = shape[source_axis];
    }

    let data = data
        .permuted_axes([perm[0], perm[1], perm[2]])
        .as_standard_layout()
        .into_owned();
    let header = Header::new(new_spacing, from_matvec(&new_linear, &origin), new_shape)?;
    Ok(Reoriented { data, header })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn header(linear: Matrix3<f64>, translation: Vector3<f64>, shape: [usize; 3]) -> Header {
        let spacing = [
            linear.column(0).norm(),
            linear.column(1).norm(),
            linear.column(2).norm(),
        ];
        Header::new(spacing, from_matvec(&linear, &translation), shape).unwrap()
    }

    #[test]
    fn shift_moves_content_and_fills_background() {
        let src = Array3::from_shape_fn((3, 1, 1), |(i, _, _)| i as u16 + 1);
        let out = shift(src.view(), [1, 0, 0]);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        let out = shift(src.view(), [-2, 0, 0]);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![3, 0, 0]);
    }

    #[test]
    fn shift_beyond_extent_clears_array() {
        let src = Array3::from_elem((2, 2, 2), 5u16);
        assert!(shift(src.view(), [0, 4, 0]).iter().all(|&v| v == 0));
    }

    #[test]
    fn reorient_flips_and_permutes() {
        // axis 0 runs −A, axis 1 runs +R, axis 2 runs +S
        let linear = Matrix3::new(0.0, 2.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 3.0);
        let h = header(linear, Vector3::new(5.0, 7.0, 0.0), [2, 3, 4]);
        let data = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| i * 100 + j * 10 + k);
        let out = reorient(data.clone(), &h).unwrap();

        assert_eq!(out.data.dim(), (3, 2, 4));
        assert_eq!(out.header.spacing(), [2.0, 1.0, 3.0]);
        // new [r, a, s] reads old [1 - a, r, s]
        for r in 0..3 {
            for a in 0..2 {
                for s in 0..4 {
                    assert_eq!(out.data[[r, a, s]], data[[1 - a, r, s]]);
                }
            }
        }
        // world position of new voxel 0 is old voxel (1, 0, 0)
        let origin = out.header.affine().fixed_view::<3, 1>(0, 3).into_owned();
        assert_eq!(origin, Vector3::new(5.0, 6.0, 0.0));
    }

    #[test]
    fn canonical_input_is_unchanged() {
        let h = Header::from_spacing([1.0, 1.0, 2.0], [3, 3, 3]).unwrap();
        let data = Array3::from_shape_fn((3, 3, 3), |(i, j, k)| (i + 2 * j + 5 * k) as f64);
        let out = reorient(data.clone(), &h).unwrap();
        assert_eq!(out.data, data);
        assert_eq!(out.header, h);
    }

    #[test]
    fn centralize_aligns_grid_centers() {
        let volume_header = Header::from_spacing([1.0; 3], [8, 8, 8]).unwrap();
        // same spacing, shifted two voxels along the first axis
        let label_header = header(
            Matrix3::identity(),
            Vector3::new(-2.0, 0.0, 0.0),
            [8, 8, 6],
        )
        .with_shape([8, 8, 6])
        .unwrap();
        let mut labels = Array3::zeros((8, 8, 6));
        labels[[3, 4, 2]] = 1u16;
        let centered = centralize(labels, &volume_header, &label_header).unwrap();
        assert_eq!(centered[[5, 4, 3]], 1);
    }

    #[test]
    fn same_shape_pairs_reuse_volume_header() {
        let normalizer = GeometryNormalizer::new([1.0; 3], Interpolation::Linear);
        let volume_header = Header::from_spacing([1.0, 1.0, 2.0], [4, 4, 4]).unwrap();
        // label header claims a different spacing; it must be ignored
        let label_header = Header::from_spacing([3.0, 3.0, 3.0], [4, 4, 4]).unwrap();
        let out = normalizer
            .normalize(
                Array3::zeros((4, 4, 4)),
                &volume_header,
                Array3::zeros((4, 4, 4)),
                &label_header,
            )
            .unwrap();
        assert_eq!(out.volume.dim(), (4, 4, 8));
        assert_eq!(out.labels.dim(), (4, 4, 8));
    }

    #[test]
    fn header_shape_disagreement_is_a_geometry_error() {
        let normalizer = GeometryNormalizer::new([1.0; 3], Interpolation::Cubic);
        let h = Header::from_spacing([1.0; 3], [4, 4, 4]).unwrap();
        let err = normalizer
            .normalize(Array3::zeros((4, 4, 5)), &h, Array3::zeros((4, 4, 4)), &h)
            .unwrap_err();
        assert!(matches!(err, PipelineError::GeometryMismatch(_)));
    }
}
