//! FreeSurfer MGH/MGZ reader and writer.
//!
//! Layout: a big-endian header block of 284 bytes followed by the voxel data
//! in column-major order (first axis fastest). `.mgz` is the same stream
//! gzip-compressed. Trailing tag sections after the data are ignored.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nalgebra::{Matrix3, Matrix4, Vector3};
use ndarray::{ArrayD, ArrayViewD, IxDyn, ShapeBuilder};

use super::{ensure_exists, ensure_parent, ScanFormat, ScanIo};
use crate::error::{PipelineError, PipelineResult};
use crate::volume::{from_matvec, Header};

const FORMAT: &str = "MGH";
const HEADER_BYTES: usize = 284;
const MGH_VERSION: i32 = 1;

/// Voxel encodings defined by the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MghType {
    UChar,
    Int,
    Float,
    Short,
}

impl MghType {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(MghType::UChar),
            1 => Some(MghType::Int),
            3 => Some(MghType::Float),
            4 => Some(MghType::Short),
            _ => None,
        }
    }

    fn code(self) -> i32 {
        match self {
            MghType::UChar => 0,
            MghType::Int => 1,
            MghType::Float => 3,
            MghType::Short => 4,
        }
    }

    fn width(self) -> usize {
        match self {
            MghType::UChar => 1,
            MghType::Short => 2,
            MghType::Int | MghType::Float => 4,
        }
    }

    fn decode(self, bytes: &[u8]) -> f64 {
        match self {
            MghType::UChar => f64::from(bytes[0]),
            MghType::Short => f64::from(i16::from_be_bytes([bytes[0], bytes[1]])),
            MghType::Int => f64::from(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            MghType::Float => f64::from(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        }
    }
}

/// Parsed fixed header fields.
#[derive(Debug, Clone, PartialEq)]
struct MghHeader {
    dims: [usize; 4],
    data_type: MghType,
    spacing: [f64; 3],
    /// Direction cosines as columns
    mdc: Matrix3<f64>,
    c_ras: Vector3<f64>,
}

impl MghHeader {
    fn parse(bytes: &[u8], path: &Path) -> PipelineResult<Self> {
        if bytes.len() < HEADER_BYTES {
            return Err(PipelineError::format(FORMAT, path, "file shorter than its header"));
        }
        let mut cursor = BeCursor::new(bytes);
        let version = cursor.i32();
        if version != MGH_VERSION {
            return Err(PipelineError::format(
                FORMAT,
                path,
                format!("unknown version {version}"),
            ));
        }
        let mut dims = [0usize; 4];
        for d in dims.iter_mut() {
            let value = cursor.i32();
            *d = usize::try_from(value)
                .map_err(|_| PipelineError::format(FORMAT, path, "negative dimension"))?;
        }
        let code = cursor.i32();
        let data_type = MghType::from_code(code).ok_or_else(|| {
            PipelineError::format(FORMAT, path, format!("unsupported voxel type {code}"))
        })?;
        let _dof = cursor.i32();
        let good_ras = cursor.i16();
        if good_ras <= 0 {
            return Err(PipelineError::geometry(format!(
                "{} carries no valid RAS orientation",
                path.display()
            )));
        }

        let spacing = [
            f64::from(cursor.f32()),
            f64::from(cursor.f32()),
            f64::from(cursor.f32()),
        ];
        let mut mdc = Matrix3::zeros();
        for col in 0..3 {
            for row in 0..3 {
                mdc[(row, col)] = f64::from(cursor.f32());
            }
        }
        let c_ras = Vector3::new(
            f64::from(cursor.f32()),
            f64::from(cursor.f32()),
            f64::from(cursor.f32()),
        );

        Ok(Self {
            dims,
            data_type,
            spacing,
            mdc,
            c_ras,
        })
    }

    /// Voxel→world transform; `c_ras` is the world position of voxel `dims / 2`.
    fn affine(&self) -> Matrix4<f64> {
        let linear = self.mdc * Matrix3::from_diagonal(&Vector3::from(self.spacing));
        let center = Vector3::new(
            self.dims[0] as f64 / 2.0,
            self.dims[1] as f64 / 2.0,
            self.dims[2] as f64 / 2.0,
        );
        from_matvec(&linear, &(self.c_ras - linear * center))
    }

    fn from_affine(dims: [usize; 4], affine: &Matrix4<f64>) -> Self {
        let linear = affine.fixed_view::<3, 3>(0, 0).into_owned();
        let mut spacing = [0.0; 3];
        let mut mdc = Matrix3::zeros();
        for axis in 0..3 {
            let column = linear.column(axis);
            let norm = column.norm();
            spacing[axis] = norm;
            mdc.set_column(axis, &(column / norm));
        }
        let center = Vector3::new(
            dims[0] as f64 / 2.0,
            dims[1] as f64 / 2.0,
            dims[2] as f64 / 2.0,
        );
        let translation = affine.fixed_view::<3, 1>(0, 3).into_owned();
        Self {
            dims,
            data_type: MghType::Float,
            spacing,
            mdc,
            c_ras: linear * center + translation,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_BYTES);
        out.extend_from_slice(&MGH_VERSION.to_be_bytes());
        for &d in &self.dims {
            out.extend_from_slice(&(d as i32).to_be_bytes());
        }
        out.extend_from_slice(&self.data_type.code().to_be_bytes());
        out.extend_from_slice(&0i32.to_be_bytes());
        out.extend_from_slice(&1i16.to_be_bytes());
        for &s in &self.spacing {
            out.extend_from_slice(&(s as f32).to_be_bytes());
        }
        for col in 0..3 {
            for row in 0..3 {
                out.extend_from_slice(&(self.mdc[(row, col)] as f32).to_be_bytes());
            }
        }
        for &c in self.c_ras.iter() {
            out.extend_from_slice(&(c as f32).to_be_bytes());
        }
        out.resize(HEADER_BYTES, 0);
        out
    }
}

struct BeCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BeCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn i32(&mut self) -> i32 {
        i32::from_be_bytes(self.take())
    }

    fn i16(&mut self) -> i16 {
        i16::from_be_bytes(self.take())
    }

    fn f32(&mut self) -> f32 {
        f32::from_be_bytes(self.take())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MghIo;

impl MghIo {
    fn read_bytes(path: &Path) -> PipelineResult<Vec<u8>> {
        ensure_exists(path)?;
        let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
        let mut bytes = Vec::new();
        let result = if ScanFormat::from_path(path).map_or(false, ScanFormat::is_compressed) {
            GzDecoder::new(BufReader::new(file)).read_to_end(&mut bytes)
        } else {
            BufReader::new(file).read_to_end(&mut bytes)
        };
        result.map_err(|err| PipelineError::format(FORMAT, path, err))?;
        Ok(bytes)
    }
}

impl ScanIo for MghIo {
    fn load(&self, path: &Path) -> PipelineResult<(ArrayD<f64>, Header)> {
        let bytes = Self::read_bytes(path)?;
        let header = MghHeader::parse(&bytes, path)?;

        let width = header.data_type.width();
        let voxels = header
            .dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d));
        let end = voxels
            .and_then(|n| n.checked_mul(width))
            .and_then(|n| n.checked_add(HEADER_BYTES));
        let (Some(voxels), Some(end)) = (voxels, end) else {
            return Err(PipelineError::format(
                FORMAT,
                path,
                format!("dimension product of {:?} overflows", header.dims),
            ));
        };
        if bytes.len() < end {
            return Err(PipelineError::format(
                FORMAT,
                path,
                format!("expected {voxels} voxels, data is truncated"),
            ));
        }
        let data: Vec<f64> = bytes[HEADER_BYTES..end]
            .chunks_exact(width)
            .map(|chunk| header.data_type.decode(chunk))
            .collect();

        let shape: Vec<usize> = if header.dims[3] > 1 {
            header.dims.to_vec()
        } else {
            header.dims[..3].to_vec()
        };
        let array = ArrayD::from_shape_vec(IxDyn(&shape).f(), data)
            .map_err(|err| PipelineError::format(FORMAT, path, err))?
            .as_standard_layout()
            .into_owned();

        let geometry = Header::new(
            header.spacing,
            header.affine(),
            [header.dims[0], header.dims[1], header.dims[2]],
        )?;
        Ok((array, geometry))
    }

    fn save(
        &self,
        array: ArrayViewD<'_, f64>,
        affine: &Matrix4<f64>,
        path: &Path,
    ) -> PipelineResult<()> {
        let shape = array.shape();
        if shape.is_empty() || shape.len() > 4 {
            return Err(PipelineError::Unsupported(format!(
                "MGH holds 1 to 4 axes, got {}",
                shape.len()
            )));
        }
        let mut dims = [1usize; 4];
        dims[..shape.len()].copy_from_slice(shape);
        let header = MghHeader::from_affine(dims, affine);

        let mut bytes = header.to_bytes();
        bytes.reserve(array.len() * 4);
        // column-major: iterate the transposed view in logical order
        for &value in array.t().iter() {
            bytes.extend_from_slice(&(value as f32).to_be_bytes());
        }

        ensure_parent(path)?;
        write_stream(path, &bytes).map_err(|err| PipelineError::io(path, err))
    }
}

fn write_stream(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    if ScanFormat::from_path(path).map_or(false, ScanFormat::is_compressed) {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()?.flush()
    } else {
        writer.write_all(bytes)?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn oblique_affine() -> Matrix4<f64> {
        // LIA-like orientation, the FreeSurfer conformed layout
        let linear = Matrix3::new(-1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, -1.0, 0.0);
        from_matvec(&linear, &Vector3::new(128.0, -128.0, 128.0))
    }

    #[test]
    fn header_bytes_round_trip() {
        let header = MghHeader::from_affine([4, 6, 8, 1], &oblique_affine());
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_BYTES);
        let parsed = MghHeader::parse(&bytes, Path::new("mem.mgh")).unwrap();
        assert_eq!(parsed.dims, [4, 6, 8, 1]);
        assert_eq!(parsed.data_type, MghType::Float);
        let (a, b) = (parsed.affine(), oblique_affine());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-4);
        }
    }

    #[test]
    fn missing_ras_is_geometry_mismatch() {
        let mut bytes = MghHeader::from_affine([2, 2, 2, 1], &oblique_affine()).to_bytes();
        // goodRASFlag sits after version, four dims, type and dof
        bytes[28..30].copy_from_slice(&0i16.to_be_bytes());
        let err = MghHeader::parse(&bytes, Path::new("x.mgh")).unwrap_err();
        assert!(matches!(err, PipelineError::GeometryMismatch(_)));
    }

    #[test]
    fn compressed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brain.mgz");
        let volume = Array3::from_shape_fn((3, 4, 5), |(i, j, k)| (i + 3 * j + 12 * k) as f64 * 0.5);

        MghIo.save(volume.view().into_dyn(), &oblique_affine(), &path).unwrap();
        let (loaded, header) = MghIo.load(&path).unwrap();

        assert_eq!(loaded, volume.into_dyn());
        assert_eq!(header.shape(), [3, 4, 5]);
        assert_relative_eq!(header.affine()[(0, 3)], 128.0, epsilon = 1e-4);
    }

    #[test]
    fn truncated_data_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.mgh");
        let header = MghHeader::from_affine([4, 4, 4, 1], &oblique_affine());
        std::fs::write(&path, header.to_bytes()).unwrap();
        let err = MghIo.load(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Format { .. }));
    }

    #[test]
    fn huge_dimensions_are_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.mgh");
        let mut bytes = MghHeader::from_affine([2, 2, 2, 1], &oblique_affine()).to_bytes();
        // four big-endian i32 dims follow the version
        for axis in 0..4 {
            let at = 4 + 4 * axis;
            bytes[at..at + 4].copy_from_slice(&i32::MAX.to_be_bytes());
        }
        std::fs::write(&path, bytes).unwrap();
        let err = MghIo.load(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Format { .. }));
        assert!(err.to_string().contains("overflows"));
    }
}
