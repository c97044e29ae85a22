//! File access behind narrow traits.
//!
//! The pipeline only ever talks to [`ScanIo`] (scan files with geometry) and
//! [`ArrayStore`] (bare arrays from an earlier run). [`FileIo`] picks a
//! backend from the file name and implements both.

pub mod mgh;
pub mod nifti;
pub mod npz;

use std::path::Path;

use nalgebra::Matrix4;
use ndarray::{ArrayD, ArrayViewD};

use crate::error::{PipelineError, PipelineResult};
use crate::volume::Header;

pub use self::mgh::MghIo;
pub use self::nifti::NiftiIo;
pub use self::npz::{DatasetWriter, NpzArrayStore, NpzDatasetWriter, NPZ_DATA_KEY};

pub const NPZ_EXTENSION: &str = ".npz";

/// Read and write scan files together with their geometry.
pub trait ScanIo: Send + Sync {
    fn load(&self, path: &Path) -> PipelineResult<(ArrayD<f64>, Header)>;

    /// Write `array` with the given voxel→world transform, replacing any existing file.
    fn save(&self, array: ArrayViewD<'_, f64>, affine: &Matrix4<f64>, path: &Path)
        -> PipelineResult<()>;
}

/// Read arrays without geometry.
pub trait ArrayStore: Send + Sync {
    fn load_array(&self, path: &Path) -> PipelineResult<ArrayD<f64>>;
}

/// On-disk scan container, chosen by file name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFormat {
    Nifti,
    NiftiGz,
    Mgh,
    Mgz,
}

impl ScanFormat {
    const ALL: [ScanFormat; 4] = [
        ScanFormat::NiftiGz,
        ScanFormat::Nifti,
        ScanFormat::Mgz,
        ScanFormat::Mgh,
    ];

    /// Parse an extension such as `".nii.gz"`; the leading dot is optional.
    pub fn from_extension(extension: &str) -> Option<Self> {
        let normalized = extension.trim_start_matches('.').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.extension().trim_start_matches('.') == normalized)
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| name.ends_with(format.extension()))
    }

    pub fn extension(self) -> &'static str {
        match self {
            ScanFormat::Nifti => ".nii",
            ScanFormat::NiftiGz => ".nii.gz",
            ScanFormat::Mgh => ".mgh",
            ScanFormat::Mgz => ".mgz",
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, ScanFormat::NiftiGz | ScanFormat::Mgz)
    }
}

pub fn is_npz(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.to_ascii_lowercase().ends_with(NPZ_EXTENSION))
}

/// Extension-dispatching default backend.
#[derive(Debug, Clone, Default)]
pub struct FileIo {
    nifti: NiftiIo,
    mgh: MghIo,
    npz: NpzArrayStore,
}

impl FileIo {
    pub fn new() -> Self {
        Self::default()
    }

    fn scan_backend(&self, path: &Path) -> PipelineResult<&dyn ScanIo> {
        match ScanFormat::from_path(path) {
            Some(ScanFormat::Nifti | ScanFormat::NiftiGz) => Ok(&self.nifti),
            Some(ScanFormat::Mgh | ScanFormat::Mgz) => Ok(&self.mgh),
            None => Err(PipelineError::Unsupported(format!(
                "no scan format matches {}",
                path.display()
            ))),
        }
    }
}

impl ScanIo for FileIo {
    fn load(&self, path: &Path) -> PipelineResult<(ArrayD<f64>, Header)> {
        self.scan_backend(path)?.load(path)
    }

    fn save(
        &self,
        array: ArrayViewD<'_, f64>,
        affine: &Matrix4<f64>,
        path: &Path,
    ) -> PipelineResult<()> {
        self.scan_backend(path)?.save(array, affine, path)
    }
}

impl ArrayStore for FileIo {
    fn load_array(&self, path: &Path) -> PipelineResult<ArrayD<f64>> {
        if is_npz(path) {
            return self.npz.load_array(path);
        }
        let (array, _) = self.scan_backend(path)?.load(path)?;
        Ok(array)
    }
}

/// Fail with [`PipelineError::SourceNotFound`] before a decoder sees a missing path.
pub(crate) fn ensure_exists(path: &Path) -> PipelineResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::SourceNotFound {
            path: path.to_path_buf(),
        })
    }
}

/// Create the parent directory of an output file.
pub(crate) fn ensure_parent(path: &Path) -> PipelineResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))
        }
        _ => Ok(()),
    }
}
