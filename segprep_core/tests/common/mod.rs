#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use nalgebra::{Matrix3, Matrix4, Vector3};
use ndarray::{Array3, ArrayD, ArrayViewD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segprep_core::volume::from_matvec;
use segprep_core::{
    ArrayStore, CohortRecord, Header, PipelineConfig, PipelineError, PipelineResult, ScanIo,
};

/// Scan store kept in memory, keyed by path.
#[derive(Default)]
pub struct MemoryIo {
    files: RwLock<HashMap<PathBuf, (ArrayD<f64>, Header)>>,
}

impl MemoryIo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, path: impl Into<PathBuf>, array: ArrayD<f64>, header: Header) {
        self.files
            .write()
            .unwrap()
            .insert(path.into(), (array, header));
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.read().unwrap().contains_key(path)
    }
}

impl ScanIo for MemoryIo {
    fn load(&self, path: &Path) -> PipelineResult<(ArrayD<f64>, Header)> {
        self.files
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| PipelineError::SourceNotFound {
                path: path.to_path_buf(),
            })
    }

    fn save(
        &self,
        array: ArrayViewD<'_, f64>,
        affine: &Matrix4<f64>,
        path: &Path,
    ) -> PipelineResult<()> {
        let shape = array.shape();
        let spacing = [
            affine.fixed_view::<3, 1>(0, 0).norm(),
            affine.fixed_view::<3, 1>(0, 1).norm(),
            affine.fixed_view::<3, 1>(0, 2).norm(),
        ];
        let header = Header::new(spacing, *affine, [shape[0], shape[1], shape[2]])?;
        self.insert(path, array.to_owned(), header);
        Ok(())
    }
}

impl ArrayStore for MemoryIo {
    fn load_array(&self, path: &Path) -> PipelineResult<ArrayD<f64>> {
        ScanIo::load(self, path).map(|(array, _)| array)
    }
}

/// Smooth random intensities seeded for reproducibility.
pub fn synthetic_volume(seed: u64, shape: (usize, usize, usize)) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::from_shape_fn(shape, |(i, j, k)| {
        let base = (i as f64 * 0.3).sin() + (j as f64 * 0.2).cos() + k as f64 * 0.05;
        100.0 + 20.0 * base + rng.gen_range(-1.0..1.0)
    })
}

/// Box of class 1 with a smaller box of class 2 inside it.
pub fn synthetic_labels(shape: (usize, usize, usize)) -> Array3<f64> {
    let (a, b, c) = shape;
    Array3::from_shape_fn(shape, |(i, j, k)| {
        let inside = |lo: usize, n: usize, x: usize| x >= n * lo / 8 && x < n * (8 - lo) / 8;
        if inside(3, a, i) && inside(3, b, j) && inside(3, c, k) {
            2.0
        } else if inside(2, a, i) && inside(2, b, j) && inside(1, c, k) {
            1.0
        } else {
            0.0
        }
    })
}

pub fn axis_aligned(spacing: [f64; 3], shape: (usize, usize, usize)) -> Header {
    let linear = Matrix3::from_diagonal(&Vector3::from(spacing));
    Header::new(spacing, from_matvec(&linear, &Vector3::zeros()), [shape.0, shape.1, shape.2])
        .unwrap()
}

/// Register a subject in `io` and return its record.
pub fn add_subject(
    io: &MemoryIo,
    id: &str,
    seed: u64,
    shape: (usize, usize, usize),
    spacing: [f64; 3],
) -> CohortRecord {
    let volume_path = PathBuf::from(format!("mem/data/{id}.nii.gz"));
    let label_path = PathBuf::from(format!("mem/label/{id}.nii.gz"));
    let header = axis_aligned(spacing, shape);
    io.insert(&volume_path, synthetic_volume(seed, shape).into_dyn(), header.clone());
    io.insert(&label_path, synthetic_labels(shape).into_dyn(), header);
    CohortRecord::new(id, volume_path, label_path)
}

pub fn config(num_classes: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.labels.num_classes = num_classes;
    config
}
