//! NumPy `.npz` containers: cached arrays and packaged dataset buckets.

use std::fs::File;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, ArrayViewD, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, ReadableElement};

use super::{ensure_exists, ensure_parent, ArrayStore};
use crate::config::PipelineConfig;
use crate::error::{CohortError, PipelineError, PipelineResult};

/// Entry holding the array of a cached single-array container.
pub const NPZ_DATA_KEY: &str = "np_data";

const FORMAT: &str = "NPZ";

fn entry_matches(name: &str, key: &str) -> bool {
    name.strip_suffix(".npy").unwrap_or(name) == key
}

fn read_entry<T>(reader: &mut NpzReader<File>, index: usize) -> Result<ArrayD<f64>, ReadNpzError>
where
    T: ReadableElement + Copy + Into<f64>,
{
    let array = reader.by_index::<OwnedRepr<T>, IxDyn>(index)?;
    Ok(array.mapv(Into::into))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NpzArrayStore;

impl NpzArrayStore {
    /// Write `array` under [`NPZ_DATA_KEY`], replacing any existing file.
    pub fn save_array(&self, array: ArrayViewD<'_, f64>, path: &Path) -> PipelineResult<()> {
        ensure_parent(path)?;
        let file = File::create(path).map_err(|err| PipelineError::io(path, err))?;
        let mut writer = NpzWriter::new_compressed(file);
        writer
            .add_array(NPZ_DATA_KEY, &array)
            .map_err(|err| PipelineError::format(FORMAT, path, err))?;
        writer
            .finish()
            .map_err(|err| PipelineError::format(FORMAT, path, err))?;
        Ok(())
    }
}

impl ArrayStore for NpzArrayStore {
    /// Read the `np_data` entry; any integer or float dtype is widened to `f64`.
    fn load_array(&self, path: &Path) -> PipelineResult<ArrayD<f64>> {
        ensure_exists(path)?;
        let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
        let mut reader =
            NpzReader::new(file).map_err(|err| PipelineError::format(FORMAT, path, err))?;
        let names = reader
            .names()
            .map_err(|err| PipelineError::format(FORMAT, path, err))?;
        let index = names
            .iter()
            .position(|name| entry_matches(name, NPZ_DATA_KEY))
            .ok_or_else(|| {
                PipelineError::format(FORMAT, path, format!("no `{NPZ_DATA_KEY}` entry"))
            })?;

        let readers: [fn(&mut NpzReader<File>, usize) -> Result<ArrayD<f64>, ReadNpzError>; 6] = [
            read_entry::<f64>,
            read_entry::<f32>,
            read_entry::<u8>,
            read_entry::<u16>,
            read_entry::<i16>,
            read_entry::<i32>,
        ];
        let mut last_error = None;
        for read in readers {
            match read(&mut reader, index) {
                Ok(array) => return Ok(array),
                Err(err) => last_error = Some(err),
            }
        }
        Err(PipelineError::format(
            FORMAT,
            path,
            last_error.map_or_else(|| "unreadable entry".to_string(), |err| err.to_string()),
        ))
    }
}

/// One array of a dataset bucket.
#[derive(Debug, Clone)]
pub enum BucketArray<'a> {
    Float(ArrayViewD<'a, f64>),
    Label(ArrayViewD<'a, u16>),
}

/// Sink for packaged dataset buckets.
pub trait DatasetWriter {
    /// Persist `entries` as bucket `bucket` of split `split`, keeping their order.
    fn write_bucket(
        &self,
        split: &str,
        bucket: &str,
        entries: &[(String, BucketArray<'_>)],
    ) -> Result<PathBuf, CohortError>;
}

/// Writes `{dir}/{split}_{bucket}.npz`, one compressed entry per record.
#[derive(Debug, Clone)]
pub struct NpzDatasetWriter {
    dir: PathBuf,
}

impl NpzDatasetWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Writer rooted at the configured `cohort.dataset_dir`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.cohort.dataset_dir)
    }

    pub fn bucket_path(&self, split: &str, bucket: &str) -> PathBuf {
        self.dir.join(format!("{split}_{bucket}.npz"))
    }
}

impl DatasetWriter for NpzDatasetWriter {
    fn write_bucket(
        &self,
        split: &str,
        bucket: &str,
        entries: &[(String, BucketArray<'_>)],
    ) -> Result<PathBuf, CohortError> {
        let path = self.bucket_path(split, bucket);
        std::fs::create_dir_all(&self.dir)
            .map_err(|err| CohortError::persistence(&self.dir, err))?;
        let file = File::create(&path).map_err(|err| CohortError::persistence(&path, err))?;

        let mut writer = NpzWriter::new_compressed(file);
        for (key, array) in entries {
            let result = match array {
                BucketArray::Float(view) => writer.add_array(key.as_str(), view),
                BucketArray::Label(view) => writer.add_array(key.as_str(), view),
            };
            result.map_err(|err| CohortError::persistence(&path, err))?;
        }
        writer
            .finish()
            .map_err(|err| CohortError::persistence(&path, err))?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "dataset bucket written");
        Ok(path)
    }
}

/// Read every entry of a float bucket back, in stored order.
pub fn read_float_bucket(path: &Path) -> PipelineResult<Vec<(String, ArrayD<f64>)>> {
    ensure_exists(path)?;
    let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
    let mut reader = NpzReader::new(file).map_err(|err| PipelineError::format(FORMAT, path, err))?;
    let names = reader
        .names()
        .map_err(|err| PipelineError::format(FORMAT, path, err))?;
    names
        .into_iter()
        .enumerate()
        .map(|(index, name)| {
            let array = read_entry::<f64>(&mut reader, index)
                .map_err(|err| PipelineError::format(FORMAT, path, err))?;
            let key = name.strip_suffix(".npy").unwrap_or(&name).to_string();
            Ok((key, array))
        })
        .collect()
}
