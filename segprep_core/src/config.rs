//! Pipeline configuration management via TOML files.
//!
//! Every recognized option is listed on [`PipelineConfig`] with its default.
//! Parsing goes through private `Raw*` structs so that validation happens in
//! one place and the public structs can only hold consistent values.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::io::ScanFormat;
use crate::pipeline::intensity::Normalization;
use crate::pipeline::resample::Interpolation;
use crate::pipeline::weights::{AbsentClassWeight, SliceWeighting};

/// Complete configuration consumed by the pipeline and the cohort driver.
///
/// # Examples
///
/// ```
/// use segprep_core::PipelineConfig;
///
/// let config = PipelineConfig::from_str("[grid]\ntarget_spacing = [1.0, 1.0, 2.0]").unwrap();
/// assert_eq!(config.grid.target_spacing, [1.0, 1.0, 2.0]);
/// assert!(config.grid.target_shape.is_none());
/// ```
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineConfig {
    pub grid: GridConfig,
    pub intensity: IntensityConfig,
    pub labels: LabelConfig,
    pub cohort: CohortConfig,
    pub paths: PathConfig,
}

impl PipelineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path)?;
        Self::from_str(&contents)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let raw: RawPipelineConfig =
            toml::from_str(toml_str).map_err(|err| ConfigError::Parse(err.to_string()))?;

        let grid = GridConfig::try_from(&raw.grid)?;
        let intensity = IntensityConfig::try_from(&raw.intensity)?;
        let labels = LabelConfig::try_from(&raw.labels)?;
        let cohort = CohortConfig::try_from(&raw.cohort)?;
        let paths = PathConfig::from(&raw.paths);

        if labels.masks_per_volume > 1 && cohort.mode == LoadMode::Raw {
            return Err(ConfigError::Parse(
                "labels.masks_per_volume > 1 requires cohort.mode = \"cached\"".into(),
            ));
        }

        Ok(Self {
            grid,
            intensity,
            labels,
            cohort,
            paths,
        })
    }
}

/// Canonical voxel grid every record is brought onto.
#[derive(Debug, Clone, Serialize)]
pub struct GridConfig {
    /// Target voxel spacing in physical units
    pub target_spacing: [f64; 3],
    /// Fixed output shape; derived from the first accepted record when unset
    pub target_shape: Option<[usize; 3]>,
    /// Derived shapes are rounded to a multiple of this
    pub shape_multiple: usize,
    /// Canonical axis moved to the front to form slices
    pub slice_axis: usize,
}

impl GridConfig {
    fn try_from(raw: &RawGrid) -> Result<Self, ConfigError> {
        if raw
            .target_spacing
            .iter()
            .any(|s| !s.is_finite() || *s <= 0.0)
        {
            return Err(ConfigError::Parse(
                "grid.target_spacing must be three positive numbers".into(),
            ));
        }
        if let Some(shape) = raw.target_shape {
            if shape.iter().any(|&n| n == 0) {
                return Err(ConfigError::Parse(
                    "grid.target_shape must be non-zero on every axis".into(),
                ));
            }
        }
        if raw.shape_multiple == 0 {
            return Err(ConfigError::Parse("grid.shape_multiple must be non-zero".into()));
        }
        if raw.slice_axis > 2 {
            return Err(ConfigError::Parse("grid.slice_axis must be 0, 1 or 2".into()));
        }

        Ok(Self {
            target_spacing: raw.target_spacing,
            target_shape: raw.target_shape,
            shape_multiple: raw.shape_multiple,
            slice_axis: raw.slice_axis,
        })
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            target_spacing: default_target_spacing(),
            target_shape: None,
            shape_multiple: default_shape_multiple(),
            slice_axis: default_slice_axis(),
        }
    }
}

/// Intensity interpolation and normalization options.
#[derive(Debug, Clone, Serialize)]
pub struct IntensityConfig {
    pub interpolation: Interpolation,
    pub normalization: Normalization,
    pub histogram_matching: bool,
    /// Scan whose intensity distribution other volumes are matched to
    pub histogram_reference: Option<PathBuf>,
    /// Quantile points kept from the reference
    pub histogram_points: usize,
}

impl IntensityConfig {
    fn try_from(raw: &RawIntensity) -> Result<Self, ConfigError> {
        if raw.histogram_matching && raw.histogram_reference.is_none() {
            return Err(ConfigError::Parse(
                "intensity.histogram_matching needs intensity.histogram_reference".into(),
            ));
        }
        if raw.histogram_points < 2 {
            return Err(ConfigError::Parse(
                "intensity.histogram_points must be at least 2".into(),
            ));
        }

        Ok(Self {
            interpolation: raw.interpolation,
            normalization: raw.normalization,
            histogram_matching: raw.histogram_matching,
            histogram_reference: raw.histogram_reference.clone(),
            histogram_points: raw.histogram_points,
        })
    }
}

impl Default for IntensityConfig {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::default(),
            normalization: Normalization::default(),
            histogram_matching: false,
            histogram_reference: None,
            histogram_points: default_histogram_points(),
        }
    }
}

/// Class range and weighting options.
#[derive(Debug, Clone, Serialize)]
pub struct LabelConfig {
    /// Size of the dataset-wide class id range
    pub num_classes: usize,
    /// Annotation masks per record (greater than 1 only in cached mode)
    pub masks_per_volume: usize,
    pub remove_background_slices: bool,
    pub slice_weighting: SliceWeighting,
    pub absent_class_weight: AbsentClassWeight,
}

impl LabelConfig {
    fn try_from(raw: &RawLabels) -> Result<Self, ConfigError> {
        if raw.num_classes == 0 || raw.num_classes > usize::from(u16::MAX) + 1 {
            return Err(ConfigError::Parse(
                "labels.num_classes must be between 1 and 65536".into(),
            ));
        }
        if raw.masks_per_volume == 0 {
            return Err(ConfigError::Parse(
                "labels.masks_per_volume must be non-zero".into(),
            ));
        }

        Ok(Self {
            num_classes: raw.num_classes,
            masks_per_volume: raw.masks_per_volume,
            remove_background_slices: raw.remove_background_slices,
            slice_weighting: raw.slice_weighting,
            absent_class_weight: raw.absent_class_weight,
        })
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            masks_per_volume: 1,
            remove_background_slices: false,
            slice_weighting: SliceWeighting::default(),
            absent_class_weight: AbsentClassWeight::default(),
        }
    }
}

/// Where records come from and how a run is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Scan files with headers; the full geometry pipeline runs
    #[default]
    Raw,
    /// Arrays normalized by an earlier run; geometry and intensity stages are skipped
    Cached,
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortConfig {
    pub mode: LoadMode,
    /// Worker threads; 0 lets rayon decide
    pub workers: usize,
    pub persist_normalized: bool,
    /// Extension of persisted normalized files, selects the container format
    pub processed_extension: String,
    pub processed_volume_dir: PathBuf,
    pub processed_label_dir: PathBuf,
    /// Exclusion ledger carried across runs when set
    pub ledger_path: Option<PathBuf>,
    /// JSON-lines run log directory when set
    pub log_dir: Option<PathBuf>,
    pub dataset_dir: PathBuf,
}

impl CohortConfig {
    fn try_from(raw: &RawCohort) -> Result<Self, ConfigError> {
        if ScanFormat::from_extension(&raw.processed_extension).is_none() {
            return Err(ConfigError::Parse(format!(
                "cohort.processed_extension {:?} is not a supported scan format",
                raw.processed_extension
            )));
        }

        Ok(Self {
            mode: raw.mode,
            workers: raw.workers,
            persist_normalized: raw.persist_normalized,
            processed_extension: raw.processed_extension.clone(),
            processed_volume_dir: raw.processed_volume_dir.clone(),
            processed_label_dir: raw.processed_label_dir.clone(),
            ledger_path: raw.ledger_path.clone(),
            log_dir: raw.log_dir.clone(),
            dataset_dir: raw.dataset_dir.clone(),
        })
    }
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            mode: LoadMode::default(),
            workers: 0,
            persist_normalized: false,
            processed_extension: default_processed_extension(),
            processed_volume_dir: default_processed_volume_dir(),
            processed_label_dir: default_processed_label_dir(),
            ledger_path: None,
            log_dir: None,
            dataset_dir: default_dataset_dir(),
        }
    }
}

/// Path templates for raw scan discovery.
#[derive(Debug, Clone, Serialize)]
pub struct PathConfig {
    pub volume_template: String,
    pub label_template: String,
    pub data_dir: PathBuf,
    pub label_dir: PathBuf,
    pub modality: Option<String>,
}

impl From<&RawPaths> for PathConfig {
    fn from(raw: &RawPaths) -> Self {
        Self {
            volume_template: raw.volume_template.clone(),
            label_template: raw.label_template.clone(),
            data_dir: raw.data_dir.clone(),
            label_dir: raw.label_dir.clone(),
            modality: raw.modality.clone(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self::from(&RawPaths::default())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipelineConfig {
    #[serde(default)]
    grid: RawGrid,
    #[serde(default)]
    intensity: RawIntensity,
    #[serde(default)]
    labels: RawLabels,
    #[serde(default)]
    cohort: RawCohort,
    #[serde(default)]
    paths: RawPaths,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGrid {
    #[serde(default = "default_target_spacing")]
    target_spacing: [f64; 3],
    #[serde(default)]
    target_shape: Option<[usize; 3]>,
    #[serde(default = "default_shape_multiple")]
    shape_multiple: usize,
    #[serde(default = "default_slice_axis")]
    slice_axis: usize,
}

impl Default for RawGrid {
    fn default() -> Self {
        Self {
            target_spacing: default_target_spacing(),
            target_shape: None,
            shape_multiple: default_shape_multiple(),
            slice_axis: default_slice_axis(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawIntensity {
    #[serde(default)]
    interpolation: Interpolation,
    #[serde(default)]
    normalization: Normalization,
    #[serde(default)]
    histogram_matching: bool,
    #[serde(default)]
    histogram_reference: Option<PathBuf>,
    #[serde(default = "default_histogram_points")]
    histogram_points: usize,
}

impl Default for RawIntensity {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::default(),
            normalization: Normalization::default(),
            histogram_matching: false,
            histogram_reference: None,
            histogram_points: default_histogram_points(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLabels {
    #[serde(default = "default_num_classes")]
    num_classes: usize,
    #[serde(default = "default_masks_per_volume")]
    masks_per_volume: usize,
    #[serde(default)]
    remove_background_slices: bool,
    #[serde(default)]
    slice_weighting: SliceWeighting,
    #[serde(default)]
    absent_class_weight: AbsentClassWeight,
}

impl Default for RawLabels {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            masks_per_volume: default_masks_per_volume(),
            remove_background_slices: false,
            slice_weighting: SliceWeighting::default(),
            absent_class_weight: AbsentClassWeight::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCohort {
    #[serde(default)]
    mode: LoadMode,
    #[serde(default)]
    workers: usize,
    #[serde(default)]
    persist_normalized: bool,
    #[serde(default = "default_processed_extension")]
    processed_extension: String,
    #[serde(default = "default_processed_volume_dir")]
    processed_volume_dir: PathBuf,
    #[serde(default = "default_processed_label_dir")]
    processed_label_dir: PathBuf,
    #[serde(default)]
    ledger_path: Option<PathBuf>,
    #[serde(default)]
    log_dir: Option<PathBuf>,
    #[serde(default = "default_dataset_dir")]
    dataset_dir: PathBuf,
}

impl Default for RawCohort {
    fn default() -> Self {
        Self {
            mode: LoadMode::default(),
            workers: 0,
            persist_normalized: false,
            processed_extension: default_processed_extension(),
            processed_volume_dir: default_processed_volume_dir(),
            processed_label_dir: default_processed_label_dir(),
            ledger_path: None,
            log_dir: None,
            dataset_dir: default_dataset_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPaths {
    #[serde(default = "default_volume_template")]
    volume_template: String,
    #[serde(default = "default_label_template")]
    label_template: String,
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default = "default_label_dir")]
    label_dir: PathBuf,
    #[serde(default)]
    modality: Option<String>,
}

impl Default for RawPaths {
    fn default() -> Self {
        Self {
            volume_template: default_volume_template(),
            label_template: default_label_template(),
            data_dir: default_data_dir(),
            label_dir: default_label_dir(),
            modality: None,
        }
    }
}

fn default_target_spacing() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

fn default_shape_multiple() -> usize {
    8
}

fn default_slice_axis() -> usize {
    2
}

fn default_histogram_points() -> usize {
    1024
}

fn default_num_classes() -> usize {
    2
}

fn default_masks_per_volume() -> usize {
    1
}

fn default_processed_extension() -> String {
    ".nii.gz".to_string()
}

fn default_processed_volume_dir() -> PathBuf {
    PathBuf::from("processed/volume")
}

fn default_processed_label_dir() -> PathBuf {
    PathBuf::from("processed/label")
}

fn default_dataset_dir() -> PathBuf {
    PathBuf::from("dataset")
}

fn default_volume_template() -> String {
    "{data_dir}/{id}.nii.gz".to_string()
}

fn default_label_template() -> String {
    "{label_dir}/{id}.nii.gz".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_label_dir() -> PathBuf {
    PathBuf::from("label")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = PipelineConfig::from_str("").unwrap();
        assert_eq!(config.grid.target_spacing, [1.0, 1.0, 1.0]);
        assert_eq!(config.grid.shape_multiple, 8);
        assert_eq!(config.grid.slice_axis, 2);
        assert_eq!(config.intensity.interpolation, Interpolation::Cubic);
        assert_eq!(config.intensity.normalization, Normalization::MinMax);
        assert_eq!(config.labels.num_classes, 2);
        assert_eq!(config.cohort.mode, LoadMode::Raw);
        assert_eq!(config.cohort.processed_extension, ".nii.gz");
    }

    #[test]
    fn parses_every_section() {
        let toml = r#"
            [grid]
            target_spacing = [0.8, 0.8, 1.5]
            target_shape = [96, 96, 64]
            slice_axis = 1

            [intensity]
            interpolation = "linear"
            normalization = "z_score"

            [labels]
            num_classes = 9
            slice_weighting = "class_coverage"
            absent_class_weight = "max_observed"
            remove_background_slices = true

            [cohort]
            mode = "cached"
            workers = 4
            processed_extension = ".mgz"

            [paths]
            volume_template = "{data_dir}/{id}/{modality}.nii"
            modality = "opp"
        "#;
        let config = PipelineConfig::from_str(toml).unwrap();
        assert_eq!(config.grid.target_shape, Some([96, 96, 64]));
        assert_eq!(config.grid.slice_axis, 1);
        assert_eq!(config.intensity.interpolation, Interpolation::Linear);
        assert_eq!(config.intensity.normalization, Normalization::ZScore);
        assert_eq!(config.labels.num_classes, 9);
        assert_eq!(config.labels.slice_weighting, SliceWeighting::ClassCoverage);
        assert_eq!(config.labels.absent_class_weight, AbsentClassWeight::MaxObserved);
        assert!(config.labels.remove_background_slices);
        assert_eq!(config.cohort.mode, LoadMode::Cached);
        assert_eq!(config.cohort.workers, 4);
        assert_eq!(config.paths.modality.as_deref(), Some("opp"));
    }

    #[test]
    fn rejects_non_positive_spacing() {
        let err = PipelineConfig::from_str("[grid]\ntarget_spacing = [1.0, 0.0, 1.0]").unwrap_err();
        assert!(err.to_string().contains("target_spacing"));
    }

    #[test]
    fn histogram_matching_requires_reference() {
        let err = PipelineConfig::from_str("[intensity]\nhistogram_matching = true").unwrap_err();
        assert!(err.to_string().contains("histogram_reference"));
    }

    #[test]
    fn rejects_unknown_container_extension() {
        assert!(PipelineConfig::from_str("[cohort]\nprocessed_extension = \".h5\"").is_err());
    }

    #[test]
    fn multi_mask_requires_cached_mode() {
        assert!(PipelineConfig::from_str("[labels]\nmasks_per_volume = 3").is_err());
        let toml = "[labels]\nmasks_per_volume = 3\n[cohort]\nmode = \"cached\"";
        assert_eq!(PipelineConfig::from_str(toml).unwrap().labels.masks_per_volume, 3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PipelineConfig::from_str("[grid]\ntarget_spacin = [1.0, 1.0, 1.0]").is_err());
    }
}
