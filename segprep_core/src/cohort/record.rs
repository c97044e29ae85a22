//! Cohort records and their resolution from subject ids.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::ledger::ExclusionLedger;
use crate::config::{LoadMode, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::io::{ScanFormat, NPZ_EXTENSION};

/// Where the annotation of a record lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSource {
    Single(PathBuf),
    /// One file per annotation mask, in mask order
    Stacked(Vec<PathBuf>),
}

/// One subject of a cohort run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortRecord {
    pub id: String,
    pub volume: PathBuf,
    pub labels: LabelSource,
}

impl CohortRecord {
    pub fn new(id: impl Into<String>, volume: impl Into<PathBuf>, label: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            volume: volume.into(),
            labels: LabelSource::Single(label.into()),
        }
    }

    pub fn stacked(id: impl Into<String>, volume: impl Into<PathBuf>, masks: Vec<PathBuf>) -> Self {
        Self {
            id: id.into(),
            volume: volume.into(),
            labels: LabelSource::Stacked(masks),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unbalanced brace at byte {position} in template {template:?}")]
    Unbalanced { template: String, position: usize },
    #[error("empty placeholder in template {template:?}")]
    EmptyPlaceholder { template: String },
    #[error("unknown placeholder {{{name}}} in template {template:?}")]
    UnknownPlaceholder { template: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Path pattern with named `{placeholder}` slots.
///
/// `{{` and `}}` produce literal braces. Substitution is purely textual;
/// nothing in a template is ever evaluated.
///
/// ```
/// use std::collections::BTreeMap;
/// use segprep_core::cohort::PathTemplate;
///
/// let template = PathTemplate::parse("{data_dir}/{id}.nii.gz").unwrap();
/// let mut values = BTreeMap::new();
/// values.insert("data_dir".to_string(), "/scans".to_string());
/// values.insert("id".to_string(), "case_7".to_string());
/// assert_eq!(template.render(&values).unwrap().to_str(), Some("/scans/case_7.nii.gz"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((position, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, n) in chars.by_ref() {
                        match n {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => break,
                            other => name.push(other),
                        }
                    }
                    if !closed {
                        return Err(TemplateError::Unbalanced {
                            template: template.to_string(),
                            position,
                        });
                    }
                    let name = name.trim().to_string();
                    if name.is_empty() {
                        return Err(TemplateError::EmptyPlaceholder {
                            template: template.to_string(),
                        });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name));
                }
                '}' => {
                    return Err(TemplateError::Unbalanced {
                        template: template.to_string(),
                        position,
                    })
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Fail if any placeholder is not one of `known`.
    pub fn check_placeholders<'a>(
        &self,
        known: impl IntoIterator<Item = &'a str> + Clone,
    ) -> Result<(), TemplateError> {
        for name in self.placeholders() {
            if !known.clone().into_iter().any(|k| k == name) {
                return Err(self.unknown(name));
            }
        }
        Ok(())
    }

    pub fn render(&self, values: &BTreeMap<String, String>) -> Result<PathBuf, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = values.get(name).ok_or_else(|| self.unknown(name))?;
                    out.push_str(value);
                }
            }
        }
        Ok(PathBuf::from(out))
    }

    fn unknown(&self, name: &str) -> TemplateError {
        TemplateError::UnknownPlaceholder {
            template: self.source.clone(),
            name: name.to_string(),
        }
    }
}

/// Builds [`CohortRecord`]s for subject ids according to the configured mode.
#[derive(Debug, Clone)]
pub struct CohortResolver {
    mode: LoadMode,
    volume_template: PathTemplate,
    label_template: PathTemplate,
    values: BTreeMap<String, String>,
    processed_volume_dir: PathBuf,
    processed_label_dir: PathBuf,
    processed_extension: String,
    masks_per_volume: usize,
}

impl CohortResolver {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, TemplateError> {
        Self::with_values(config, std::iter::empty::<(String, String)>())
    }

    /// Like [`CohortResolver::from_config`], with extra caller-defined placeholders.
    pub fn with_values<I, K, V>(config: &PipelineConfig, extra: I) -> Result<Self, TemplateError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut values: BTreeMap<String, String> = extra
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        values.insert(
            "data_dir".to_string(),
            config.paths.data_dir.to_string_lossy().into_owned(),
        );
        values.insert(
            "label_dir".to_string(),
            config.paths.label_dir.to_string_lossy().into_owned(),
        );
        if let Some(modality) = &config.paths.modality {
            values.insert("modality".to_string(), modality.clone());
        }

        let resolver = Self {
            mode: config.cohort.mode,
            volume_template: PathTemplate::parse(&config.paths.volume_template)?,
            label_template: PathTemplate::parse(&config.paths.label_template)?,
            values,
            processed_volume_dir: config.cohort.processed_volume_dir.clone(),
            processed_label_dir: config.cohort.processed_label_dir.clone(),
            processed_extension: config.cohort.processed_extension.clone(),
            masks_per_volume: config.labels.masks_per_volume,
        };
        if resolver.mode == LoadMode::Raw {
            resolver.check_templates()?;
        }
        Ok(resolver)
    }

    fn check_templates(&self) -> Result<(), TemplateError> {
        let known = self
            .values
            .keys()
            .map(String::as_str)
            .chain(std::iter::once("id"));
        self.volume_template.check_placeholders(known.clone())?;
        self.label_template.check_placeholders(known)
    }

    pub fn record_for(&self, id: &str) -> Result<CohortRecord, TemplateError> {
        match self.mode {
            LoadMode::Raw => {
                let mut values = self.values.clone();
                values.insert("id".to_string(), id.to_string());
                Ok(CohortRecord::new(
                    id,
                    self.volume_template.render(&values)?,
                    self.label_template.render(&values)?,
                ))
            }
            LoadMode::Cached => {
                let ext = &self.processed_extension;
                let volume = self.processed_volume_dir.join(format!("{id}{ext}"));
                if self.masks_per_volume > 1 {
                    let masks = (0..self.masks_per_volume)
                        .map(|k| self.processed_label_dir.join(format!("{id}_mask_{k}{ext}")))
                        .collect();
                    Ok(CohortRecord::stacked(id, volume, masks))
                } else {
                    let label = self.processed_label_dir.join(format!("{id}{ext}"));
                    Ok(CohortRecord::new(id, volume, label))
                }
            }
        }
    }

    /// Records for `ids`, skipping ids the ledger already excludes.
    pub fn resolve<S: AsRef<str>>(
        &self,
        ids: &[S],
        ledger: &ExclusionLedger,
    ) -> Result<Vec<CohortRecord>, TemplateError> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids.iter().map(AsRef::as_ref) {
            if ledger.contains(id) {
                tracing::info!(record = id, "skipping id listed in the exclusion ledger");
                continue;
            }
            records.push(self.record_for(id)?);
        }
        Ok(records)
    }
}

/// Newline-delimited id list; blank lines are ignored.
pub fn read_id_file<P: AsRef<Path>>(path: P) -> PipelineResult<Vec<String>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|err| PipelineError::io(path, err))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Subject ids from a directory listing, sorted, with known file suffixes stripped.
pub fn list_ids<P: AsRef<Path>>(dir: P) -> PipelineResult<Vec<String>> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir).map_err(|err| PipelineError::io(dir, err))?;
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PipelineError::io(dir, err))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        ids.push(strip_known_suffix(&name).to_string());
    }
    ids.sort();
    ids.dedup();
    Ok(ids)
}

fn strip_known_suffix(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    let suffix_len = ScanFormat::from_path(Path::new(&lower))
        .map(|format| format.extension().len())
        .or_else(|| lower.ends_with(NPZ_EXTENSION).then_some(NPZ_EXTENSION.len()));
    match suffix_len {
        Some(len) => &name[..name.len() - len],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_named_placeholders() {
        let template = PathTemplate::parse("{data_dir}/{id}/{modality}_{id}.nii").unwrap();
        let path = template
            .render(&values(&[("data_dir", "/d"), ("id", "s1"), ("modality", "fat")]))
            .unwrap();
        assert_eq!(path, PathBuf::from("/d/s1/fat_s1.nii"));
    }

    #[test]
    fn doubled_braces_are_literal() {
        let template = PathTemplate::parse("{{raw}}/{id}").unwrap();
        assert_eq!(
            template.render(&values(&[("id", "x")])).unwrap(),
            PathBuf::from("{raw}/x")
        );
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(matches!(
            PathTemplate::parse("{data_dir/{id}"),
            Err(TemplateError::Unbalanced { .. })
        ));
        assert!(matches!(
            PathTemplate::parse("a}b"),
            Err(TemplateError::Unbalanced { .. })
        ));
        assert!(matches!(
            PathTemplate::parse("{}"),
            Err(TemplateError::EmptyPlaceholder { .. })
        ));
    }

    #[test]
    fn missing_value_is_unknown_placeholder() {
        let template = PathTemplate::parse("{nope}/{id}").unwrap();
        let err = template.render(&values(&[("id", "x")])).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownPlaceholder { ref name, .. } if name == "nope"));
    }

    #[test]
    fn resolver_checks_templates_up_front() {
        let mut config = PipelineConfig::default();
        config.paths.volume_template = "{data_dir}/{modality}/{id}.nii".into();
        assert!(CohortResolver::from_config(&config).is_err());
        config.paths.modality = Some("water".into());
        let resolver = CohortResolver::from_config(&config).unwrap();
        let record = resolver.record_for("k7").unwrap();
        assert_eq!(record.volume, PathBuf::from("data/water/k7.nii"));
        assert_eq!(record.labels, LabelSource::Single(PathBuf::from("label/k7.nii.gz")));
    }

    #[test]
    fn caller_placeholders_are_known_to_the_check() {
        let mut config = PipelineConfig::default();
        config.paths.volume_template = "{data_dir}/{site}/{id}.nii".into();
        assert!(CohortResolver::from_config(&config).is_err());
        let resolver = CohortResolver::with_values(&config, [("site", "north")]).unwrap();
        assert_eq!(
            resolver.record_for("q1").unwrap().volume,
            PathBuf::from("data/north/q1.nii")
        );
    }

    #[test]
    fn cached_multi_mask_paths() {
        let mut config = PipelineConfig::default();
        config.cohort.mode = LoadMode::Cached;
        config.cohort.processed_extension = ".mgz".into();
        config.labels.masks_per_volume = 2;
        let record = CohortResolver::from_config(&config)
            .unwrap()
            .record_for("v3")
            .unwrap();
        assert_eq!(record.volume, PathBuf::from("processed/volume/v3.mgz"));
        assert_eq!(
            record.labels,
            LabelSource::Stacked(vec![
                PathBuf::from("processed/label/v3_mask_0.mgz"),
                PathBuf::from("processed/label/v3_mask_1.mgz"),
            ])
        );
    }

    #[test]
    fn resolve_skips_excluded_ids() {
        let resolver = CohortResolver::from_config(&PipelineConfig::default()).unwrap();
        let mut ledger = ExclusionLedger::new();
        ledger.record_reason("b", "source_not_found", "missing");
        let records = resolver.resolve(&["a", "b", "c"], &ledger).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn id_sources() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("train.txt");
        fs::write(&list, "a1\n\n  b2 \nc3\n").unwrap();
        assert_eq!(read_id_file(&list).unwrap(), vec!["a1", "b2", "c3"]);

        let scans = dir.path().join("scans");
        fs::create_dir(&scans).unwrap();
        for name in ["s2.nii.gz", "s1.mgz", "s3.npz"] {
            fs::write(scans.join(name), b"").unwrap();
        }
        assert_eq!(list_ids(&scans).unwrap(), vec!["s1", "s2", "s3"]);
    }
}
