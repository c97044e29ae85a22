//! End-to-end behaviour of the per-record pipeline on synthetic subjects.

mod common;

use std::sync::Arc;

use common::{add_subject, axis_aligned, config, synthetic_labels, synthetic_volume, MemoryIo};
use ndarray::Axis;
use segprep_core::{
    CancellationToken, CohortRecord, Interpolation, Labels, Normalization, Pipeline,
    PipelineError,
};

fn pipeline(io: &Arc<MemoryIo>, config: &segprep_core::PipelineConfig) -> Pipeline {
    Pipeline::new(config, io.clone(), io.clone()).unwrap()
}

#[test]
fn test_anisotropic_subject_lands_on_isotropic_slice_major_grid() {
    let io = MemoryIo::new();
    let record = add_subject(&io, "aniso", 7, (64, 64, 64), [1.0, 1.0, 2.0]);
    let config = config(3);
    let pipeline = pipeline(&io, &config);

    let out = pipeline.process(&record, &CancellationToken::new()).unwrap();

    assert_eq!(pipeline.grid().shape(), Some([64, 64, 128]));
    assert_eq!(out.shape(), [128, 64, 64]);
    assert_eq!(out.labels.spatial_shape(), [128, 64, 64]);
    assert_eq!(out.slice_weights.len(), 128);
    assert_eq!(out.class_weights.len(), 3);
    assert!(out.labels.max_label().unwrap() <= 2);
    assert!(out.volume.iter().all(|&v| (0.0..=1.0).contains(&v)));
}

#[test]
fn test_labels_stay_within_the_original_class_set() {
    let io = MemoryIo::new();
    let record = add_subject(&io, "lin", 3, (20, 24, 10), [1.5, 1.0, 2.5]);
    let mut config = config(3);
    config.intensity.interpolation = Interpolation::Linear;
    let out = pipeline(&io, &config)
        .process(&record, &CancellationToken::new())
        .unwrap();

    let Labels::Single(labels) = &out.labels else {
        panic!("raw records carry a single label map");
    };
    assert!(labels.iter().all(|&l| l <= 2));
    assert!(labels.iter().any(|&l| l == 2));
    assert!(labels.iter().any(|&l| l == 1));
}

#[test]
fn test_zscore_output_is_centred() {
    let io = MemoryIo::new();
    let record = add_subject(&io, "z", 11, (16, 16, 16), [1.0, 1.0, 1.0]);
    let mut config = config(3);
    config.intensity.normalization = Normalization::ZScore;
    let out = pipeline(&io, &config)
        .process(&record, &CancellationToken::new())
        .unwrap();

    let n = out.volume.len() as f64;
    let mean = out.volume.sum() / n;
    let var = out.volume.mapv(|v| (v - mean).powi(2)).sum() / n;
    assert!(mean.abs() < 1e-9);
    assert!((var.sqrt() - 1.0).abs() < 1e-9);
}

#[test]
fn test_processing_is_deterministic() {
    let run = || {
        let io = MemoryIo::new();
        let record = add_subject(&io, "det", 42, (24, 20, 12), [1.0, 1.2, 2.0]);
        pipeline(&io, &config(3))
            .process(&record, &CancellationToken::new())
            .unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(first.volume, second.volume);
    assert_eq!(first.labels, second.labels);
    assert_eq!(first.slice_weights, second.slice_weights);
    assert_eq!(first.class_weights, second.class_weights);
    assert_eq!(first.affine, second.affine);
}

#[test]
fn test_frozen_grid_applies_to_later_subjects() {
    let io = MemoryIo::new();
    let first = add_subject(&io, "first", 1, (16, 16, 16), [1.0, 1.0, 1.0]);
    let second = add_subject(&io, "second", 2, (20, 14, 18), [1.0, 1.0, 1.0]);
    let pipeline = pipeline(&io, &config(3));
    let cancel = CancellationToken::new();

    let a = pipeline.process(&first, &cancel).unwrap();
    let b = pipeline.process(&second, &cancel).unwrap();
    assert_eq!(a.shape(), b.shape());
    assert_eq!(b.labels.spatial_shape(), b.shape());
}

#[test]
fn test_trimming_keeps_only_annotated_slices() {
    let io = MemoryIo::new();
    let record = add_subject(&io, "trim", 5, (16, 16, 16), [1.0, 1.0, 1.0]);
    let mut config = config(3);
    config.labels.remove_background_slices = true;
    let out = pipeline(&io, &config)
        .process(&record, &CancellationToken::new())
        .unwrap();

    let Labels::Single(labels) = &out.labels else {
        panic!("raw records carry a single label map");
    };
    assert!(out.shape()[0] < 16);
    for slice in labels.axis_iter(Axis(0)) {
        assert!(slice.iter().any(|&l| l != 0));
    }
}

#[test]
fn test_missing_label_file_is_reported() {
    let io = MemoryIo::new();
    let mut record = add_subject(&io, "nolabel", 9, (8, 8, 8), [1.0, 1.0, 1.0]);
    record.labels = segprep_core::LabelSource::Single("mem/label/absent.nii.gz".into());
    let err = pipeline(&io, &config(3))
        .process(&record, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, PipelineError::SourceNotFound { .. }));
}

#[test]
fn test_out_of_range_label_is_rejected() {
    let io = MemoryIo::new();
    let record = add_subject(&io, "range", 4, (12, 12, 12), [1.0, 1.0, 1.0]);
    let err = pipeline(&io, &config(2))
        .process(&record, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, PipelineError::LabelOutOfRange { .. }));
}

#[test]
fn test_cancelled_token_stops_before_loading() {
    let io = MemoryIo::new();
    let record = add_subject(&io, "stop", 6, (8, 8, 8), [1.0, 1.0, 1.0]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = pipeline(&io, &config(3)).process(&record, &cancel).unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
}

#[test]
fn test_failed_record_leaves_grid_unfrozen() {
    let io = MemoryIo::new();
    let record = add_subject(&io, "range", 4, (12, 12, 12), [1.0, 1.0, 1.0]);
    let pipeline = pipeline(&io, &config(2));
    assert!(pipeline.process(&record, &CancellationToken::new()).is_err());
    assert!(!pipeline.grid().is_frozen());
}

#[test]
fn test_volume_and_labels_on_different_grids_are_reconciled() {
    let io = MemoryIo::new();
    io.insert(
        "mem/data/mixed.nii.gz",
        synthetic_volume(8, (32, 32, 16)).into_dyn(),
        axis_aligned([1.0, 1.0, 2.0], (32, 32, 16)),
    );
    io.insert(
        "mem/label/mixed.nii.gz",
        synthetic_labels((32, 32, 32)).into_dyn(),
        axis_aligned([1.0, 1.0, 1.0], (32, 32, 32)),
    );
    let record = CohortRecord::new("mixed", "mem/data/mixed.nii.gz", "mem/label/mixed.nii.gz");
    let pipeline = pipeline(&io, &config(3));

    let out = pipeline.process(&record, &CancellationToken::new()).unwrap();

    assert_eq!(pipeline.grid().shape(), Some([32, 32, 32]));
    assert_eq!(out.shape(), [32, 32, 32]);
    assert_eq!(out.labels.spatial_shape(), out.shape());
    let Labels::Single(labels) = &out.labels else {
        panic!("raw records carry a single label map");
    };
    assert!(labels.iter().all(|&l| l <= 2));
    assert!(labels.iter().any(|&l| l == 2));
}
