//! Performance benchmarks for resampling and weighting
//!
//! Run with: cargo bench --bench resample_benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segprep_core::pipeline::resample::{resample_volume, resize_nearest};
use segprep_core::pipeline::weights::WeightEstimator;
use segprep_core::{AbsentClassWeight, Interpolation, Labels, SliceWeighting};

fn random_volume(n: usize) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(17);
    Array3::from_shape_fn((n, n, n), |_| rng.gen_range(0.0..1000.0))
}

fn block_labels(n: usize) -> Array3<u16> {
    Array3::from_shape_fn((n, n, n), |(i, j, k)| {
        let mid = |x: usize| x > n / 4 && x < 3 * n / 4;
        u16::from(mid(i) && mid(j) && mid(k)) + u16::from(mid(i) && k > n / 2)
    })
}

/// Anisotropic volume onto isotropic spacing, per kernel
fn bench_resample_kernels(c: &mut Criterion) {
    let volume = random_volume(64);
    let mut group = c.benchmark_group("resample_volume");
    for interpolation in [Interpolation::Nearest, Interpolation::Linear, Interpolation::Cubic] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{interpolation:?}")),
            &interpolation,
            |b, &interpolation| {
                b.iter(|| {
                    black_box(
                        resample_volume(volume.view(), [1.0, 1.0, 2.0], [1.0, 1.0, 1.0], interpolation)
                            .unwrap(),
                    )
                });
            },
        );
    }
    group.finish();
}

/// Nearest-neighbour label gather at several sizes
fn bench_label_resize(c: &mut Criterion) {
    let mut group = c.benchmark_group("resize_nearest");
    for n in [32usize, 64, 96] {
        let labels = block_labels(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &labels, |b, labels| {
            b.iter(|| black_box(resize_nearest(labels.view(), [n, n, 2 * n]).unwrap()));
        });
    }
    group.finish();
}

fn bench_weights(c: &mut Criterion) {
    let labels = Labels::Single(block_labels(96));
    let estimator = WeightEstimator::new(3, SliceWeighting::ForegroundFraction, AbsentClassWeight::Zero);
    c.bench_function("estimate_weights_96", |b| {
        b.iter(|| black_box(estimator.estimate(&labels).unwrap()));
    });
}

criterion_group!(benches, bench_resample_kernels, bench_label_resize, bench_weights);

criterion_main!(benches);
