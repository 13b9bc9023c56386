//! Cost of the UME feature matrix and of the criterion gradient as n grows.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{Array1, Array2};
use ume::{power_criterion_grad, DataSource, GaussianKernel, IsotropicNormal, Sample, UmeFeatures};

fn sample(n: usize, dim: usize, mean: f64, seed: u64) -> Sample {
    IsotropicNormal::new(Array1::from_elem(dim, mean), 1.0)
        .unwrap()
        .sample(n, seed)
        .unwrap()
}

fn bench_features(c: &mut Criterion) {
    let mut group = c.benchmark_group("ume_features");
    let dim = 16;
    let kernel = GaussianKernel::new(dim as f64).unwrap();
    let locations = Array2::from_shape_fn((5, dim), |(i, j)| 0.1 * (i + j) as f64);

    for n in [256usize, 1024, 4096] {
        let x = sample(n, dim, 0.3, 1);
        let z = sample(n, dim, 0.0, 2);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("features", n), &n, |b, _| {
            b.iter(|| {
                let f = UmeFeatures::new(&x, &z, locations.view(), &kernel).unwrap();
                black_box(f.ume_squared())
            })
        });
    }
    group.finish();
}

fn bench_criterion_grad(c: &mut Criterion) {
    let mut group = c.benchmark_group("criterion_grad");
    let dim = 4;
    let locations = Array2::from_shape_fn((2, dim), |(i, j)| 0.2 * i as f64 - 0.1 * j as f64);

    for n in [128usize, 512, 2048] {
        let p = sample(n, dim, 0.4, 1);
        let q = sample(n, dim, 0.2, 2);
        let r = sample(n, dim, 0.0, 3);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("tape", n), &n, |b, _| {
            b.iter(|| {
                black_box(power_criterion_grad(&p, &q, &r, 2.0, locations.view(), 1e-3).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_features, bench_criterion_grad);
criterion_main!(benches);
