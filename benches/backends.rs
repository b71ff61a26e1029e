//! Backend benchmarks: every available method, end to end and kernel only
//!
//! - `avg_distance`: full query (parse, morsels, bridge, AVG) per method
//! - `kernel`: one batch straight through each batch-shaped kernel
//!
//! Compiled backends are warmed up once so the artifact cache is hot.
//!
//! Run with: cargo bench --bench backends

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use haversine_udf::backend::{ColumnBatch, Method};
use haversine_udf::session::Session;
use haversine_udf::storage::StorageEngine;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SMALL_SIZE: usize = 10_000;
const LARGE_SIZE: usize = 1_000_000;

fn columns(rows: usize) -> [Vec<f64>; 4] {
    let mut rng = StdRng::seed_from_u64(42);
    let mut column = |lo: f64, hi: f64| (0..rows).map(|_| rng.gen_range(lo..hi)).collect::<Vec<f64>>();
    [column(-180.0, 180.0), column(-90.0, 90.0), column(-180.0, 180.0), column(-90.0, 90.0)]
}

fn bench_avg_distance(c: &mut Criterion) {
    let mut group = c.benchmark_group("avg_distance");
    group.sample_size(20);
    let session = Session::builder().build();

    for rows in [SMALL_SIZE, LARGE_SIZE] {
        let [x0, y0, x1, y1] = columns(rows);
        let storage = StorageEngine::from_columns(x0, y0, x1, y1).unwrap();
        group.throughput(Throughput::Elements(rows as u64));

        for method in session.available_methods() {
            session.calc(method.as_str(), &storage).unwrap();
            group.bench_with_input(BenchmarkId::new(method.as_str(), rows), &storage, |b, storage| {
                b.iter(|| session.calc(black_box(method.as_str()), black_box(storage)).unwrap());
            });
        }
    }

    group.finish();
}

fn bench_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernel");
    let session = Session::builder().build();
    let [x0, y0, x1, y1] = columns(LARGE_SIZE);
    let batch = ColumnBatch::try_new(&x0, &y0, &x1, &y1).unwrap();
    let mut out = vec![0.0; LARGE_SIZE];
    group.throughput(Throughput::Elements(LARGE_SIZE as u64));

    for method in session.available_methods() {
        if *method == Method::Sql {
            continue;
        }
        let kernel = session.registry().kernel(*method).unwrap();
        kernel.compute(&batch, &mut out).unwrap();
        group.bench_function(method.as_str(), |b| {
            b.iter(|| kernel.compute(black_box(&batch), black_box(&mut out)).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_avg_distance, bench_kernels);
criterion_main!(benches);
