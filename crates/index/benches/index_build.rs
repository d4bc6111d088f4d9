//! K-means and IVF-PQ build benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use wikivec_index::{kmeans, IvfPqBuilder, IvfPqConfig};

fn random_vectors(count: usize, dim: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(17);
    let normal = Normal::new(0.0f32, 1.0).unwrap();
    (0..count * dim).map(|_| normal.sample(&mut rng)).collect()
}

fn bench_kmeans(c: &mut Criterion) {
    let mut group = c.benchmark_group("kmeans");
    group.sample_size(10);

    for (num_vectors, k) in [(5_000, 64), (10_000, 256)] {
        let dim = 384;
        let vectors = random_vectors(num_vectors, dim);

        group.throughput(Throughput::Elements(num_vectors as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("k={}", k), num_vectors),
            &vectors,
            |bench, vectors| {
                bench.iter(|| {
                    let mut rng = StdRng::seed_from_u64(42);
                    kmeans(black_box(vectors), dim, k, 10, &mut rng)
                })
            },
        );
    }

    group.finish();
}

fn bench_ivf_pq_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("ivf_pq_build");
    group.sample_size(10);

    for num_vectors in [2_000, 10_000] {
        let dim = 384;
        let vectors = random_vectors(num_vectors, dim);
        let builder = IvfPqBuilder::new(IvfPqConfig::default());

        group.throughput(Throughput::Elements(num_vectors as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_vectors),
            &vectors,
            |bench, vectors| {
                bench.iter(|| {
                    let mut rng = StdRng::seed_from_u64(42);
                    builder.build(black_box(vectors), dim, &mut rng)
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_kmeans, bench_ivf_pq_build);
criterion_main!(benches);
