use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::hint::black_box;

use fastgate::routing::pick_weighted;

fn bench_pick_weighted(c: &mut Criterion) {
    let mut group = c.benchmark_group("pick_weighted");
    for size in [2usize, 16, 128] {
        let weights: Vec<u32> = (0..size).map(|i| (i % 5) as u32).collect();
        let mut rng = StdRng::seed_from_u64(42);
        group.bench_with_input(BenchmarkId::from_parameter(size), &weights, |b, weights| {
            b.iter(|| pick_weighted(black_box(weights), |w| *w, &mut rng))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pick_weighted);
criterion_main!(benches);
