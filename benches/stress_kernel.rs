use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cpu_tuner::stress::run_kernel_batch;

fn bench_kernel_batch(c: &mut Criterion) {
    c.bench_function("stress_kernel_batch_100k", |b| {
        b.iter(|| run_kernel_batch(black_box(1.0), black_box(100_000)));
    });
}

criterion_group!(benches, bench_kernel_batch);
criterion_main!(benches);
