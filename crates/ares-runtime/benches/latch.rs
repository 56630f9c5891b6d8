//! Latch and pool dispatch benchmarks for ares-runtime.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use aresruntime::{Latch, Runtime, RuntimeConfig, ThreadPool};

fn bench_latch_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("latch_round_trip");
    let pool = ThreadPool::with_workers(4);

    group.bench_function("single_unit", |b| {
        b.iter(|| {
            let latch = Arc::new(Latch::new(1));
            let latch2 = Arc::clone(&latch);
            pool.execute(move || latch2.count_down());
            latch.wait();
        })
    });

    group.finish();
}

fn bench_parallel_for(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_for");
    let rt = Runtime::with_config(RuntimeConfig::new().with_workers(4));

    for n in [16u32, 256, 4096].iter() {
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::new("noop_body", n), n, |b, &n| {
            b.iter(|| {
                rt.parallel_for(0..n, |i| {
                    black_box(i);
                });
            })
        });
    }

    group.finish();
}

fn bench_spawn_future(c: &mut Criterion) {
    let rt = Runtime::with_config(RuntimeConfig::new().with_workers(4));

    c.bench_function("spawn_and_wait", |b| {
        b.iter(|| {
            let future = rt.spawn(|| black_box(21) * 2);
            future.wait().unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_latch_round_trip,
    bench_parallel_for,
    bench_spawn_future
);
criterion_main!(benches);
