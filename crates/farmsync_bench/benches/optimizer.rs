//! Queue optimizer benchmarks.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use farmsync_bench::{generate_tasks, task};
use farmsync_core::optimizer::optimize;
use farmsync_core::{OptimizationPolicy, QueueEntry};
use std::collections::VecDeque;

fn queue(len: usize, keys: usize) -> VecDeque<QueueEntry> {
    generate_tasks(len, keys, 128)
        .into_iter()
        .map(|t| QueueEntry::pending(t, false))
        .collect()
}

/// Benchmark one incoming task against queues of growing length.
fn bench_policies(c: &mut Criterion) {
    let policies = [
        ("none", OptimizationPolicy::None),
        ("drop_superseded", OptimizationPolicy::DropSuperseded),
        ("group_by_key", OptimizationPolicy::GroupByKey),
    ];

    for (name, policy) in policies {
        let mut group = c.benchmark_group(format!("optimize_{name}"));

        for len in [100, 1_000, 10_000].iter() {
            group.throughput(Throughput::Elements(*len as u64));
            group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, &len| {
                let incoming = task(len as u64 + 1, "cms.document.upsert", "cms.document", "node-7", 128);
                b.iter_batched(
                    || queue(len, 64),
                    |mut entries| {
                        let outcome = optimize(
                            &mut entries,
                            black_box(&incoming),
                            policy,
                            |_, later| later.payload.clone(),
                        );
                        black_box(outcome);
                    },
                    BatchSize::SmallInput,
                );
            });
        }

        group.finish();
    }
}

/// Benchmark a burst of invalidations on a handful of keys.
fn bench_invalidation_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("invalidation_burst");

    for burst in [100, 1_000].iter() {
        group.throughput(Throughput::Elements(*burst as u64));
        group.bench_with_input(BenchmarkId::from_parameter(burst), burst, |b, &burst| {
            let tasks: Vec<_> = (0..burst)
                .map(|i| {
                    let key = format!("cache-{}", i % 4);
                    task(i as u64 + 1, "cache.invalidate", "cache", &key, 0)
                })
                .collect();

            b.iter(|| {
                let mut entries = VecDeque::new();
                for t in &tasks {
                    optimize(&mut entries, t, OptimizationPolicy::DropSuperseded, |_, later| {
                        later.payload.clone()
                    });
                    entries.push_back(QueueEntry::pending(t.clone(), false));
                }
                black_box(entries.len());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_policies, bench_invalidation_burst);
criterion_main!(benches);
