use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use parallel_tx::handle::{MemoryHandle, MemoryHandleProvider};
use parallel_tx::{BatchCoordinator, FailurePolicy, RunOptions, UnitOfWorkFuture};
use tokio::runtime::Runtime;

fn add_one(item: u64, _tx: &mut MemoryHandle) -> UnitOfWorkFuture<'_, u64> {
    Box::pin(async move { Ok(item + 1) })
}

fn fail_every_tenth(item: u64, _tx: &mut MemoryHandle) -> UnitOfWorkFuture<'_, u64> {
    Box::pin(async move {
        if item % 10 == 0 {
            anyhow::bail!("item {} rejected", item);
        }
        Ok(item)
    })
}

fn benchmark_unbounded_run(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("run_100_items_unbounded", |b| {
        b.iter(|| {
            rt.block_on(async {
                let coordinator = BatchCoordinator::new(MemoryHandleProvider::new());
                let values = coordinator
                    .run((0..100).collect(), add_one, RunOptions::default())
                    .await
                    .unwrap();
                black_box(values)
            })
        })
    });
}

fn benchmark_chunked_run(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("chunked_run");

    for limit in [1usize, 8, 32, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(limit), &limit, |b, &limit| {
            b.iter(|| {
                rt.block_on(async {
                    let coordinator = BatchCoordinator::new(MemoryHandleProvider::new());
                    let values = coordinator
                        .run(
                            (0..256).collect(),
                            add_one,
                            RunOptions::new().with_max_concurrency(limit),
                        )
                        .await
                        .unwrap();
                    black_box(values)
                })
            })
        });
    }

    group.finish();
}

fn benchmark_retain_successful(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("retain_successful_with_failures", |b| {
        b.iter(|| {
            rt.block_on(async {
                let coordinator = BatchCoordinator::new(MemoryHandleProvider::new());
                let report = coordinator
                    .run_report(
                        (0..100).collect(),
                        fail_every_tenth,
                        RunOptions::new()
                            .with_max_concurrency(16)
                            .with_failure_policy(FailurePolicy::RetainSuccessful),
                    )
                    .await
                    .unwrap();
                black_box(report.stats)
            })
        })
    });
}

criterion_group!(
    benches,
    benchmark_unbounded_run,
    benchmark_chunked_run,
    benchmark_retain_successful
);

criterion_main!(benches);
