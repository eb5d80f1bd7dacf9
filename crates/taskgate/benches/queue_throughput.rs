//! Queue throughput benchmark
//!
//! Benchmarks the dispatch hot path: push → pop → ack on the in-memory store,
//! plus the admission check that precedes a push.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use taskgate::persistence::InMemoryDispatchStore;
use taskgate::{AdmissionController, DispatchConfig, Message, WorkQueue};

const QUEUE: &str = "bench_queue";

fn new_queue() -> WorkQueue {
    WorkQueue::new(
        Arc::new(InMemoryDispatchStore::new()),
        DispatchConfig::new().without_reaper(),
    )
}

/// Benchmark push of fresh messages
fn bench_push(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue/push");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        let queue = new_queue();
        let counter = AtomicU64::new(0);
        b.to_async(&rt).iter(|| async {
            let id = format!("m{}", counter.fetch_add(1, Ordering::Relaxed));
            queue.push(QUEUE, &id, 0, Duration::ZERO).await.unwrap();
        });
    });

    group.finish();
}

/// Benchmark single-consumer pop + ack (baseline)
fn bench_pop_ack(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue/pop_ack");
    group.throughput(Throughput::Elements(1));

    for batch_size in [1usize, 10, 50] {
        group.bench_with_input(
            BenchmarkId::new("batch", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let queue = new_queue();

                    let total = (iters * batch_size as u64).max(100);
                    let messages = (0..total).map(|i| Message::new(format!("m{}", i))).collect();
                    queue.push_batch(QUEUE, messages).await.unwrap();

                    let start = Instant::now();
                    let mut acked = 0u64;
                    while acked < total {
                        let ids = queue.pop(QUEUE, batch_size, Duration::ZERO).await.unwrap();
                        for id in ids {
                            queue.ack(QUEUE, &id).await.unwrap();
                            acked += 1;
                        }
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

/// Benchmark concurrent pollers racing on one queue
fn bench_concurrent_pollers(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("queue/concurrent");
    let total = 1000u64;
    group.throughput(Throughput::Elements(total));

    for pollers in [1, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("pollers", pollers),
            &pollers,
            |b, &pollers| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut elapsed = Duration::ZERO;

                    for _ in 0..iters {
                        let queue = Arc::new(new_queue());
                        let messages = (0..total).map(|i| Message::new(format!("m{}", i))).collect();
                        queue.push_batch(QUEUE, messages).await.unwrap();

                        let acked = Arc::new(AtomicU64::new(0));
                        let start = Instant::now();

                        let mut handles = Vec::new();
                        for _ in 0..pollers {
                            let queue = queue.clone();
                            let acked = acked.clone();
                            handles.push(tokio::spawn(async move {
                                while acked.load(Ordering::Relaxed) < total {
                                    let ids = queue.pop(QUEUE, 10, Duration::ZERO).await.unwrap();
                                    if ids.is_empty() {
                                        tokio::task::yield_now().await;
                                        continue;
                                    }
                                    for id in ids {
                                        queue.ack(QUEUE, &id).await.unwrap();
                                        acked.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                            }));
                        }

                        for handle in handles {
                            handle.await.unwrap();
                        }
                        elapsed += start.elapsed();
                    }

                    elapsed
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the admission check for a limited task type
fn bench_admit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("admission/admit");
    group.throughput(Throughput::Elements(1));

    for tracked in [10usize, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("tracked", tracked),
            &tracked,
            |b, &tracked| {
                let admission = AdmissionController::new(Arc::new(InMemoryDispatchStore::new()));
                rt.block_on(async {
                    for i in 0..tracked {
                        admission
                            .track("encode", &format!("t{}", i), "wf")
                            .await
                            .unwrap();
                    }
                });

                b.to_async(&rt).iter(|| async {
                    admission.admit("encode", "t0", 5).await.unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_push,
    bench_pop_ack,
    bench_concurrent_pollers,
    bench_admit,
);

criterion_main!(benches);
