//! Task claiming benchmark
//!
//! Benchmarks the critical path: insert -> next_ready_task -> claim_task -> release.
//! This is the core scheduling performance metric for the in-memory store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use orchestrator_store::{ClaimOutcome, InMemoryTaskStore, NewTask, TaskStore};

fn new_task(key: String, phase: i32, sequence: i32) -> NewTask {
    NewTask {
        task_key: key,
        title: "bench task".into(),
        goal: "bench".into(),
        phase,
        sequence,
        spec_id: None,
        test_file: None,
        impl_file: None,
        verify_command: None,
        done_criteria: None,
        acceptance_criteria: vec![],
        module_exports: vec![],
        depends_on: vec![],
    }
}

/// Single-worker claim loop (baseline, no contention).
fn bench_claim_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/single");
    group.throughput(Throughput::Elements(1));

    for task_count in [10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("tasks", task_count),
            &task_count,
            |b, &task_count| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let store = Arc::new(InMemoryTaskStore::new());
                    for i in 0..task_count {
                        store
                            .insert_task(new_task(format!("T-{i}"), 0, i as i32))
                            .await
                            .unwrap();
                    }

                    let start = std::time::Instant::now();
                    for _ in 0..iters {
                        let Some(task) = store.next_ready_task().await.unwrap() else {
                            break;
                        };
                        store.claim_task(task.id, "worker-1", 300).await.unwrap();
                        store
                            .release_task(task.id, "worker-1", ClaimOutcome::Completed)
                            .await
                            .unwrap();
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

/// Concurrent workers racing to claim from the same ready-task pool.
fn bench_claim_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/concurrent");
    group.sample_size(20);

    for workers in [2, 4, 8] {
        let task_count = 2000u64;
        group.throughput(Throughput::Elements(task_count));
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter(|| async move {
                    let store = Arc::new(InMemoryTaskStore::new());
                    for i in 0..task_count {
                        store
                            .insert_task(new_task(format!("T-{i}"), 0, i as i32))
                            .await
                            .unwrap();
                    }

                    let claimed_total = Arc::new(AtomicU64::new(0));
                    let mut handles = Vec::new();
                    for worker_id in 0..workers {
                        let store = store.clone();
                        let claimed_total = claimed_total.clone();
                        handles.push(tokio::spawn(async move {
                            let worker_name = format!("worker-{worker_id}");
                            loop {
                                if claimed_total.load(Ordering::Relaxed) >= task_count {
                                    break;
                                }
                                let Some(task) = store.next_ready_task().await.unwrap() else {
                                    if claimed_total.load(Ordering::Relaxed) >= task_count {
                                        break;
                                    }
                                    tokio::task::yield_now().await;
                                    continue;
                                };
                                if store.claim_task(task.id, &worker_name, 300).await.unwrap() {
                                    store
                                        .release_task(task.id, &worker_name, ClaimOutcome::Completed)
                                        .await
                                        .unwrap();
                                    claimed_total.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }));
                    }
                    for handle in handles {
                        handle.await.unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Insertion latency alone, for comparison against the claim path.
fn bench_insert(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/insert");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let store = Arc::new(InMemoryTaskStore::new());
            let start = std::time::Instant::now();
            for i in 0..iters {
                store
                    .insert_task(new_task(format!("T-{i}"), 0, i as i32))
                    .await
                    .unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_claim_single, bench_claim_concurrent, bench_insert);
criterion_main!(benches);
