//! Benchmarks for the engine bridge
//!
//! Measures:
//! - Reference create/ref/unref/delete
//! - Collection with many weak references
//! - Idle monitor tick
//! - Async work round trip through the loop

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use openworkers_native_engine::idle::{GcRequester, IdleMonitor};
use openworkers_native_engine::{
    Engine, EngineConfig, EngineRegistry, Finalizer, GcKind, IdleConfig, LoopMode,
};
use std::hint::black_box;

fn bench_engine() -> (Engine, EngineRegistry) {
    let registry = EngineRegistry::new();
    let config = EngineConfig::default()
        .with_worker_threads(2)
        .with_idle_monitor(false);
    let engine = Engine::new(config, &registry).unwrap();
    (engine, registry)
}

/// Benchmark: reference lifecycle on a live object
fn bench_reference_lifecycle(c: &mut Criterion) {
    let (mut engine, _registry) = bench_engine();
    let obj = engine.runtime_mut().create_object();
    let root = engine.create_reference(obj, 1, None).unwrap();

    c.bench_function("reference_lifecycle", |b| {
        b.iter(|| {
            let id = engine.create_reference(obj, 0, None).unwrap();
            engine.reference_ref(id).unwrap();
            engine.reference_unref(id).unwrap();
            black_box(engine.reference_get(id).unwrap());
            engine.delete_reference(id);
        });
    });

    engine.delete_reference(root);
}

/// Benchmark: collection pass finalizing N weak references
fn bench_collection_finalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection_finalize");

    for count in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let (mut engine, _registry) = bench_engine();
            b.iter(|| {
                for _ in 0..count {
                    let obj = engine.runtime_mut().create_object();
                    engine
                        .create_self_owned_reference(obj, 0, Some(Finalizer::new(|_, _| {})))
                        .unwrap();
                }
                black_box(engine.collect_garbage(GcKind::Full));
            });
        });
    }

    group.finish();
}

struct NoopRequester;

impl GcRequester for NoopRequester {
    fn request_full_gc(&self) {}
}

/// Benchmark: one idle monitor tick
fn bench_idle_tick(c: &mut Criterion) {
    let monitor = IdleMonitor::new(IdleConfig::default(), 0);
    let mut now = 0i64;

    c.bench_function("idle_monitor_tick", |b| {
        b.iter(|| {
            now += 1_000;
            monitor.notify_looper_idle_start(now - 500, 0);
            monitor.notify_looper_idle_end(now - 100);
            black_box(monitor.interval_monitor(now, &NoopRequester));
        });
    });
}

/// Benchmark: queue one work item and run the loop until it completes
fn bench_async_work_round_trip(c: &mut Criterion) {
    let (mut engine, _registry) = bench_engine();

    c.bench_function("async_work_round_trip", |b| {
        b.iter(|| {
            engine
                .queue_async_work(
                    "bench",
                    |n: &mut u64| *n = n.wrapping_mul(31),
                    |_engine, status, n| {
                        black_box((status, n));
                    },
                    7u64,
                )
                .unwrap();
            engine.run_loop(LoopMode::Default).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_reference_lifecycle,
    bench_collection_finalize,
    bench_idle_tick,
    bench_async_work_round_trip
);
criterion_main!(benches);
