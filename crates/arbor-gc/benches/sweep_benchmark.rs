//! Benchmark: lazy vs eager sweeping.
//!
//! Measures the pause of a collection cycle with each sweep kind, the cost
//! of allocating through pending lazy sweeps, and idle-time sweeping.

use std::hint::black_box;
use std::time::{Duration, Instant};

use arbor_gc::{
    Collector, Gc, GcConfig, GcReason, Member, Persistent, StackState, SweepKind, ThreadState,
    Trace,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

#[derive(Trace)]
struct Node {
    value: i64,
    next: Member<Node>,
}

/// Allocates `count` nodes, keeping every tenth one reachable.
fn build_heap(count: usize) -> Persistent<Node> {
    let head = Gc::new(Node {
        value: -1,
        next: Member::empty(),
    });
    let mut tail = head;
    for i in 0..count {
        let node = Gc::new(Node {
            value: i as i64,
            next: Member::empty(),
        });
        if i % 10 == 0 {
            tail.next.set(Some(node));
            tail = node;
        }
    }
    Persistent::new(head)
}

fn collect(thread: &ThreadState, sweep_kind: SweepKind) -> Duration {
    let start = Instant::now();
    let outcome = thread.collect_garbage(
        StackState::NoHeapPointersOnStack,
        sweep_kind,
        GcReason::ForcedGc,
    );
    let elapsed = start.elapsed();
    black_box(outcome);
    elapsed
}

fn bench_pause_time(c: &mut Criterion) {
    let collector = Collector::new(GcConfig::default().without_heuristics());
    let thread = collector.attach_current_thread();
    let mut group = c.benchmark_group("pause_time");

    for count in [1_000, 10_000, 100_000] {
        for (name, sweep_kind) in [("eager", SweepKind::Eager), ("lazy", SweepKind::Lazy)] {
            group.bench_with_input(BenchmarkId::new(name, count), &count, |b, &count| {
                b.iter_custom(|iterations| {
                    let mut total = Duration::ZERO;
                    for _ in 0..iterations {
                        let root = build_heap(count);
                        total += collect(&thread, sweep_kind);
                        thread.complete_sweep();
                        black_box(root.get());
                    }
                    total
                });
            });
        }
    }
    group.finish();
}

fn bench_allocation_through_lazy_sweep(c: &mut Criterion) {
    let collector = Collector::new(GcConfig::default().without_heuristics());
    let thread = collector.attach_current_thread();

    c.bench_function("alloc_10000_after_lazy_collect", |b| {
        b.iter_custom(|iterations| {
            let mut total = Duration::ZERO;
            for _ in 0..iterations {
                let root = build_heap(10_000);
                collect(&thread, SweepKind::Lazy);
                let start = Instant::now();
                for i in 0..10_000 {
                    black_box(Gc::new(Node {
                        value: i,
                        next: Member::empty(),
                    }));
                }
                total += start.elapsed();
                thread.complete_sweep();
                drop(root);
            }
            total
        });
    });
}

fn bench_idle_sweep(c: &mut Criterion) {
    let collector = Collector::new(GcConfig::default().without_heuristics());
    let thread = collector.attach_current_thread();

    c.bench_function("idle_sweep_1ms_slices", |b| {
        b.iter_custom(|iterations| {
            let mut total = Duration::ZERO;
            for _ in 0..iterations {
                let root = build_heap(50_000);
                collect(&thread, SweepKind::Lazy);
                let start = Instant::now();
                loop {
                    let progress =
                        thread.perform_idle_lazy_sweep(Instant::now() + Duration::from_millis(1));
                    if progress.completed {
                        break;
                    }
                }
                total += start.elapsed();
                drop(root);
            }
            total
        });
    });
}

fn bench_sustained_cycles(c: &mut Criterion) {
    let collector = Collector::new(GcConfig::default());
    let thread = collector.attach_current_thread();

    c.bench_function("sustained_100_cycles", |b| {
        b.iter(|| {
            for cycle in 0..100 {
                let root = build_heap(1_000);
                if cycle % 10 == 0 {
                    thread.safe_point(StackState::NoHeapPointersOnStack);
                }
                black_box(root.get());
            }
            thread.collect_all_garbage();
        });
    });
}

criterion_group!(
    benches,
    bench_pause_time,
    bench_allocation_through_lazy_sweep,
    bench_idle_sweep,
    bench_sustained_cycles
);
criterion_main!(benches);
