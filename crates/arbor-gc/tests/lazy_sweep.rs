//! Deferred sweeping driven by allocation and by idle deadlines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_gc::{
    Collector, Gc, GcConfig, GcReason, GcState, StackState, SweepKind, SweepScheduler, ThreadState,
};

fn collector() -> Collector {
    Collector::new(GcConfig::default().without_heuristics())
}

fn collect_lazily(thread: &ThreadState) {
    let outcome = thread.collect_garbage(
        StackState::NoHeapPointersOnStack,
        SweepKind::Lazy,
        GcReason::ForcedGc,
    );
    assert!(outcome.is_completed());
}

fn fill(count: usize) {
    for i in 0..count {
        let _ = Gc::new([i as u64; 4]);
    }
}

#[test]
fn test_lazy_collection_leaves_pages_unswept() {
    let collector = collector();
    let thread = collector.attach_current_thread();
    fill(20_000);

    collect_lazily(&thread);
    assert_eq!(thread.gc_state(), GcState::Sweeping);
    assert!(thread.has_unswept_pages());

    thread.complete_sweep();
    assert_eq!(thread.gc_state(), GcState::NoGcScheduled);
    assert!(!thread.has_unswept_pages());
}

#[test]
fn test_idle_sweep_respects_deadline() {
    let collector = collector();
    let thread = collector.attach_current_thread();
    fill(20_000);
    collect_lazily(&thread);

    let expired = thread.perform_idle_lazy_sweep(Instant::now() - Duration::from_millis(1));
    assert_eq!(expired.pages_swept, 0);
    assert!(!expired.completed);
    assert_eq!(thread.gc_state(), GcState::Sweeping);

    let progress = thread.perform_idle_lazy_sweep(Instant::now() + Duration::from_secs(10));
    assert!(progress.completed);
    assert!(progress.pages_swept > 0);
    assert!(progress.freed_bytes > 0);
    assert_eq!(thread.gc_state(), GcState::NoGcScheduled);

    let idle = thread.perform_idle_lazy_sweep(Instant::now() + Duration::from_secs(1));
    assert_eq!(idle.pages_swept, 0);
    assert!(idle.completed);
}

#[derive(Default)]
struct CountingScheduler {
    sweeps: AtomicUsize,
}

impl SweepScheduler for CountingScheduler {
    fn schedule_idle_lazy_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_scheduler_is_told_about_pending_sweeps() {
    let collector = collector();
    let thread = collector.attach_current_thread();
    let scheduler = Arc::new(CountingScheduler::default());
    thread.set_sweep_scheduler(Some(scheduler.clone()));
    fill(1_000);

    collect_lazily(&thread);
    assert_eq!(scheduler.sweeps.load(Ordering::SeqCst), 1);

    // Running out of time asks for another slot.
    thread.perform_idle_lazy_sweep(Instant::now());
    assert_eq!(scheduler.sweeps.load(Ordering::SeqCst), 2);

    thread.perform_idle_lazy_sweep(Instant::now() + Duration::from_secs(10));
    assert_eq!(thread.gc_state(), GcState::NoGcScheduled);
    thread.set_sweep_scheduler(None);
}

#[test]
fn test_allocation_sweeps_on_demand_and_reuses_memory() {
    let collector = collector();
    let thread = collector.attach_current_thread();
    fill(20_000);
    let pages = thread.page_count();

    collect_lazily(&thread);
    fill(20_000);
    assert!(thread.page_count() <= pages);
}

#[test]
fn test_collecting_finishes_the_previous_sweep() {
    let collector = collector();
    let thread = collector.attach_current_thread();
    fill(5_000);
    collect_lazily(&thread);
    assert!(thread.has_unswept_pages());

    thread.collect_all_garbage();
    assert_eq!(thread.gc_state(), GcState::NoGcScheduled);
    assert!(!thread.has_unswept_pages());
    assert_eq!(thread.object_count(), 0);
}
