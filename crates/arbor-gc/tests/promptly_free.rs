//! Explicitly freeing objects ahead of a collection.

use std::sync::atomic::{AtomicUsize, Ordering};

use arbor_gc::{Collector, Gc, GcConfig, GcReason, StackState, SweepKind, Trace};

fn collector() -> Collector {
    Collector::new(GcConfig::default().without_heuristics())
}

static FREED: AtomicUsize = AtomicUsize::new(0);

#[derive(Trace)]
struct Buffer {
    bytes: [u64; 6],
}

impl Drop for Buffer {
    fn drop(&mut self) {
        FREED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_promptly_freed_object_is_finalized_and_reused() {
    let collector = collector();
    let thread = collector.attach_current_thread();
    let before = FREED.load(Ordering::SeqCst);

    let doomed = Gc::new(Buffer { bytes: [1; 6] });
    let address = Gc::as_ptr(&doomed) as usize;
    let objects = thread.object_count();

    // SAFETY: nothing else references `doomed`.
    assert!(unsafe { thread.promptly_free(doomed) });
    assert_eq!(FREED.load(Ordering::SeqCst) - before, 1);
    assert_eq!(thread.object_count(), objects - 1);

    // The freed span was the last allocation and is handed out again.
    let next = Gc::new(Buffer { bytes: [2; 6] });
    assert_eq!(Gc::as_ptr(&next) as usize, address);
    assert_eq!(next.bytes, [2; 6]);
}

#[test]
fn test_promptly_free_is_refused_while_sweeping() {
    let collector = collector();
    let thread = collector.attach_current_thread();
    for i in 0..2_000_u64 {
        let _ = Gc::new([i; 4]);
    }
    thread.collect_garbage(
        StackState::NoHeapPointersOnStack,
        SweepKind::Lazy,
        GcReason::ForcedGc,
    );
    assert!(thread.has_unswept_pages());

    let x = Gc::new(3_u64);
    // SAFETY: nothing else references `x`.
    assert!(!unsafe { thread.promptly_free(x) });
    assert_eq!(*x, 3);

    thread.complete_sweep();
    // SAFETY: as above.
    assert!(unsafe { thread.promptly_free(x) });
}

#[test]
fn test_promptly_freed_large_object_page_goes_with_next_sweep() {
    let collector = collector();
    let thread = collector.attach_current_thread();

    let large = Gc::new([7_u64; 16 * 1024]);
    let mapped = collector.mapped_page_count();
    assert_eq!(thread.object_count(), 1);

    // SAFETY: nothing else references `large`.
    assert!(unsafe { thread.promptly_free(large) });
    assert_eq!(thread.object_count(), 0);
    assert_eq!(collector.mapped_page_count(), mapped);

    thread.collect_all_garbage();
    assert_eq!(collector.mapped_page_count(), mapped - 1);
}
