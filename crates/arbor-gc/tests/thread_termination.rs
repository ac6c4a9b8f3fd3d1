//! Collections run by threads detaching from a collector.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use arbor_gc::{Collector, CrossThreadPersistent, Gc, GcConfig, Persistent, Trace};

fn collector() -> Collector {
    Collector::new(GcConfig::default().without_heuristics())
}

static LEAVES_FINALIZED: AtomicUsize = AtomicUsize::new(0);

#[derive(Trace)]
struct Leaf(u64);

impl Drop for Leaf {
    fn drop(&mut self) {
        LEAVES_FINALIZED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_terminating_thread_finalizes_its_objects() {
    let collector = collector();
    let _main = collector.attach_current_thread();

    let worker = {
        let collector = collector.clone();
        thread::spawn(move || {
            let _thread = collector.attach_current_thread();
            let _rooted = Persistent::new(Gc::new(Leaf(0)));
            for i in 1..=20 {
                let _ = Gc::new(Leaf(i));
            }
        })
    };
    worker.join().unwrap();

    assert_eq!(LEAVES_FINALIZED.load(Ordering::SeqCst), 21);
    assert_eq!(collector.thread_count(), 1);
}

static HELD_FINALIZED: AtomicUsize = AtomicUsize::new(0);

#[derive(Trace)]
struct Held(u64);

impl Drop for Held {
    fn drop(&mut self) {
        HELD_FINALIZED.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Trace)]
struct Holder {
    #[arbor_gc(skip)]
    inner: Persistent<Held>,
}

#[test]
fn test_persistents_held_by_dead_objects_are_released_in_rounds() {
    let collector = collector();
    let _main = collector.attach_current_thread();

    let worker = {
        let collector = collector.clone();
        thread::spawn(move || {
            let thread = collector.attach_current_thread();
            // Only the holder's own persistent keeps the leaf alive, and
            // only the first termination round finalizes the holder.
            let _ = Gc::new(Holder {
                inner: Persistent::new(Gc::new(Held(99))),
            });
            assert_eq!(thread.persistent_count(), 1);
        })
    };
    worker.join().unwrap();

    assert_eq!(HELD_FINALIZED.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cross_thread_persistents_are_cleared_on_termination() {
    let collector = collector();
    let main = collector.attach_current_thread();

    let worker = {
        let collector = collector.clone();
        thread::spawn(move || {
            let _thread = collector.attach_current_thread();
            let handle = CrossThreadPersistent::new(Gc::new(5_u64));
            assert_eq!(*handle.get().unwrap(), 5);
            handle
        })
    };
    let handle = worker.join().unwrap();
    assert!(handle.get().is_none());

    // Main-thread handles survive.
    let local = CrossThreadPersistent::new(Gc::new(6_u64));
    main.collect_all_garbage();
    assert_eq!(*local.get().unwrap(), 6);
}

#[derive(Trace)]
struct Watched(u64);

static WATCHED_HANDLE: parking_lot::Mutex<Option<CrossThreadPersistent<Watched>>> =
    parking_lot::Mutex::new(None);
static WATCHED_FINALIZED: AtomicUsize = AtomicUsize::new(0);
static HANDLE_CLEARED_BEFORE_FINALIZE: AtomicBool = AtomicBool::new(false);

impl Drop for Watched {
    fn drop(&mut self) {
        let cleared = WATCHED_HANDLE
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.get().is_none());
        HANDLE_CLEARED_BEFORE_FINALIZE.store(cleared, Ordering::SeqCst);
        WATCHED_FINALIZED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_cross_thread_handles_are_cleared_before_their_target_is_swept() {
    let collector = collector();
    let _main = collector.attach_current_thread();

    let worker = {
        let collector = collector.clone();
        thread::spawn(move || {
            let _thread = collector.attach_current_thread();
            *WATCHED_HANDLE.lock() = Some(CrossThreadPersistent::new(Gc::new(Watched(3))));
        })
    };
    worker.join().unwrap();

    assert_eq!(WATCHED_FINALIZED.load(Ordering::SeqCst), 1);
    assert!(HANDLE_CLEARED_BEFORE_FINALIZE.load(Ordering::SeqCst));
    let handle = WATCHED_HANDLE.lock().take().unwrap();
    assert!(handle.get().is_none());
}

#[test]
fn test_pages_of_terminated_threads_are_orphaned_then_released() {
    let collector = collector();
    let main = collector.attach_current_thread();

    let worker = {
        let collector = collector.clone();
        thread::spawn(move || {
            let _thread = collector.attach_current_thread();
            for i in 0..5_000_u64 {
                let _ = Gc::new([i; 4]);
            }
            let _ = Gc::new([0_u8; 1 << 16]);
        })
    };
    worker.join().unwrap();
    assert!(collector.orphaned_page_count() > 0);

    let outcome = main.collect_garbage(
        arbor_gc::StackState::NoHeapPointersOnStack,
        arbor_gc::SweepKind::Eager,
        arbor_gc::GcReason::ForcedGc,
    );
    assert!(outcome.metrics().unwrap().orphaned_pages_decommitted > 0);
    assert_eq!(collector.orphaned_page_count(), 0);
}

#[test]
fn test_reattaching_after_detach() {
    let collector = collector();
    {
        let thread = collector.attach_current_thread();
        let _ = Gc::new(1_u64);
        thread.collect_all_garbage();
    }
    assert_eq!(collector.thread_count(), 0);
    let thread = collector.attach_current_thread();
    let x = Gc::new(2_u64);
    assert_eq!(*x, 2);
    assert_eq!(thread.gc_state(), arbor_gc::GcState::NoGcScheduled);
}
