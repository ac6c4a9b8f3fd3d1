//! Stop-the-world coordination between attached threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use arbor_gc::{
    CollectOutcome, Collector, Gc, GcConfig, GcReason, Interruptor, Persistent, SafePointScope,
    StackState, SweepKind, Trace,
};

fn collector(park_timeout: Duration) -> Collector {
    Collector::new(
        GcConfig::default()
            .without_heuristics()
            .with_park_timeout(park_timeout),
    )
}

fn precise_eager(thread: &arbor_gc::ThreadState) -> CollectOutcome {
    thread.collect_garbage(
        StackState::NoHeapPointersOnStack,
        SweepKind::Eager,
        GcReason::ForcedGc,
    )
}

#[test]
fn test_timeout_abandons_and_leaves_heap_untouched() {
    let collector = collector(Duration::from_millis(30));
    let thread = collector.attach_current_thread();

    let (attached_tx, attached_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let other = {
        let collector = collector.clone();
        thread::spawn(move || {
            let _thread = collector.attach_current_thread();
            attached_tx.send(()).unwrap();
            // Never reaches a safepoint until released.
            release_rx.recv().unwrap();
        })
    };
    attached_rx.recv().unwrap();

    let rooted = Persistent::new(Gc::new([5_u64; 8]));
    for i in 0..100_u64 {
        let _ = Gc::new([i; 3]);
    }
    let before = thread.heap_snapshot();
    let state_before = thread.gc_state();
    let stats_before = collector.stats().marked_bytes();

    let outcome = precise_eager(&thread);
    assert!(matches!(outcome, CollectOutcome::Abandoned));
    assert_eq!(thread.heap_snapshot(), before);
    assert_eq!(thread.gc_state(), state_before);
    assert_eq!(collector.stats().marked_bytes(), stats_before);
    assert_eq!(collector.total_collections(), 0);
    assert!(!thread.is_safe_point_requested());

    release_tx.send(()).unwrap();
    other.join().unwrap();

    assert!(precise_eager(&thread).is_completed());
    assert_eq!(*rooted.get().unwrap(), [5; 8]);
}

static OTHER_FINALIZED: AtomicUsize = AtomicUsize::new(0);

#[derive(Trace)]
struct Counted(u64);

impl Drop for Counted {
    fn drop(&mut self) {
        OTHER_FINALIZED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_polling_thread_parks_and_sweeps_its_heap() {
    let collector = collector(Duration::from_secs(5));
    let thread = collector.attach_current_thread();

    let ready = Arc::new(Barrier::new(2));
    let stop = Arc::new(AtomicBool::new(false));
    let other = {
        let collector = collector.clone();
        let ready = Arc::clone(&ready);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let thread = collector.attach_current_thread();
            let kept = Persistent::new(Gc::new(Counted(1)));
            for i in 0..10 {
                let _ = Gc::new(Counted(i));
            }
            ready.wait();
            while !stop.load(Ordering::Acquire) {
                thread.safe_point(StackState::NoHeapPointersOnStack);
                thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(kept.get().unwrap().0, 1);
        })
    };

    ready.wait();
    let outcome = precise_eager(&thread);
    let metrics = outcome.metrics().copied().unwrap();
    assert_eq!(metrics.thread_count, 2);
    assert_eq!(metrics.marked_objects, 1);

    stop.store(true, Ordering::Release);
    other.join().unwrap();
    // Ten dead objects swept by their owner, then the rooted one at exit.
    assert_eq!(OTHER_FINALIZED.load(Ordering::SeqCst), 11);
}

struct FlagInterruptor {
    requested: AtomicBool,
    requests: AtomicUsize,
    clears: AtomicUsize,
}

impl Interruptor for FlagInterruptor {
    fn request_interrupt(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.requested.store(true, Ordering::SeqCst);
    }

    fn clear_interrupt(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.requested.store(false, Ordering::SeqCst);
    }
}

#[test]
fn test_interruptor_brings_thread_to_safe_point() {
    let collector = collector(Duration::from_secs(5));
    let thread = collector.attach_current_thread();

    let interruptor = Arc::new(FlagInterruptor {
        requested: AtomicBool::new(false),
        requests: AtomicUsize::new(0),
        clears: AtomicUsize::new(0),
    });
    let ready = Arc::new(Barrier::new(2));
    let stop = Arc::new(AtomicBool::new(false));
    let other = {
        let collector = collector.clone();
        let interruptor = Arc::clone(&interruptor);
        let ready = Arc::clone(&ready);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let thread = collector.attach_current_thread();
            let as_dyn: Arc<dyn Interruptor> = interruptor.clone();
            thread.add_interruptor(Arc::clone(&as_dyn));
            ready.wait();
            while !stop.load(Ordering::Acquire) {
                if interruptor.requested.load(Ordering::SeqCst) {
                    thread.safe_point(StackState::NoHeapPointersOnStack);
                }
                std::hint::spin_loop();
            }
            thread.remove_interruptor(&as_dyn);
        })
    };

    ready.wait();
    assert!(precise_eager(&thread).is_completed());
    assert_eq!(interruptor.requests.load(Ordering::SeqCst), 1);
    assert_eq!(interruptor.clears.load(Ordering::SeqCst), 1);

    stop.store(true, Ordering::Release);
    other.join().unwrap();
}

#[test]
fn test_safe_point_scope_lets_others_collect() {
    let collector = collector(Duration::from_secs(5));
    let thread = collector.attach_current_thread();

    let (in_scope_tx, in_scope_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let other = {
        let collector = collector.clone();
        thread::spawn(move || {
            let thread = collector.attach_current_thread();
            let root = Persistent::new(Gc::new(String::from("parked")));
            {
                let _scope = SafePointScope::new(&thread, StackState::NoHeapPointersOnStack);
                in_scope_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }
            assert_eq!(*root.get().unwrap(), "parked");
        })
    };

    in_scope_rx.recv().unwrap();
    assert!(precise_eager(&thread).is_completed());
    release_tx.send(()).unwrap();
    other.join().unwrap();
}

#[test]
fn test_safe_point_aware_lock_does_not_block_collection() {
    let collector = collector(Duration::from_secs(5));
    let thread = collector.attach_current_thread();
    let mutex = Arc::new(parking_lot::Mutex::new(0_u32));

    let guard = mutex.lock();
    let (about_to_lock_tx, about_to_lock_rx) = mpsc::channel();
    let other = {
        let collector = collector.clone();
        let mutex = Arc::clone(&mutex);
        thread::spawn(move || {
            let thread = collector.attach_current_thread();
            about_to_lock_tx.send(()).unwrap();
            let mut value = thread.lock_safe_point_aware(&mutex);
            *value += 1;
        })
    };

    about_to_lock_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(precise_eager(&thread).is_completed());
    drop(guard);
    other.join().unwrap();
    assert_eq!(*mutex.lock(), 1);
}
