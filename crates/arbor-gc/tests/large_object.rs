//! Routing to and reclaiming from the large-object arena.

use std::sync::atomic::{AtomicUsize, Ordering};

use arbor_gc::heap::HEADER_SIZE;
use arbor_gc::{ArenaIndex, Collector, Gc, GcConfig, GcInfo, Persistent, Trace};

const THRESHOLD: usize = 4096;

fn collector() -> Collector {
    Collector::new(
        GcConfig::default()
            .without_heuristics()
            .with_large_object_threshold(THRESHOLD),
    )
}

#[test]
fn test_routing_at_threshold_boundaries() {
    let collector = collector();
    let thread = collector.attach_current_thread();

    let below = Gc::new([1_u8; THRESHOLD - 1]);
    let at = Gc::new([2_u8; THRESHOLD]);
    let above = Gc::new([3_u8; THRESHOLD + 1]);

    assert_eq!(thread.arena_of(&below), ArenaIndex::NormalPage4);
    assert_eq!(thread.arena_of(&at), ArenaIndex::LargeObject);
    assert_eq!(thread.arena_of(&above), ArenaIndex::LargeObject);
    assert!(below.iter().all(|b| *b == 1));
    assert!(at.iter().all(|b| *b == 2));
    assert!(above.iter().all(|b| *b == 3));
}

#[test]
fn test_raw_allocation_routing() {
    let collector = collector();
    let thread = collector.attach_current_thread();
    let index = GcInfo::index_of::<u8>();

    for (size, expected) in [
        (THRESHOLD - 1, ArenaIndex::NormalPage4),
        (THRESHOLD, ArenaIndex::LargeObject),
        (THRESHOLD + 1, ArenaIndex::LargeObject),
    ] {
        let payload = thread.allocate_raw(size, index);
        // SAFETY: the payload is zeroed, which is a valid `u8`.
        let gc = unsafe { Gc::from_raw(payload.as_ptr()) };
        assert_eq!(thread.arena_of(&gc), expected, "size {size}");
        // SAFETY: the whole payload was just handed out.
        let bytes = unsafe { std::slice::from_raw_parts(payload.as_ptr(), size) };
        assert!(bytes.iter().all(|b| *b == 0));
    }
}

static BIG_FINALIZED: AtomicUsize = AtomicUsize::new(0);

#[derive(Trace)]
struct Big {
    data: Vec<u8>,
    padding: [u64; 1024],
}

impl Drop for Big {
    fn drop(&mut self) {
        BIG_FINALIZED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_dead_large_objects_release_their_pages() {
    let collector = collector();
    let thread = collector.attach_current_thread();

    let kept = Persistent::new(Gc::new(Big {
        data: vec![7; 16],
        padding: [0; 1024],
    }));
    for _ in 0..4 {
        let _ = Gc::new(Big {
            data: vec![1; 16],
            padding: [0; 1024],
        });
    }
    let mapped = collector.mapped_page_count();

    thread.collect_all_garbage();
    assert_eq!(BIG_FINALIZED.load(Ordering::SeqCst), 4);
    assert_eq!(collector.mapped_page_count(), mapped - 4);
    assert_eq!(kept.get().unwrap().data, vec![7; 16]);
}

#[test]
fn test_live_bytes_of_large_objects_balance() {
    let collector = collector();
    let thread = collector.attach_current_thread();
    let stats = collector.stats();

    let kept = Persistent::new(Gc::new([5_u64; 4]));
    let small = HEADER_SIZE + 32;
    thread.collect_all_garbage();
    assert_eq!(stats.live_object_bytes(), small);

    let _ = Gc::new([0_u8; 2 * THRESHOLD]);
    let kept_large = Persistent::new(Gc::new([1_u8; THRESHOLD]));
    assert_eq!(
        stats.live_object_bytes(),
        small + (HEADER_SIZE + 2 * THRESHOLD) + (HEADER_SIZE + THRESHOLD)
    );

    thread.collect_all_garbage();
    assert_eq!(
        stats.live_object_bytes(),
        small + HEADER_SIZE + THRESHOLD
    );
    assert_eq!(kept.get().unwrap()[0], 5);
    assert_eq!(kept_large.get().unwrap()[0], 1);
}
