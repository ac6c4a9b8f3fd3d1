//! Freed spans stay quarantined for exactly one sweep with `delayed-reuse`.

#![cfg(feature = "delayed-reuse")]

use arbor_gc::heap::{HEADER_SIZE, REUSE_ALLOWED_ZAP_VALUE, REUSE_FORBIDDEN_ZAP_VALUE};
use arbor_gc::{Collector, Gc, GcConfig, GcReason, Persistent, StackState, SweepKind, ThreadState};

fn collect(thread: &ThreadState) {
    thread.collect_garbage(
        StackState::NoHeapPointersOnStack,
        SweepKind::Eager,
        GcReason::ForcedGc,
    );
}

/// Byte 16 of the span, the first byte after the free-list link.
unsafe fn zap_byte(payload: *const u8) -> u8 {
    // SAFETY: the caller keeps the page alive.
    unsafe { payload.add(2 * 8 - HEADER_SIZE).read() }
}

#[test]
fn test_dead_span_is_reusable_after_one_more_sweep() {
    let collector = Collector::new(GcConfig::default().without_heuristics());
    let thread = collector.attach_current_thread();

    // Live neighbours keep the page and stop the span from merging.
    let before = Persistent::new(Gc::new([1_u64; 8]));
    let dead = Gc::as_ptr(&Gc::new([2_u64; 8])).cast::<u8>();
    let after = Persistent::new(Gc::new([3_u64; 8]));

    collect(&thread);
    // SAFETY: live neighbours keep the page mapped.
    assert_eq!(unsafe { zap_byte(dead) }, REUSE_FORBIDDEN_ZAP_VALUE);

    // Quarantined spans are not on the free list.
    let fresh = Gc::new([4_u64; 8]);
    assert_ne!(Gc::as_ptr(&fresh).cast::<u8>(), dead);

    for round in 1..4 {
        collect(&thread);
        // SAFETY: as above.
        assert_eq!(
            unsafe { zap_byte(dead) },
            REUSE_ALLOWED_ZAP_VALUE,
            "round {round}"
        );
    }
    assert_eq!(before.get().unwrap()[0], 1);
    assert_eq!(after.get().unwrap()[7], 3);
}

#[test]
fn test_quarantine_does_not_spread_to_free_neighbours() {
    let collector = Collector::new(GcConfig::default().without_heuristics());
    let thread = collector.attach_current_thread();

    // The last object borders the flushed bump tail of its page.
    let kept = Persistent::new(Gc::new([1_u64; 8]));
    let dead = Gc::as_ptr(&Gc::new([2_u64; 8])).cast::<u8>();

    collect(&thread);
    // SAFETY: `kept` keeps the page mapped.
    assert_eq!(unsafe { zap_byte(dead) }, REUSE_FORBIDDEN_ZAP_VALUE);

    // The tail right after the dead span is still served.
    let fresh = Gc::as_ptr(&Gc::new([5_u64; 8])).cast::<u8>();
    assert_eq!(fresh as usize, dead as usize + HEADER_SIZE + 64);

    collect(&thread);
    // SAFETY: as above.
    assert_eq!(unsafe { zap_byte(dead) }, REUSE_ALLOWED_ZAP_VALUE);
    assert_eq!(kept.get().unwrap()[0], 1);
}
