//! GC metrics and statistics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::gc::{GcReason, StackState, SweepKind};

/// Statistics from one completed collection cycle.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Why the collection ran.
    pub reason: GcReason,
    /// Whether thread stacks were scanned conservatively.
    pub stack_state: StackState,
    /// Whether sweeping ran eagerly or was deferred.
    pub sweep_kind: SweepKind,
    /// Wall time from parking the other threads to resuming them.
    pub pause: Duration,
    /// Duration of the prepare phase (parking excluded).
    pub prepare_duration: Duration,
    /// Duration of root visiting, mark stack draining and ephemeron iteration.
    pub mark_duration: Duration,
    /// Duration of weak callback processing.
    pub weak_duration: Duration,
    /// Duration of the eager sweep on the collecting thread, zero for lazy sweeps.
    pub sweep_duration: Duration,
    /// Bytes found reachable.
    pub marked_bytes: usize,
    /// Objects found reachable.
    pub marked_objects: usize,
    /// Number of times the ephemeron callbacks were run.
    pub ephemeron_passes: usize,
    /// Orphaned pages handed back after this cycle.
    pub orphaned_pages_decommitted: usize,
    /// Threads that took part in the cycle, collector included.
    pub thread_count: usize,
    /// Total collections on this collector, this one included.
    pub total_collections: usize,
}

impl GcMetrics {
    pub(crate) const fn new(
        reason: GcReason,
        stack_state: StackState,
        sweep_kind: SweepKind,
    ) -> Self {
        Self {
            reason,
            stack_state,
            sweep_kind,
            pause: Duration::ZERO,
            prepare_duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            weak_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            marked_bytes: 0,
            marked_objects: 0,
            ephemeron_passes: 0,
            orphaned_pages_decommitted: 0,
            thread_count: 0,
            total_collections: 0,
        }
    }
}

/// Internal helper for capturing phase durations.
#[derive(Debug, Default)]
pub(crate) struct PhaseTimer {
    current_start: Option<Instant>,
}

impl PhaseTimer {
    pub const fn new() -> Self {
        Self {
            current_start: None,
        }
    }

    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Ends the current phase and returns its length.
    pub fn end(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }
}

/// Heap-wide byte counters shared by every thread of a collector.
///
/// These feed the scheduling heuristics and are cheap to read at any time.
#[derive(Debug, Default)]
pub struct HeapStats {
    allocated_bytes_since_last_gc: AtomicUsize,
    marked_bytes: AtomicUsize,
    allocated_space: AtomicUsize,
    live_object_bytes: AtomicUsize,
}

impl HeapStats {
    /// Create a new `HeapStats` with all counters set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocated_bytes_since_last_gc: AtomicUsize::new(0),
            marked_bytes: AtomicUsize::new(0),
            allocated_space: AtomicUsize::new(0),
            live_object_bytes: AtomicUsize::new(0),
        }
    }

    /// Bytes handed out since the last completed marking phase.
    pub fn allocated_bytes_since_last_gc(&self) -> usize {
        self.allocated_bytes_since_last_gc.load(Ordering::Relaxed)
    }

    /// Bytes marked by the last completed marking phase.
    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes.load(Ordering::Relaxed)
    }

    /// Bytes of committed page memory owned by arenas.
    pub fn allocated_space(&self) -> usize {
        self.allocated_space.load(Ordering::Relaxed)
    }

    /// Bytes of allocated objects that were not yet swept, promptly freed or
    /// left behind on an orphaned page.
    pub fn live_object_bytes(&self) -> usize {
        self.live_object_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn increase_allocated(&self, bytes: usize) {
        self.allocated_bytes_since_last_gc
            .fetch_add(bytes, Ordering::Relaxed);
        self.live_object_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn decrease_live(&self, bytes: usize) {
        // Saturates instead of wrapping.
        let _ = self
            .live_object_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
                Some(live.saturating_sub(bytes))
            });
    }

    pub(crate) fn increase_space(&self, bytes: usize) {
        self.allocated_space.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn decrease_space(&self, bytes: usize) {
        self.allocated_space.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Records the outcome of a marking phase and starts a new allocation epoch.
    pub(crate) fn marking_done(&self, marked_bytes: usize) {
        self.marked_bytes.store(marked_bytes, Ordering::Relaxed);
        self.allocated_bytes_since_last_gc.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marking_done_resets_epoch() {
        let stats = HeapStats::new();
        stats.increase_allocated(4096);
        assert_eq!(stats.allocated_bytes_since_last_gc(), 4096);
        assert_eq!(stats.live_object_bytes(), 4096);

        stats.marking_done(1024);
        assert_eq!(stats.allocated_bytes_since_last_gc(), 0);
        assert_eq!(stats.marked_bytes(), 1024);
        // Live bytes only drop as dead objects are swept.
        assert_eq!(stats.live_object_bytes(), 4096);
        stats.decrease_live(3072);
        assert_eq!(stats.live_object_bytes(), 1024);
    }

    #[test]
    fn test_decrease_live_saturates() {
        let stats = HeapStats::new();
        stats.increase_allocated(16);
        stats.decrease_live(64);
        assert_eq!(stats.live_object_bytes(), 0);
    }

    #[test]
    fn test_phase_timer_without_start_is_zero() {
        let mut timer = PhaseTimer::new();
        assert_eq!(timer.end(), Duration::ZERO);
        timer.start();
        let _ = timer.end();
        assert_eq!(timer.end(), Duration::ZERO);
    }
}
