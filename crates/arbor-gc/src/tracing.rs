//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for garbage collection operations. Without the
//! feature the event helpers compile to nothing and no spans are opened.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tracing::{span, Level};

    /// Phases of a collection cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Park other threads and make every heap consistent.
        Prepare,
        /// Visit roots and drain the mark stack to the ephemeron fixed point.
        Mark,
        /// Run weak callbacks and decommit untraced orphaned pages.
        WeakProcessing,
        /// Reclaim unmarked objects.
        Sweep,
    }

    /// Stable identifier for a GC run.
    ///
    /// This ID is used to correlate all events within a single garbage
    /// collection run. It is a monotonically increasing counter that
    /// starts at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire GC collection.
    pub fn trace_gc_collection(reason: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", reason = reason, gc_id = gc_id.0).entered()
    }

    /// Create a span for a GC phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the end of the marking phase.
    pub fn log_marking_done(marked_bytes: usize, ephemeron_passes: usize) {
        tracing::debug!(marked_bytes, ephemeron_passes, "marking_done");
    }

    /// Log that the safepoint barrier gave up waiting.
    pub fn log_park_timeout(unparked: isize, timeout: Duration) {
        tracing::warn!(
            unparked,
            timeout_ms = timeout.as_millis(),
            "park_timeout_collection_abandoned"
        );
    }

    /// Log a thread attaching to or detaching from a collector.
    pub fn log_thread_attach(attached: bool, thread_count: usize) {
        tracing::debug!(attached, thread_count, "thread_attach");
    }

    /// Log the result of an orphaned page sweep.
    pub fn log_orphans_decommitted(decommitted: usize, still_quarantined: usize) {
        tracing::debug!(decommitted, still_quarantined, "orphaned_pages_decommitted");
    }

    /// Log the number of bytes reclaimed by a sweep pass.
    pub fn log_sweep(bytes_swept: usize, eager: bool) {
        tracing::debug!(bytes_swept, eager, "sweep_done");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    use std::time::Duration;

    /// Stub function when tracing is disabled.
    pub const fn log_marking_done(_marked_bytes: usize, _ephemeron_passes: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_park_timeout(_unparked: isize, _timeout: Duration) {}

    /// Stub function when tracing is disabled.
    pub const fn log_thread_attach(_attached: bool, _thread_count: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_orphans_decommitted(_decommitted: usize, _still_quarantined: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_sweep(_bytes_swept: usize, _eager: bool) {}
}
