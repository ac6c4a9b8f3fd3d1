//! Hooks for sweeping outside of allocation.

/// Embedder hook for idle-time work.
///
/// A thread state with a scheduler notifies it whenever lazy sweeping or
/// an idle collection becomes pending; the embedder later calls
/// [`ThreadState::perform_idle_lazy_sweep`](crate::ThreadState::perform_idle_lazy_sweep)
/// or [`ThreadState::perform_idle_gc`](crate::ThreadState::perform_idle_gc)
/// from the owning thread with a deadline.
pub trait SweepScheduler: Send + Sync {
    /// Unswept pages are waiting.
    fn schedule_idle_lazy_sweep(&self);

    /// An idle collection was requested.
    fn schedule_idle_gc(&self) {}
}

/// Result of a deadline-bounded sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepProgress {
    /// Pages swept by this call.
    pub pages_swept: usize,
    /// Bytes reclaimed by this call.
    pub freed_bytes: usize,
    /// Whether no unswept page is left.
    pub completed: bool,
}
