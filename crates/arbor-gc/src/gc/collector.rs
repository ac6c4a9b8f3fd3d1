//! The collector instance: thread registry, shared page pools and the
//! stop-the-world collection cycle.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::config::GcConfig;
use crate::gc::{
    CollectOutcome, GcReason, GcState, MarkingWorklists, SafePointBarrier, StackState, SweepKind,
};
use crate::heap::{FreePagePool, OrphanedPagePool, PageMap, PAGE_SIZE};
use crate::metrics::{GcMetrics, HeapStats, PhaseTimer};
use crate::persistent::PersistentRegion;
use crate::thread_state::ThreadState;
use crate::trace::{Visitor, VisitorKind};
use crate::tracing::internal::{log_marking_done, log_orphans_decommitted, log_thread_attach};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{next_gc_id, trace_gc_collection, trace_phase, GcPhase};

type RootTracer = dyn Fn(&mut Visitor<'_>) + Send + Sync;

type ThreadRegistry = ReentrantMutex<RefCell<Vec<Arc<ThreadState>>>>;

/// Handle returned by [`Collector::add_root_tracer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootTracerId(u64);

/// State shared by every thread attached to one collector.
pub(crate) struct CollectorInner {
    pub(crate) config: GcConfig,
    threads: ThreadRegistry,
    pub(crate) barrier: SafePointBarrier,
    pub(crate) free_pages: FreePagePool,
    pub(crate) orphaned_pages: OrphanedPagePool,
    pub(crate) page_map: PageMap,
    pub(crate) stats: HeapStats,
    pub(crate) cross_thread_persistents: Mutex<PersistentRegion>,
    root_tracers: Mutex<Vec<(RootTracerId, Arc<RootTracer>)>>,
    worklists: Mutex<MarkingWorklists>,
    last_metrics: Mutex<Option<GcMetrics>>,
    total_collections: AtomicUsize,
    next_root_tracer: AtomicU64,
}

/// A garbage-collected heap shared by any number of attached threads.
///
/// Each attached thread allocates from its own arenas; collections stop
/// every attached thread at a safepoint and mark all heaps together.
///
/// # Examples
///
/// ```
/// use arbor_gc::{Collector, Gc, GcConfig, Persistent, StackState};
///
/// let collector = Collector::new(GcConfig::default());
/// let thread = collector.attach_current_thread();
/// let root = Persistent::new(Gc::new(7_u64));
/// thread.collect_all_garbage();
/// assert_eq!(*root.get().unwrap(), 7);
/// ```
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("threads", &self.thread_count())
            .field("total_collections", &self.total_collections())
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Creates a collector.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    #[must_use]
    pub fn new(config: GcConfig) -> Self {
        match Self::try_new(config) {
            Ok(collector) => collector,
            Err(reason) => panic!("invalid GcConfig: {reason}"),
        }
    }

    /// Creates a collector, rejecting an invalid `config`.
    ///
    /// # Errors
    ///
    /// Returns the first constraint `config` violates.
    pub fn try_new(config: GcConfig) -> Result<Self, &'static str> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(CollectorInner {
                config,
                threads: ReentrantMutex::new(RefCell::new(Vec::new())),
                barrier: SafePointBarrier::new(),
                free_pages: FreePagePool::new(),
                orphaned_pages: OrphanedPagePool::new(),
                page_map: PageMap::new(),
                stats: HeapStats::new(),
                cross_thread_persistents: Mutex::new(PersistentRegion::new()),
                root_tracers: Mutex::new(Vec::new()),
                worklists: Mutex::new(MarkingWorklists::new()),
                last_metrics: Mutex::new(None),
                total_collections: AtomicUsize::new(0),
                next_root_tracer: AtomicU64::new(0),
            }),
        })
    }

    /// Attaches the calling thread. The thread stays attached until the
    /// returned guard is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already attached to a collector.
    #[must_use = "the thread detaches when the guard is dropped"]
    pub fn attach_current_thread(&self) -> AttachedThread {
        assert!(
            ThreadState::current().is_none(),
            "the current thread is already attached to a collector"
        );
        let state = Arc::new(ThreadState::new(Arc::clone(&self.inner)));
        let count = {
            let guard = self.inner.threads.lock();
            let mut threads = guard.borrow_mut();
            threads.push(Arc::clone(&state));
            threads.len()
        };
        ThreadState::set_current(Some(&state));
        log_thread_attach(true, count);
        AttachedThread {
            state,
            _not_send: std::marker::PhantomData,
        }
    }

    /// Registers an embedder callback that reports extra roots at the start
    /// of every global marking.
    pub fn add_root_tracer(
        &self,
        tracer: impl Fn(&mut Visitor<'_>) + Send + Sync + 'static,
    ) -> RootTracerId {
        let id = RootTracerId(self.inner.next_root_tracer.fetch_add(1, Ordering::Relaxed));
        self.inner.root_tracers.lock().push((id, Arc::new(tracer)));
        id
    }

    /// Unregisters a root tracer. Returns whether it was registered.
    pub fn remove_root_tracer(&self, id: RootTracerId) -> bool {
        let mut tracers = self.inner.root_tracers.lock();
        let before = tracers.len();
        tracers.retain(|(registered, _)| *registered != id);
        tracers.len() != before
    }

    /// Metrics of the last completed collection.
    #[must_use]
    pub fn last_gc_metrics(&self) -> Option<GcMetrics> {
        *self.inner.last_metrics.lock()
    }

    /// Heap-wide byte counters.
    #[must_use]
    pub fn stats(&self) -> &HeapStats {
        &self.inner.stats
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.inner.config
    }

    /// Number of attached threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.threads.lock().borrow().len()
    }

    /// Completed collections so far.
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.inner.total_collections.load(Ordering::Relaxed)
    }

    /// Pages of terminated threads still waiting to be decommitted.
    #[must_use]
    pub fn orphaned_page_count(&self) -> usize {
        self.inner.orphaned_pages.len()
    }

    /// Decommitted normal pages pooled for reuse.
    #[must_use]
    pub fn free_page_count(&self) -> usize {
        (0..crate::heap::NORMAL_ARENA_COUNT)
            .map(|index| self.inner.free_pages.len(index))
            .sum()
    }

    /// Number of mapped heap pages, orphaned ones included.
    #[must_use]
    pub fn mapped_page_count(&self) -> usize {
        self.inner.page_map.len()
    }

    /// Bytes of page memory per normal page.
    #[must_use]
    pub const fn page_size() -> usize {
        PAGE_SIZE
    }
}

/// Guard keeping the current thread attached to a [`Collector`].
///
/// Dereferences to the thread's [`ThreadState`]. Dropping it runs the
/// termination collections and orphans the remaining pages.
pub struct AttachedThread {
    state: Arc<ThreadState>,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl std::ops::Deref for AttachedThread {
    type Target = ThreadState;

    fn deref(&self) -> &ThreadState {
        &self.state
    }
}

impl std::fmt::Debug for AttachedThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AttachedThread").field(&self.state).finish()
    }
}

impl Drop for AttachedThread {
    fn drop(&mut self) {
        let collector = Arc::clone(self.state.collector());
        collector.detach(&self.state);
        ThreadState::set_current(None);
    }
}

impl CollectorInner {
    /// Takes the registry lock from an attached thread, staying in a
    /// safepoint while blocked so a collecting lock holder can proceed.
    fn lock_threads<'a>(&'a self, state: &ThreadState) -> ReentrantMutexGuard<'a, RefCell<Vec<Arc<ThreadState>>>> {
        if let Some(guard) = self.threads.try_lock() {
            return guard;
        }
        state.enter_safe_point(StackState::HeapPointersOnStack, 0);
        let mut guard = self.threads.lock();
        state.leave_blocking_safe_point(|park| ReentrantMutexGuard::unlocked(&mut guard, park));
        guard
    }

    /// One stop-the-world cycle started by `current`.
    pub(crate) fn collect_garbage(
        &self,
        current: &ThreadState,
        stack_state: StackState,
        sweep_kind: SweepKind,
        reason: GcReason,
    ) -> CollectOutcome {
        assert!(
            !current.is_gc_forbidden() && current.gc_state() != GcState::GcRunning,
            "nested garbage collection"
        );
        assert!(
            !current.is_sweep_forbidden(),
            "garbage collection inside a finalizer or pre-finalizer"
        );
        current.complete_sweep();
        let _forbidden = current.enter_gc_forbidden_scope();

        let started = Instant::now();
        current.enter_safe_point(stack_state, 0);
        let guard = self.threads.lock();
        let threads = guard.borrow().clone();

        if !self.barrier.park_others(current, &threads, self.config.park_timeout) {
            drop(guard);
            current.leave_safe_point();
            return CollectOutcome::Abandoned;
        }

        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_collection(reason.as_str(), next_gc_id());

        let mut metrics = GcMetrics::new(reason, stack_state, sweep_kind);
        metrics.thread_count = threads.len();
        let mut timer = PhaseTimer::new();

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::Prepare);
            for state in &threads {
                state.set_gc_state(GcState::GcRunning);
                // SAFETY: every other thread is parked and `current` is here.
                unsafe { state.heap_mut() }.make_consistent_for_gc();
            }
        }
        metrics.prepare_duration = timer.end();

        let mut worklists = self.worklists.lock();
        worklists.clear();
        let mut visitor = Visitor::new(
            VisitorKind::GlobalMarking,
            &mut worklists,
            &self.page_map,
            std::ptr::null(),
        );

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::Mark);
            let tracers: Vec<_> = self
                .root_tracers
                .lock()
                .iter()
                .map(|(_, tracer)| Arc::clone(tracer))
                .collect();
            for tracer in tracers {
                tracer(&mut visitor);
            }
            self.cross_thread_persistents.lock().trace(&mut visitor);
            for state in &threads {
                state.trace_persistents(&mut visitor);
            }
            for state in &threads {
                state.scan_stack(&mut visitor);
            }
            metrics.ephemeron_passes = visitor.mark_to_fixed_point();
            visitor.run_post_marking_callbacks();
        }
        metrics.mark_duration = timer.end();
        metrics.marked_bytes = visitor.marked_bytes();
        metrics.marked_objects = visitor.marked_objects();
        log_marking_done(metrics.marked_bytes, metrics.ephemeron_passes);

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::WeakProcessing);
            for state in &threads {
                state.process_weak(&visitor);
            }
            visitor.process_global_weak_callbacks();
            let (released, quarantined) = self.orphaned_pages.decommit_orphaned_pages(
                &self.free_pages,
                &self.page_map,
                &self.stats,
            );
            metrics.orphaned_pages_decommitted = released;
            log_orphans_decommitted(released, quarantined);
        }
        metrics.weak_duration = timer.end();
        drop(visitor);
        drop(worklists);

        let scheduled = match sweep_kind {
            SweepKind::Eager => GcState::EagerSweepScheduled,
            SweepKind::Lazy => GcState::LazySweepScheduled,
        };
        for state in &threads {
            state.set_gc_state(scheduled);
            // SAFETY: as above.
            unsafe { state.heap_mut() }.prepare_for_sweep();
        }
        self.stats.marking_done(metrics.marked_bytes);
        metrics.total_collections = self.total_collections.fetch_add(1, Ordering::Relaxed) + 1;

        self.barrier.resume_others(&threads);
        metrics.pause = started.elapsed();
        drop(guard);

        current.leave_safe_point_without_sweep();
        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::Sweep);
            current.pre_sweep();
        }
        metrics.sweep_duration = timer.end();

        *self.last_metrics.lock() = Some(metrics);
        CollectOutcome::Completed(metrics)
    }

    /// Collects only `state`'s heap, rooted by its own persistents.
    ///
    /// Pages of other threads are neither traced nor swept and count as
    /// alive. Runs while `state` holds the registry lock.
    fn collect_terminating_thread(&self, state: &ThreadState) {
        state.set_gc_state(GcState::GcRunning);
        // SAFETY: only the terminating thread touches its heap.
        unsafe { state.heap_mut() }.make_consistent_for_gc();
        {
            let mut worklists = self.worklists.lock();
            worklists.clear();
            let mut visitor = Visitor::new(
                VisitorKind::ThreadLocalMarking,
                &mut worklists,
                &self.page_map,
                std::ptr::from_ref(state),
            );
            state.trace_persistents(&mut visitor);
            visitor.mark_to_fixed_point();
            visitor.run_post_marking_callbacks();
            state.process_weak(&visitor);
            visitor.process_global_weak_callbacks();
        }
        state.set_gc_state(GcState::EagerSweepScheduled);
        // SAFETY: as above.
        unsafe { state.heap_mut() }.prepare_for_sweep();
        state.pre_sweep();
    }

    /// Runs the termination collections of `state`, orphans its pages and
    /// removes it from the registry.
    fn detach(&self, state: &Arc<ThreadState>) {
        let guard = self.lock_threads(state);
        state.complete_sweep();
        // Handles into this heap go before the first sweep; termination
        // marking does not trace them.
        self.cross_thread_persistents
            .lock()
            .clear_owned_by(Arc::as_ptr(state));
        {
            let _forbidden = state.enter_gc_forbidden_scope();
            loop {
                let before = state.persistent_count();
                self.collect_terminating_thread(state);
                if state.persistent_count() == before {
                    break;
                }
            }
        }
        debug_assert_eq!(
            state.persistent_count(),
            0,
            "persistent handles outlive their thread"
        );
        let ctx = state.heap_context();
        // SAFETY: the thread is about to leave; nothing allocates any more.
        unsafe { state.heap_mut() }.orphan_pages(&ctx);
        let count = {
            let mut threads = guard.borrow_mut();
            threads.retain(|registered| !Arc::ptr_eq(registered, state));
            threads.len()
        };
        drop(guard);
        log_thread_attach(false, count);
    }
}
