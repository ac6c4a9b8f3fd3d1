//! Per-thread heap state.
//!
//! Every attached thread owns a [`ThreadState`]: its arenas, its GC state
//! machine, its safepoint bookkeeping, its roots and its pre-finalizers.
//! Only the owner mutates the heap, except while it is parked, when the
//! collecting thread takes over.

use std::cell::{Cell, UnsafeCell};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::gc::{
    CallbackStack, CollectOutcome, CollectorInner, GcReason, GcState, GcStateCell, Interruptor,
    StackState, SweepKind, SweepProgress, SweepScheduler,
};
use crate::gc_info::{GcInfo, GcInfoIndex};
use crate::heap::{
    allocation_size_from_size, ArenaIndex, BasePage, HeapContext, ObjectHeader, ThreadHeap,
    ALLOCATION_GRANULARITY, HEADER_SIZE,
};
use crate::persistent::PersistentRegion;
use crate::stack::{copy_stack_range, current_stack_position, spill_registers, REGISTER_COUNT};
use crate::trace::{Trace, Visitor, WeakCallback};
use crate::Gc;

thread_local! {
    static CURRENT: Cell<*const ThreadState> = const { Cell::new(ptr::null()) };
}

/// Cleanup that runs after marking and before sweeping, while every object
/// on the heap, dead or alive, is still intact.
///
/// Register with [`ThreadState::register_pre_finalizer`].
pub trait PreFinalize {
    /// Called once for a dead object, in reverse registration order.
    fn pre_finalize(&self);
}

#[derive(Clone, Copy)]
struct PreFinalizerEntry {
    object: *const u8,
    callback: unsafe fn(*const u8),
}

unsafe fn invoke_pre_finalizer<T: PreFinalize>(object: *const u8) {
    // SAFETY: registered with the payload of a `T` that is not swept yet.
    unsafe { &*object.cast::<T>() }.pre_finalize();
}

/// Stack snapshot taken when the thread enters a safepoint.
struct SafePointState {
    stack_state: StackState,
    at_safe_point: bool,
    stack_end: usize,
    /// Address of the innermost [`SafePointScope`](crate::SafePointScope), or 0.
    marker: usize,
    stack_copy: Vec<usize>,
    registers: [usize; REGISTER_COUNT],
}

/// Heap and GC bookkeeping of one attached thread.
pub struct ThreadState {
    collector: Arc<CollectorInner>,
    heap: UnsafeCell<ThreadHeap>,
    gc_state: GcStateCell,
    /// Request made between marking and the start of sweeping.
    deferred_request: Mutex<Option<GcState>>,
    thread_id: ThreadId,
    stack_start: usize,
    safe_point: Mutex<SafePointState>,
    interruptors: Mutex<Vec<Arc<dyn Interruptor>>>,
    pub(crate) persistents: Mutex<PersistentRegion>,
    pub(crate) weak_persistents: Mutex<PersistentRegion>,
    pre_finalizers: Mutex<Vec<PreFinalizerEntry>>,
    weak_callbacks: Mutex<CallbackStack<WeakCallback>>,
    sweep_forbidden: AtomicBool,
    no_allocation_count: AtomicUsize,
    gc_forbidden_count: AtomicUsize,
    sweep_scheduler: Mutex<Option<Arc<dyn SweepScheduler>>>,
}

// SAFETY: the heap is only touched by the owner, or by the collector while
// the owner is parked; every other field is synchronised.
unsafe impl Send for ThreadState {}
// SAFETY: as above.
unsafe impl Sync for ThreadState {}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("thread_id", &self.thread_id)
            .field("gc_state", &self.gc_state())
            .finish_non_exhaustive()
    }
}

struct SweepScope<'a>(&'a ThreadState);

impl<'a> SweepScope<'a> {
    /// Finalizers run inside: no allocation, no nested sweeping.
    fn new(state: &'a ThreadState) -> Self {
        let was_forbidden = state.sweep_forbidden.swap(true, Ordering::Relaxed);
        debug_assert!(!was_forbidden, "nested sweep");
        state.no_allocation_count.fetch_add(1, Ordering::Relaxed);
        Self(state)
    }
}

impl Drop for SweepScope<'_> {
    fn drop(&mut self) {
        self.0.no_allocation_count.fetch_sub(1, Ordering::Relaxed);
        self.0.sweep_forbidden.store(false, Ordering::Relaxed);
    }
}

/// Forbids sweeping without forbidding allocation.
struct SweepForbiddenScope<'a>(&'a ThreadState);

impl<'a> SweepForbiddenScope<'a> {
    fn new(state: &'a ThreadState) -> Self {
        let was_forbidden = state.sweep_forbidden.swap(true, Ordering::Relaxed);
        debug_assert!(!was_forbidden, "pre-finalizers run outside of sweeping");
        Self(state)
    }
}

impl Drop for SweepForbiddenScope<'_> {
    fn drop(&mut self) {
        self.0.sweep_forbidden.store(false, Ordering::Relaxed);
    }
}

/// RAII guard forbidding heap allocation on the current thread.
#[must_use = "allocation is allowed again once the scope is dropped"]
pub struct NoAllocationScope<'a>(&'a ThreadState);

impl Drop for NoAllocationScope<'_> {
    fn drop(&mut self) {
        self.0.no_allocation_count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// RAII guard forbidding collections triggered by this thread.
#[must_use = "collections are allowed again once the scope is dropped"]
pub struct GcForbiddenScope<'a>(&'a ThreadState);

impl Drop for GcForbiddenScope<'_> {
    fn drop(&mut self) {
        self.0.gc_forbidden_count.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ThreadState {
    pub(crate) fn new(collector: Arc<CollectorInner>) -> Self {
        Self {
            collector,
            heap: UnsafeCell::new(ThreadHeap::new()),
            gc_state: GcStateCell::new(),
            deferred_request: Mutex::new(None),
            thread_id: std::thread::current().id(),
            stack_start: crate::stack::get_stack_bounds().bottom,
            safe_point: Mutex::new(SafePointState {
                stack_state: StackState::HeapPointersOnStack,
                at_safe_point: false,
                stack_end: 0,
                marker: 0,
                stack_copy: Vec::new(),
                registers: [0; REGISTER_COUNT],
            }),
            interruptors: Mutex::new(Vec::new()),
            persistents: Mutex::new(PersistentRegion::new()),
            weak_persistents: Mutex::new(PersistentRegion::new()),
            pre_finalizers: Mutex::new(Vec::new()),
            weak_callbacks: Mutex::new(CallbackStack::new()),
            sweep_forbidden: AtomicBool::new(false),
            no_allocation_count: AtomicUsize::new(0),
            gc_forbidden_count: AtomicUsize::new(0),
            sweep_scheduler: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Current thread
    // ------------------------------------------------------------------

    pub(crate) fn set_current(state: Option<&Arc<Self>>) {
        CURRENT.with(|current| current.set(state.map_or(ptr::null(), Arc::as_ptr)));
    }

    /// The state of the current thread, if it is attached.
    #[must_use]
    pub fn current() -> Option<Arc<Self>> {
        let state = CURRENT.with(Cell::get);
        if state.is_null() {
            return None;
        }
        // SAFETY: the pointer comes from `Arc::as_ptr` and the attached
        // thread keeps one strong reference while it is set.
        unsafe {
            Arc::increment_strong_count(state);
            Some(Arc::from_raw(state))
        }
    }

    pub(crate) fn current_or_panic() -> Arc<Self> {
        let Some(state) = Self::current() else {
            panic!("the current thread is not attached to a collector");
        };
        state
    }

    pub(crate) fn with_current<R>(f: impl FnOnce(&Self) -> R) -> R {
        let state = CURRENT.with(Cell::get);
        assert!(
            !state.is_null(),
            "the current thread is not attached to a collector"
        );
        // SAFETY: see `current`.
        f(unsafe { &*state })
    }

    pub(crate) const fn collector(&self) -> &Arc<CollectorInner> {
        &self.collector
    }

    fn check_thread(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.thread_id,
            "thread state used from a foreign thread"
        );
    }

    /// # Safety
    ///
    /// The caller is the owner thread, or the owner is parked and the caller
    /// holds the attach lock. No other reference to the heap may be live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn heap_mut(&self) -> &mut ThreadHeap {
        // SAFETY: forwarded from the caller.
        unsafe { &mut *self.heap.get() }
    }

    pub(crate) fn heap_context(&self) -> HeapContext<'_> {
        let collector = &*self.collector;
        HeapContext {
            config: &collector.config,
            free_pages: &collector.free_pages,
            orphaned_pages: &collector.orphaned_pages,
            page_map: &collector.page_map,
            stats: &collector.stats,
            owner: ptr::from_ref(self),
        }
    }

    // ------------------------------------------------------------------
    // GC state machine
    // ------------------------------------------------------------------

    /// The current state of this thread's state machine.
    #[must_use]
    pub fn gc_state(&self) -> GcState {
        self.gc_state.get()
    }

    pub(crate) fn set_gc_state(&self, next: GcState) {
        self.gc_state.set(next);
    }

    /// Requests an idle-time collection.
    pub fn schedule_idle_gc(&self) {
        match self.gc_state() {
            GcState::NoGcScheduled | GcState::IdleGcScheduled => {
                self.set_gc_state(GcState::IdleGcScheduled);
                if let Some(scheduler) = self.sweep_scheduler() {
                    scheduler.schedule_idle_gc();
                }
            }
            GcState::Sweeping | GcState::SweepingAndIdleGcScheduled => {
                self.set_gc_state(GcState::SweepingAndIdleGcScheduled);
            }
            GcState::EagerSweepScheduled | GcState::LazySweepScheduled => {
                self.deferred_request
                    .lock()
                    .get_or_insert(GcState::IdleGcScheduled);
            }
            _ => {}
        }
    }

    /// Requests a precise collection at the next safepoint without heap
    /// pointers on the stack.
    pub fn schedule_precise_gc(&self) {
        match self.gc_state() {
            GcState::NoGcScheduled | GcState::IdleGcScheduled | GcState::PreciseGcScheduled => {
                self.set_gc_state(GcState::PreciseGcScheduled);
            }
            GcState::Sweeping
            | GcState::SweepingAndIdleGcScheduled
            | GcState::SweepingAndPreciseGcScheduled => {
                self.set_gc_state(GcState::SweepingAndPreciseGcScheduled);
            }
            GcState::EagerSweepScheduled | GcState::LazySweepScheduled => {
                *self.deferred_request.lock() = Some(GcState::PreciseGcScheduled);
            }
            _ => {}
        }
    }

    /// Requests a collect-all at the next safepoint.
    pub fn schedule_full_gc(&self) {
        self.check_thread();
        self.complete_sweep();
        if matches!(
            self.gc_state(),
            GcState::NoGcScheduled
                | GcState::IdleGcScheduled
                | GcState::PreciseGcScheduled
                | GcState::FullGcScheduled
        ) {
            self.set_gc_state(GcState::FullGcScheduled);
        }
    }

    /// Runs a pending precise or full collection.
    ///
    /// Requests only run when the stack holds no heap pointers.
    pub fn run_scheduled_gc(&self, stack_state: StackState) {
        if stack_state == StackState::HeapPointersOnStack || self.is_gc_forbidden() {
            return;
        }
        match self.gc_state() {
            GcState::FullGcScheduled => {
                self.collect_all_garbage();
            }
            GcState::PreciseGcScheduled => {
                self.collect_garbage(
                    StackState::NoHeapPointersOnStack,
                    SweepKind::Lazy,
                    GcReason::PreciseGc,
                );
            }
            _ => {}
        }
    }

    /// Runs a pending idle collection if `deadline` has not passed.
    ///
    /// Returns whether a collection ran.
    pub fn perform_idle_gc(&self, deadline: Instant) -> bool {
        self.check_thread();
        if self.gc_state() != GcState::IdleGcScheduled || self.is_gc_forbidden() {
            return false;
        }
        if Instant::now() >= deadline {
            if let Some(scheduler) = self.sweep_scheduler() {
                scheduler.schedule_idle_gc();
            }
            return false;
        }
        self.collect_garbage(
            StackState::NoHeapPointersOnStack,
            SweepKind::Lazy,
            GcReason::IdleGc,
        )
        .is_completed()
    }

    fn schedule_gc_if_needed(&self) {
        if self.is_gc_forbidden() || self.is_sweep_forbidden() {
            return;
        }
        if matches!(
            self.gc_state(),
            GcState::GcRunning | GcState::EagerSweepScheduled | GcState::LazySweepScheduled
        ) {
            return;
        }
        let config = &self.collector.config;
        let stats = &self.collector.stats;
        let allocated = stats.allocated_bytes_since_last_gc();
        let marked = stats.marked_bytes();
        if config.conservative_gc_threshold.is_exceeded(allocated, marked) {
            self.collect_garbage(
                StackState::HeapPointersOnStack,
                SweepKind::Eager,
                GcReason::ConservativeGc,
            );
        } else if config.precise_gc_threshold.is_exceeded(allocated, marked) {
            self.schedule_precise_gc();
        } else if config.idle_gc_threshold.is_exceeded(allocated, marked) {
            self.schedule_idle_gc();
        }
    }

    /// Runs a full collection cycle.
    ///
    /// # Panics
    ///
    /// Panics when called during a collection, from a finalizer, or from a
    /// pre-finalizer.
    pub fn collect_garbage(
        &self,
        stack_state: StackState,
        sweep_kind: SweepKind,
        reason: GcReason,
    ) -> CollectOutcome {
        self.check_thread();
        let collector = Arc::clone(&self.collector);
        collector.collect_garbage(self, stack_state, sweep_kind, reason)
    }

    /// Repeats eager precise collections until the marked size stops
    /// changing. Returns the number of completed cycles.
    pub fn collect_all_garbage(&self) -> usize {
        let mut previous = None;
        let mut rounds = 0;
        for _ in 0..self.collector.config.collect_all_rounds {
            let outcome = self.collect_garbage(
                StackState::NoHeapPointersOnStack,
                SweepKind::Eager,
                GcReason::ForcedGc,
            );
            let Some(metrics) = outcome.metrics() else {
                break;
            };
            rounds += 1;
            if previous == Some(metrics.marked_bytes) {
                break;
            }
            previous = Some(metrics.marked_bytes);
        }
        rounds
    }

    // ------------------------------------------------------------------
    // Forbidden scopes
    // ------------------------------------------------------------------

    pub(crate) fn is_sweep_forbidden(&self) -> bool {
        self.sweep_forbidden.load(Ordering::Relaxed)
    }

    /// Whether collections are currently forbidden on this thread.
    #[must_use]
    pub fn is_gc_forbidden(&self) -> bool {
        self.gc_forbidden_count.load(Ordering::Relaxed) > 0
    }

    /// Whether allocation is currently allowed on this thread.
    #[must_use]
    pub fn is_allocation_allowed(&self) -> bool {
        self.no_allocation_count.load(Ordering::Relaxed) == 0
    }

    /// Forbids allocation until the returned guard is dropped.
    pub fn enter_no_allocation_scope(&self) -> NoAllocationScope<'_> {
        self.no_allocation_count.fetch_add(1, Ordering::Relaxed);
        NoAllocationScope(self)
    }

    /// Forbids collections until the returned guard is dropped.
    pub fn enter_gc_forbidden_scope(&self) -> GcForbiddenScope<'_> {
        self.gc_forbidden_count.fetch_add(1, Ordering::Relaxed);
        GcForbiddenScope(self)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates `value` on this thread's heap.
    ///
    /// # Panics
    ///
    /// Panics if allocation is forbidden or `T` needs more than 8-byte
    /// alignment.
    pub fn allocate<T: Trace + 'static>(&self, value: T) -> Gc<T> {
        assert!(
            std::mem::align_of::<T>() <= ALLOCATION_GRANULARITY,
            "heap objects are at most {ALLOCATION_GRANULARITY}-byte aligned"
        );
        let payload = self.allocate_raw(std::mem::size_of::<T>(), GcInfo::index_of::<T>());
        let object = payload.as_ptr().cast::<T>();
        // SAFETY: the payload is fresh, large enough and suitably aligned.
        unsafe {
            object.write(value);
            Gc::from_raw(object)
        }
    }

    /// Allocates `size` zeroed payload bytes described by `gc_info_index`.
    ///
    /// Requests of at least the configured large-object threshold get a
    /// page of their own.
    ///
    /// # Panics
    ///
    /// Panics if allocation is forbidden on this thread.
    pub fn allocate_raw(&self, size: usize, gc_info_index: GcInfoIndex) -> NonNull<u8> {
        self.check_thread();
        assert!(
            self.is_allocation_allowed(),
            "allocation is forbidden in this scope"
        );
        let header = if size >= self.collector.config.large_object_threshold {
            let address = self.allocate_large_object(size);
            // SAFETY: the address is the header slot of a fresh large page.
            let header = unsafe { ObjectHeader::write_large_object(address, gc_info_index) };
            self.collector
                .stats
                .increase_allocated(HEADER_SIZE + size);
            header
        } else {
            let allocation_size = allocation_size_from_size(size);
            let arena = ArenaIndex::for_allocation_size(allocation_size).as_usize();
            let address = self.allocate_object(arena, allocation_size);
            // SAFETY: the arena handed out `allocation_size` unused bytes.
            let header =
                unsafe { ObjectHeader::write_object(address, allocation_size, gc_info_index) };
            #[cfg(feature = "delayed-reuse")]
            // SAFETY: the payload belongs to the new object.
            unsafe {
                ptr::write_bytes(header.payload(), 0, allocation_size - HEADER_SIZE);
            }
            self.collector.stats.increase_allocated(allocation_size);
            header
        };
        // SAFETY: payloads are never null.
        unsafe { NonNull::new_unchecked(header.payload()) }
    }

    fn can_sweep(&self) -> bool {
        self.gc_state().is_sweeping() && !self.is_sweep_forbidden()
    }

    fn allocate_object(&self, arena_index: usize, allocation_size: usize) -> NonNull<u8> {
        {
            let ctx = self.heap_context();
            // SAFETY: the owner thread allocates and is not parked.
            let arena = &mut unsafe { self.heap_mut() }.normal[arena_index];
            if let Some(address) = arena.allocate_from_bump(allocation_size) {
                return address;
            }
            if let Some(address) = arena.allocate_from_free_list(allocation_size) {
                return address;
            }
            if self.can_sweep() {
                let _scope = SweepScope::new(self);
                if let Some(address) = arena.lazy_sweep(allocation_size, &ctx) {
                    return address;
                }
            }
            if arena.promptly_freed_size() >= self.collector.config.promptly_freed_coalesce_threshold
            {
                arena.coalesce();
                if let Some(address) = arena.allocate_from_free_list(allocation_size) {
                    return address;
                }
            }
        }
        self.complete_sweep();
        self.schedule_gc_if_needed();

        let ctx = self.heap_context();
        // SAFETY: as above; a collection run by the heuristics is over.
        let arena = &mut unsafe { self.heap_mut() }.normal[arena_index];
        if let Some(address) = arena.allocate_from_free_list(allocation_size) {
            return address;
        }
        arena.allocate_page(&ctx);
        match arena.allocate_from_free_list(allocation_size) {
            Some(address) => address,
            None => panic!("a fresh page cannot serve {allocation_size} bytes"),
        }
    }

    fn allocate_large_object(&self, payload_size: usize) -> NonNull<u8> {
        let allocation_size = HEADER_SIZE + payload_size;
        if self.can_sweep() {
            let ctx = self.heap_context();
            let swept_enough = {
                let _scope = SweepScope::new(self);
                // SAFETY: the owner thread allocates and is not parked.
                unsafe { self.heap_mut() }
                    .large
                    .lazy_sweep(allocation_size, &ctx)
            };
            if swept_enough {
                // SAFETY: as above.
                return unsafe { self.heap_mut() }
                    .large
                    .allocate_page(payload_size, &ctx);
            }
        }
        self.complete_sweep();
        self.schedule_gc_if_needed();
        let ctx = self.heap_context();
        // SAFETY: as above.
        unsafe { self.heap_mut() }
            .large
            .allocate_page(payload_size, &ctx)
    }

    /// Frees an object right away instead of waiting for a collection.
    ///
    /// The finalizer runs immediately. Nothing happens while sweeping is
    /// pending or in progress, inside finalizers, or for objects of other
    /// threads. Returns whether the object was freed.
    ///
    /// # Safety
    ///
    /// Nothing may reference the object any more.
    pub unsafe fn promptly_free<T>(&self, gc: Gc<T>) -> bool {
        self.check_thread();
        if !self.is_allocation_allowed()
            || self.is_sweep_forbidden()
            || self.gc_state().is_sweeping()
            || matches!(
                self.gc_state(),
                GcState::EagerSweepScheduled | GcState::LazySweepScheduled
            )
        {
            return false;
        }
        let payload = Gc::as_ptr(&gc).cast::<u8>();
        // SAFETY: a `Gc` points at a heap payload.
        let page = unsafe { BasePage::from_payload(payload).as_ref() };
        if page.owner() != ptr::from_ref(self) {
            return false;
        }
        self.pre_finalizers
            .lock()
            .retain(|entry| entry.object != payload);
        // SAFETY: as above.
        let header = unsafe { ObjectHeader::from_payload(payload) };
        let _scope = SweepScope::new(self);
        // SAFETY: owner thread; the caller guarantees the object is unreferenced.
        let heap = unsafe { self.heap_mut() };
        let freed = if header.is_large_object() {
            // SAFETY: large headers live on large pages.
            let size = HEADER_SIZE + unsafe { page.as_large() }.payload_size();
            // SAFETY: forwarded from the caller.
            unsafe { heap.large.promptly_free(header) };
            size
        } else {
            // SAFETY: forwarded from the caller.
            unsafe { heap.normal[page.arena_index().as_usize()].promptly_free(header) }
        };
        self.collector.stats.decrease_live(freed);
        true
    }

    // ------------------------------------------------------------------
    // Sweeping
    // ------------------------------------------------------------------

    /// Runs pre-finalizers and starts sweeping after a marking phase.
    pub(crate) fn pre_sweep(&self) {
        let eager = match self.gc_state() {
            GcState::EagerSweepScheduled => true,
            GcState::LazySweepScheduled => false,
            _ => return,
        };
        self.invoke_pre_finalizers();
        self.set_gc_state(GcState::Sweeping);
        let deferred = self.deferred_request.lock().take();
        match deferred {
            Some(GcState::PreciseGcScheduled) => self.schedule_precise_gc(),
            Some(_) => self.schedule_idle_gc(),
            None => {}
        }
        if eager {
            self.complete_sweep();
        } else if let Some(scheduler) = self.sweep_scheduler() {
            scheduler.schedule_idle_lazy_sweep();
        }
    }

    /// Sweeps every remaining page.
    pub fn complete_sweep(&self) {
        if !self.can_sweep() {
            return;
        }
        let freed = {
            let _scope = SweepScope::new(self);
            let ctx = self.heap_context();
            // SAFETY: the owner thread sweeps and is not parked.
            unsafe { self.heap_mut() }.complete_sweep(&ctx)
        };
        crate::tracing::internal::log_sweep(freed, true);
        self.post_sweep();
    }

    fn post_sweep(&self) {
        let next = self.gc_state().after_sweep();
        self.set_gc_state(next);
        if next == GcState::IdleGcScheduled {
            if let Some(scheduler) = self.sweep_scheduler() {
                scheduler.schedule_idle_gc();
            }
        }
    }

    /// Sweeps pages until `deadline` passes or nothing is left.
    pub fn perform_idle_lazy_sweep(&self, deadline: Instant) -> SweepProgress {
        self.check_thread();
        let mut progress = SweepProgress::default();
        if !self.gc_state().is_sweeping() {
            // SAFETY: owner thread.
            progress.completed = !unsafe { self.heap_mut() }.has_unswept_pages();
            return progress;
        }
        if self.is_sweep_forbidden() {
            return progress;
        }
        {
            let _scope = SweepScope::new(self);
            let ctx = self.heap_context();
            // SAFETY: owner thread.
            let heap = unsafe { self.heap_mut() };
            while Instant::now() < deadline {
                let Some(result) = heap.sweep_one_page(&ctx) else {
                    progress.completed = true;
                    break;
                };
                progress.pages_swept += 1;
                progress.freed_bytes += result.freed_bytes;
            }
            if !progress.completed && !heap.has_unswept_pages() {
                progress.completed = true;
            }
        }
        crate::tracing::internal::log_sweep(progress.freed_bytes, false);
        if progress.completed {
            self.post_sweep();
        } else if let Some(scheduler) = self.sweep_scheduler() {
            scheduler.schedule_idle_lazy_sweep();
        }
        progress
    }

    /// Whether pages are waiting to be swept.
    #[must_use]
    pub fn has_unswept_pages(&self) -> bool {
        // SAFETY: read-only access on the owner thread.
        unsafe { self.heap_mut() }.has_unswept_pages()
    }

    /// Installs the hook notified about pending idle work.
    pub fn set_sweep_scheduler(&self, scheduler: Option<Arc<dyn SweepScheduler>>) {
        *self.sweep_scheduler.lock() = scheduler;
    }

    fn sweep_scheduler(&self) -> Option<Arc<dyn SweepScheduler>> {
        self.sweep_scheduler.lock().clone()
    }

    // ------------------------------------------------------------------
    // Pre-finalizers
    // ------------------------------------------------------------------

    /// Runs `gc.pre_finalize()` once the object is found dead, before any
    /// object of that cycle is swept.
    ///
    /// # Panics
    ///
    /// Panics if the object already has a registration.
    pub fn register_pre_finalizer<T: PreFinalize + Trace + 'static>(&self, gc: Gc<T>) {
        let object = Gc::as_ptr(&gc).cast::<u8>();
        let mut entries = self.pre_finalizers.lock();
        assert!(
            !entries.iter().any(|entry| entry.object == object),
            "pre-finalizer registered twice"
        );
        entries.push(PreFinalizerEntry {
            object,
            callback: invoke_pre_finalizer::<T>,
        });
    }

    /// Removes the registration made by
    /// [`ThreadState::register_pre_finalizer`].
    ///
    /// # Panics
    ///
    /// Panics if the object has no registration.
    pub fn unregister_pre_finalizer<T>(&self, gc: Gc<T>) {
        let object = Gc::as_ptr(&gc).cast::<u8>();
        let mut entries = self.pre_finalizers.lock();
        let Some(position) = entries.iter().position(|entry| entry.object == object) else {
            panic!("pre-finalizer was not registered");
        };
        entries.remove(position);
    }

    fn invoke_pre_finalizers(&self) {
        let mut dead = Vec::new();
        self.pre_finalizers.lock().retain(|entry| {
            // SAFETY: registered objects are not swept before their entry goes.
            let alive = unsafe { ObjectHeader::from_payload(entry.object) }.is_marked();
            if !alive {
                dead.push(*entry);
            }
            alive
        });
        if dead.is_empty() {
            return;
        }
        let _scope = SweepForbiddenScope::new(self);
        for entry in dead.iter().rev() {
            // SAFETY: the object is dead but intact until swept.
            unsafe { (entry.callback)(entry.object) };
        }
    }

    // ------------------------------------------------------------------
    // Roots and weak processing
    // ------------------------------------------------------------------

    /// Number of live [`Persistent`](crate::Persistent) handles of this thread.
    #[must_use]
    pub fn persistent_count(&self) -> usize {
        self.persistents.lock().count()
    }

    pub(crate) fn trace_persistents(&self, visitor: &mut Visitor<'_>) {
        self.persistents.lock().trace(visitor);
    }

    pub(crate) fn push_weak_callback(&self, object: *const u8, callback: WeakCallback) {
        self.weak_callbacks.lock().push(object, callback);
    }

    /// Runs this thread's weak callbacks and clears dead weak persistents.
    pub(crate) fn process_weak(&self, visitor: &Visitor<'_>) {
        let mut stack = std::mem::take(&mut *self.weak_callbacks.lock());
        visitor.process_weak_callbacks(&mut stack);
        *self.weak_callbacks.lock() = stack;
        self.weak_persistents.lock().clear_dead(visitor);
    }

    // ------------------------------------------------------------------
    // Safepoints
    // ------------------------------------------------------------------

    /// Registers an interruptor asked to bring this thread to a safepoint.
    pub fn add_interruptor(&self, interruptor: Arc<dyn Interruptor>) {
        self.interruptors.lock().push(interruptor);
    }

    /// Removes an interruptor added with [`ThreadState::add_interruptor`].
    pub fn remove_interruptor(&self, interruptor: &Arc<dyn Interruptor>) {
        self.interruptors
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, interruptor));
    }

    pub(crate) fn request_interrupts(&self) {
        for interruptor in self.interruptors.lock().iter() {
            interruptor.request_interrupt();
        }
    }

    pub(crate) fn clear_interrupts(&self) {
        for interruptor in self.interruptors.lock().iter() {
            interruptor.clear_interrupt();
        }
    }

    /// Whether another thread waits for this one to park.
    #[must_use]
    pub fn is_safe_point_requested(&self) -> bool {
        self.collector.barrier.is_park_requested()
    }

    /// A point where the thread can run scheduled collections and park for
    /// collections of other threads.
    pub fn safe_point(&self, stack_state: StackState) {
        self.check_thread();
        self.run_scheduled_gc(stack_state);
        if self.is_safe_point_requested() && !self.is_sweep_forbidden() {
            self.park(stack_state);
        }
        self.pre_sweep();
    }

    /// Records the stack and parks until the pending collection finishes.
    fn park(&self, stack_state: StackState) {
        self.record_stack(stack_state, 0);
        self.collector.barrier.check_and_park();
        self.safe_point.lock().at_safe_point = false;
    }

    pub(crate) fn enter_safe_point(&self, stack_state: StackState, marker: usize) {
        self.check_thread();
        self.record_stack(stack_state, marker);
        self.collector.barrier.enter_safe_point();
    }

    pub(crate) fn leave_safe_point(&self) {
        self.leave_safe_point_without_sweep();
        self.pre_sweep();
    }

    pub(crate) fn leave_safe_point_without_sweep(&self) {
        let stack_state = {
            let mut state = self.safe_point.lock();
            state.at_safe_point = false;
            state.stack_state
        };
        if self.collector.barrier.leave_safe_point() {
            self.park(stack_state);
        }
    }

    /// Locks `mutex`, entering a safepoint while blocked.
    ///
    /// If a collection is pending once the lock is taken, the mutex is
    /// released while this thread is parked and retaken afterwards.
    pub fn lock_safe_point_aware<'m, T>(&self, mutex: &'m Mutex<T>) -> MutexGuard<'m, T> {
        if let Some(guard) = mutex.try_lock() {
            return guard;
        }
        self.enter_safe_point(StackState::HeapPointersOnStack, 0);
        let mut guard = mutex.lock();
        self.leave_blocking_safe_point(|park| MutexGuard::unlocked(&mut guard, park));
        guard
    }

    /// Leaves a safepoint entered to block on a lock that is now held.
    ///
    /// `unlocked` runs the parking closure with that lock released.
    pub(crate) fn leave_blocking_safe_point(&self, unlocked: impl FnOnce(&dyn Fn())) {
        let stack_state = {
            let mut state = self.safe_point.lock();
            state.at_safe_point = false;
            state.stack_state
        };
        if self.collector.barrier.leave_safe_point() {
            unlocked(&|| self.park(stack_state));
        }
        self.pre_sweep();
    }

    #[inline(never)]
    fn record_stack(&self, stack_state: StackState, marker: usize) {
        let mut state = self.safe_point.lock();
        debug_assert!(!state.at_safe_point, "nested safepoint");
        spill_registers(&mut state.registers);
        let end = current_stack_position();
        state.stack_state = stack_state;
        state.at_safe_point = true;
        state.stack_end = end;
        state.marker = marker;
        state.stack_copy.clear();
        if stack_state == StackState::HeapPointersOnStack && marker > end {
            // SAFETY: `[end, marker)` is the live stack of this thread.
            unsafe { copy_stack_range(end, marker, &mut state.stack_copy) };
        }
    }

    /// Conservatively scans the stack recorded at the last safepoint.
    pub(crate) fn scan_stack(&self, visitor: &mut Visitor<'_>) {
        let state = self.safe_point.lock();
        if state.stack_state == StackState::NoHeapPointersOnStack {
            return;
        }
        for word in state.registers.iter().chain(state.stack_copy.iter()) {
            visitor.visit_conservatively(*word);
        }
        let from = if state.marker == 0 {
            state.stack_end
        } else {
            state.marker
        };
        let from = from & !(std::mem::size_of::<usize>() - 1);
        // SAFETY: the thread is parked or inside a safepoint scope, so the
        // frames above `from` stay in place.
        unsafe { visitor.scan_range(from as *const usize, self.stack_start as *const usize) };
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// The arena holding `gc`.
    #[must_use]
    pub fn arena_of<T>(&self, gc: &Gc<T>) -> ArenaIndex {
        // SAFETY: a `Gc` points at a heap payload.
        unsafe { BasePage::from_payload(Gc::as_ptr(gc).cast::<u8>()).as_ref() }.arena_index()
    }

    /// Pages owned by this thread.
    #[must_use]
    pub fn page_count(&self) -> usize {
        // SAFETY: read-only access on the owner thread.
        unsafe { self.heap_mut() }.page_count()
    }

    /// Copies header and payload bytes of every object, in heap order.
    #[doc(hidden)]
    #[must_use]
    pub fn heap_snapshot(&self) -> Vec<(usize, Vec<u8>)> {
        // SAFETY: read-only access on the owner thread.
        let heap = unsafe { self.heap_mut() };
        let mut snapshot = Vec::new();
        let mut copy = |header: &ObjectHeader, len: usize| {
            let start = header.address();
            // SAFETY: `[start, start + len)` is one object.
            let bytes = unsafe { std::slice::from_raw_parts(start, len) }.to_vec();
            snapshot.push((start as usize, bytes));
        };
        for arena in &heap.normal {
            arena.for_each_object(|header| copy(header, header.size()));
        }
        heap.large.for_each_object(|header| {
            // SAFETY: large headers live on large pages.
            let page = unsafe { BasePage::from_object_address(header.address()).as_ref() };
            // SAFETY: as above.
            let len = HEADER_SIZE + unsafe { page.as_large() }.payload_size();
            copy(header, len);
        });
        snapshot
    }

    /// Number of objects on this thread's heap, unswept garbage included.
    #[must_use]
    pub fn object_count(&self) -> usize {
        // SAFETY: read-only access on the owner thread.
        let heap = unsafe { self.heap_mut() };
        let mut count = 0;
        for arena in &heap.normal {
            arena.for_each_object(|_| count += 1);
        }
        heap.large.for_each_object(|_| count += 1);
        count
    }
}
