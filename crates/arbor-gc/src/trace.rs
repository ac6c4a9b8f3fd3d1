//! Trace trait and the marking visitor.
//!
//! Types that implement `Trace` can be stored in `Gc<T>` and will be
//! traversed during garbage collection.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, LinkedList, VecDeque};
use std::hash::BuildHasher;
use std::rc::Rc;
use std::sync::Arc;

use crate::gc::MarkingWorklists;
use crate::gc_info::TraceCallback;
use crate::heap::{BasePage, ObjectHeader, PageMap};
use crate::thread_state::ThreadState;
use crate::Gc;

// ============================================================================
// Core Traits
// ============================================================================

/// A type that can be traced by the garbage collector.
///
/// # Safety
///
/// Implementations **MUST** report every `Gc<T>` and `Member<T>` field by
/// tracing it with the visitor. A missed field is freed while still
/// reachable.
///
/// Prefer using `#[derive(Trace)]` instead of manual implementation.
///
/// # Examples
///
/// ```ignore
/// unsafe impl Trace for MyStruct {
///     fn trace(&self, visitor: &mut Visitor<'_>) {
///         self.child.trace(visitor);
///         self.children.trace(visitor);
///     }
/// }
/// ```
pub unsafe trait Trace {
    /// Visit every heap reference contained within this value.
    fn trace(&self, visitor: &mut Visitor<'_>);
}

/// Invoked after marking, before sweeping, for an object that registered it.
///
/// The callback may inspect liveness with
/// [`Visitor::is_heap_object_alive`] but cannot mark anything.
pub type WeakCallback = unsafe fn(&Visitor<'_>, *const u8);

// ============================================================================
// Concrete Visitor for GC
// ============================================================================

/// Marking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitorKind {
    /// Marks every attached thread's heap.
    GlobalMarking,
    /// Marks one terminating thread's heap; foreign pages are skipped and
    /// count as alive.
    ThreadLocalMarking,
}

/// The marking visitor handed to [`Trace::trace`].
pub struct Visitor<'a> {
    pub(crate) kind: VisitorKind,
    pub(crate) worklists: &'a mut MarkingWorklists,
    pub(crate) page_map: &'a PageMap,
    /// Thread whose heap is marked under [`VisitorKind::ThreadLocalMarking`].
    pub(crate) owner: *const ThreadState,
    /// Owner of the object whose trace callback is running.
    pub(crate) current_owner: *const ThreadState,
    pub(crate) marked_bytes: usize,
    pub(crate) marked_objects: usize,
}

impl<'a> Visitor<'a> {
    pub(crate) fn new(
        kind: VisitorKind,
        worklists: &'a mut MarkingWorklists,
        page_map: &'a PageMap,
        owner: *const ThreadState,
    ) -> Self {
        Self {
            kind,
            worklists,
            page_map,
            owner,
            current_owner: std::ptr::null(),
            marked_bytes: 0,
            marked_objects: 0,
        }
    }

    /// The marking mode.
    #[must_use]
    pub const fn kind(&self) -> VisitorKind {
        self.kind
    }

    /// Marks the object behind `gc` and schedules it for tracing.
    #[inline]
    pub fn visit<T: Trace>(&mut self, gc: &Gc<T>) {
        // SAFETY: a `Gc` always points at the payload of a heap object.
        unsafe { self.visit_raw(Gc::as_ptr(gc).cast::<u8>()) };
    }

    /// Marks the object whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be null or the payload address of a heap object.
    pub unsafe fn visit_raw(&mut self, payload: *const u8) {
        if payload.is_null() {
            return;
        }
        // SAFETY: heap payloads live on heap pages.
        let page = unsafe { BasePage::from_payload(payload).as_ref() };
        if !self.should_trace_page(page) {
            return;
        }
        // SAFETY: caller guarantees a payload address.
        let header = unsafe { ObjectHeader::from_payload(payload) };
        if header.is_free_or_promptly_freed() || header.is_dead() {
            return;
        }
        self.mark_header(page, header);
    }

    /// Whether the object at `payload` survived marking so far.
    #[must_use]
    pub fn is_heap_object_alive<T: Trace>(&self, gc: &Gc<T>) -> bool {
        // SAFETY: a `Gc` always points at the payload of a heap object.
        unsafe { self.is_alive_raw(Gc::as_ptr(gc).cast::<u8>()) }
    }

    /// Raw form of [`Visitor::is_heap_object_alive`].
    ///
    /// # Safety
    ///
    /// `payload` must be null or the payload address of a heap object.
    #[must_use]
    pub unsafe fn is_alive_raw(&self, payload: *const u8) -> bool {
        if payload.is_null() {
            return true;
        }
        // SAFETY: heap payloads live on heap pages.
        let page = unsafe { BasePage::from_payload(payload).as_ref() };
        if page.is_orphaned() {
            return false;
        }
        if self.kind == VisitorKind::ThreadLocalMarking && page.owner() != self.owner {
            return true;
        }
        // SAFETY: caller guarantees a payload address.
        unsafe { ObjectHeader::from_payload(payload) }.is_marked()
    }

    /// Runs `callback` with `object` during weak processing of this cycle.
    ///
    /// The callback lands on the weak worklist of the thread owning the
    /// object being traced, or on the global one outside of any trace.
    pub fn register_weak_callback(&mut self, object: *const u8, callback: WeakCallback) {
        if self.current_owner.is_null() {
            self.worklists.global_weak.push(object, callback);
            return;
        }
        // SAFETY: owners of traced pages stay attached during marking.
        unsafe { &*self.current_owner }.push_weak_callback(object, callback);
    }

    /// Runs `callback` with `object` during weak processing, independent of
    /// any thread.
    pub fn register_global_weak_callback(&mut self, object: *const u8, callback: WeakCallback) {
        self.worklists.global_weak.push(object, callback);
    }

    /// Runs `callback` once per pass of the ephemeron fixed point.
    ///
    /// The callback traces the values whose keys are alive; marking ends
    /// once a full pass marks nothing new.
    pub fn register_ephemeron_callback(&mut self, object: *const u8, callback: TraceCallback) {
        self.worklists.ephemerons.push(object, callback);
    }

    /// Runs `callback` after the fixed point, before weak processing.
    ///
    /// The callback must not mark objects.
    pub fn register_post_marking_callback(&mut self, object: *const u8, callback: TraceCallback) {
        self.worklists.post_marking.push(object, callback);
    }

    /// Bytes marked so far, headers included.
    #[must_use]
    pub const fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    pub(crate) fn should_trace_page(&self, page: &BasePage) -> bool {
        if page.is_orphaned() {
            page.mark_traced_after_orphaned();
            return false;
        }
        match self.kind {
            VisitorKind::GlobalMarking => true,
            VisitorKind::ThreadLocalMarking => page.owner() == self.owner,
        }
    }

    pub(crate) fn mark_header(&mut self, page: &BasePage, header: &ObjectHeader) {
        if !header.try_mark() {
            return;
        }
        let size = if header.is_large_object() {
            // SAFETY: large headers live on large pages.
            crate::heap::HEADER_SIZE + unsafe { page.as_large() }.payload_size()
        } else {
            header.size()
        };
        self.marked_bytes += size;
        self.marked_objects += 1;
        if let Some(index) = header.gc_info_index() {
            let trace = crate::gc_info::GcInfoTable::get(index).trace;
            self.worklists.marking.push(header.payload(), trace);
        }
    }
}

// ============================================================================
// Trace implementations for Gc<T>
// ============================================================================

// SAFETY: Gc<T> marks its target
unsafe impl<T: Trace> Trace for Gc<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit(self);
    }
}

// ============================================================================
// Trace implementations for primitive types
// ============================================================================

macro_rules! impl_trace_for_primitives {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: Primitive types contain no Gc pointers
            unsafe impl Trace for $t {
                #[inline]
                fn trace(&self, _visitor: &mut Visitor<'_>) {}
            }
        )*
    };
}

impl_trace_for_primitives! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool, char, (),
    String, str,
    std::time::Duration,
    std::time::Instant,
    std::path::PathBuf,
    std::sync::atomic::AtomicBool,
    std::sync::atomic::AtomicUsize,
    std::num::NonZeroU32,
    std::num::NonZeroU64,
    std::num::NonZeroUsize,
}

// ============================================================================
// Trace implementations for std container types
// ============================================================================

// SAFETY: References trace their target
unsafe impl<T: Trace + ?Sized> Trace for &T {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        T::trace(self, visitor);
    }
}

// SAFETY: Box traces its contents
unsafe impl<T: Trace + ?Sized> Trace for Box<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        T::trace(self.as_ref(), visitor);
    }
}

// SAFETY: Rc traces its contents
unsafe impl<T: Trace + ?Sized> Trace for Rc<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        T::trace(self.as_ref(), visitor);
    }
}

// SAFETY: Arc traces its contents
unsafe impl<T: Trace + ?Sized> Trace for Arc<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        T::trace(self.as_ref(), visitor);
    }
}

// SAFETY: Vec traces all elements
unsafe impl<T: Trace> Trace for Vec<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: Arrays trace all elements
unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: Slices trace all elements
unsafe impl<T: Trace> Trace for [T] {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: Option traces its contents if Some
unsafe impl<T: Trace> Trace for Option<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        if let Some(inner) = self {
            inner.trace(visitor);
        }
    }
}

// SAFETY: Result traces both Ok and Err variants
unsafe impl<T: Trace, E: Trace> Trace for Result<T, E> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        match self {
            Ok(v) => v.trace(visitor),
            Err(e) => e.trace(visitor),
        }
    }
}

// SAFETY: Cell<T> traces its contents (requires Copy to get value)
unsafe impl<T: Trace + Copy> Trace for Cell<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        self.get().trace(visitor);
    }
}

// SAFETY: RefCell traces its contents
unsafe impl<T: Trace + ?Sized> Trace for RefCell<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        // The world is stopped, so an outstanding mutable borrow belongs to
        // a parked frame; its stack is scanned instead.
        if let Ok(inner) = self.try_borrow() {
            inner.trace(visitor);
        }
    }
}

// SAFETY: VecDeque traces all elements
unsafe impl<T: Trace> Trace for VecDeque<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: LinkedList traces all elements
unsafe impl<T: Trace> Trace for LinkedList<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: HashMap traces all keys and values
unsafe impl<K: Trace, V: Trace, S: BuildHasher> Trace for HashMap<K, V, S> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for (k, v) in self {
            k.trace(visitor);
            v.trace(visitor);
        }
    }
}

// SAFETY: HashSet traces all elements
unsafe impl<T: Trace, S: BuildHasher> Trace for HashSet<T, S> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// SAFETY: BTreeMap traces all key-value pairs
unsafe impl<K: Trace, V: Trace> Trace for BTreeMap<K, V> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for (k, v) in self {
            k.trace(visitor);
            v.trace(visitor);
        }
    }
}

// SAFETY: BTreeSet traces all elements
unsafe impl<T: Trace> Trace for BTreeSet<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

// ============================================================================
// Trace implementations for tuples
// ============================================================================

macro_rules! impl_trace_for_tuples {
    () => {};
    ($first:ident $(, $rest:ident)*) => {
        // SAFETY: Tuples trace all their elements
        unsafe impl<$first: Trace $(, $rest: Trace)*> Trace for ($first, $($rest,)*) {
            #[inline]
            #[allow(non_snake_case)]
            fn trace(&self, visitor: &mut Visitor<'_>) {
                let ($first, $($rest,)*) = self;
                $first.trace(visitor);
                $($rest.trace(visitor);)*
            }
        }
        impl_trace_for_tuples!($($rest),*);
    };
}

impl_trace_for_tuples!(A, B, C, D, E, F, G, H);

// SAFETY: PhantomData contains no actual data
unsafe impl<T: ?Sized> Trace for std::marker::PhantomData<T> {
    #[inline]
    fn trace(&self, _visitor: &mut Visitor<'_>) {}
}

/// Implements a no-op [`Trace`] for `'static` types that hold no heap
/// references.
///
/// # Examples
///
/// ```
/// use arbor_gc::static_collect;
///
/// struct Config {
///     name: String,
/// }
/// static_collect!(Config);
/// ```
#[macro_export]
macro_rules! static_collect {
    ($type:ty) => {
        // SAFETY: the type is `'static` and holds no heap references.
        unsafe impl $crate::Trace for $type
        where
            $type: 'static,
        {
            #[inline]
            fn trace(&self, _visitor: &mut $crate::Visitor<'_>) {}
        }
    };
}
