//! On-heap references: [`Gc`], [`Member`] and [`WeakMember`].

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::thread_state::ThreadState;
use crate::trace::{Trace, Visitor};

/// A reference to an object on the garbage-collected heap.
///
/// `Gc` is a plain, copyable pointer. It does not keep its target alive on
/// its own: the target survives a collection only while it is reachable
/// from a root, either through traced fields of other heap objects, a
/// [`Persistent`](crate::Persistent), or a conservatively scanned stack.
///
/// `Gc` is `!Send` and `!Sync`: heap objects belong to the thread that
/// allocated them.
///
/// # Examples
///
/// ```
/// use arbor_gc::{Collector, Gc, GcConfig};
///
/// let collector = Collector::new(GcConfig::default());
/// let _thread = collector.attach_current_thread();
/// let x = Gc::new(42);
/// assert_eq!(*x, 42);
/// ```
pub struct Gc<T> {
    ptr: NonNull<T>,
    _marker: PhantomData<*const ()>,
}

impl<T: Trace + 'static> Gc<T> {
    /// Allocates `value` on the current thread's heap.
    ///
    /// # Panics
    ///
    /// Panics if the current thread is not attached to a collector, or if
    /// allocation is forbidden (for example inside a finalizer).
    pub fn new(value: T) -> Self {
        ThreadState::with_current(|state| state.allocate(value))
    }
}

impl<T> Gc<T> {
    /// Wraps the payload address of a heap object.
    ///
    /// # Safety
    ///
    /// `ptr` must be the payload of a heap object holding an initialized `T`.
    #[must_use]
    pub const unsafe fn from_raw(ptr: *mut T) -> Self {
        Self {
            // SAFETY: caller guarantees a heap payload, which is never null.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            _marker: PhantomData,
        }
    }

    /// Get a raw pointer to the data.
    #[must_use]
    pub const fn as_ptr(gc: &Self) -> *const T {
        gc.ptr.as_ptr()
    }

    /// Check if two Gcs point to the same allocation.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Gc<T> {}

impl<T> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: reachable objects are not swept, and a `Gc` the mutator
        // can still name is reachable from its stack or a root.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: fmt::Debug> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gc").field(&&**self).finish()
    }
}

impl<T> fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr, f)
    }
}

impl<T: fmt::Display> fmt::Display for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T> Eq for Gc<T> {}

impl<T> std::hash::Hash for Gc<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl<T> AsRef<T> for Gc<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

/// A nullable, mutable, traced field of a heap object.
pub struct Member<T> {
    target: Cell<Option<Gc<T>>>,
}

impl<T> Member<T> {
    /// A member pointing at `gc`.
    #[must_use]
    pub const fn new(gc: Gc<T>) -> Self {
        Self {
            target: Cell::new(Some(gc)),
        }
    }

    /// A member pointing nowhere.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            target: Cell::new(None),
        }
    }

    /// The current target.
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        self.target.get()
    }

    /// Replaces the target.
    pub fn set(&self, gc: Option<Gc<T>>) {
        self.target.set(gc);
    }

    /// Clears the member, returning the old target.
    pub fn take(&self) -> Option<Gc<T>> {
        self.target.take()
    }
}

impl<T> Default for Member<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for Member<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Member").field(&self.get().map(|gc| gc.ptr)).finish()
    }
}

// SAFETY: Member marks its target
unsafe impl<T: Trace> Trace for Member<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor<'_>) {
        if let Some(gc) = self.get() {
            visitor.visit(&gc);
        }
    }
}

/// A heap field that does not keep its target alive.
///
/// After a collection in which the target died, the field reads `None`.
/// A `WeakMember` must live inside a heap object.
pub struct WeakMember<T> {
    target: Cell<Option<Gc<T>>>,
}

impl<T> WeakMember<T> {
    /// A weak member pointing at `gc`.
    #[must_use]
    pub const fn new(gc: Gc<T>) -> Self {
        Self {
            target: Cell::new(Some(gc)),
        }
    }

    /// A weak member pointing nowhere.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            target: Cell::new(None),
        }
    }

    /// The target, unless it was collected.
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        self.target.get()
    }

    /// Replaces the target.
    pub fn set(&self, gc: Option<Gc<T>>) {
        self.target.set(gc);
    }
}

impl<T> Default for WeakMember<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for WeakMember<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakMember").field(&self.get().map(|gc| gc.ptr)).finish()
    }
}

unsafe fn clear_weak_member<T: Trace>(visitor: &Visitor<'_>, object: *const u8) {
    // SAFETY: registered with the address of a `WeakMember<T>` inside a
    // live heap object; sweeping has not started yet.
    let member = unsafe { &*object.cast::<WeakMember<T>>() };
    if let Some(gc) = member.get() {
        if !visitor.is_heap_object_alive(&gc) {
            member.set(None);
        }
    }
}

// SAFETY: the target is deliberately not marked; the member is cleared
// during weak processing instead.
unsafe impl<T: Trace> Trace for WeakMember<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        if self.get().is_some() {
            let object = std::ptr::from_ref(self).cast::<u8>();
            visitor.register_weak_callback(object, clear_weak_member::<T>);
        }
    }
}
