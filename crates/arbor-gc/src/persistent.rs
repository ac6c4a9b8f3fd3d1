//! Off-heap roots.
//!
//! A persistent handle owns a boxed slot holding the payload address of
//! its target. The slot is registered in a [`PersistentRegion`]: strong
//! regions are traced as roots, weak regions are cleared during weak
//! processing when their target died.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::gc::CollectorInner;
use crate::thread_state::ThreadState;
use crate::trace::{Trace, Visitor};
use crate::Gc;

type Slot = AtomicPtr<u8>;

/// Registry of persistent slots.
pub(crate) struct PersistentRegion {
    slots: Vec<Option<NonNull<Slot>>>,
    free_slots: Vec<usize>,
    count: usize,
}

// SAFETY: slots are atomics owned by handles that unregister before freeing them.
unsafe impl Send for PersistentRegion {}

impl PersistentRegion {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            count: 0,
        }
    }

    fn register(&mut self, slot: NonNull<Slot>) -> usize {
        self.count += 1;
        if let Some(index) = self.free_slots.pop() {
            self.slots[index] = Some(slot);
            return index;
        }
        self.slots.push(Some(slot));
        self.slots.len() - 1
    }

    fn unregister(&mut self, index: usize) {
        debug_assert!(self.slots[index].is_some(), "persistent slot freed twice");
        self.slots[index] = None;
        self.free_slots.push(index);
        self.count -= 1;
    }

    /// Number of registered handles.
    pub const fn count(&self) -> usize {
        self.count
    }

    fn for_each_slot(&self, mut f: impl FnMut(&Slot)) {
        for slot in self.slots.iter().flatten() {
            // SAFETY: registered slots outlive their registration.
            f(unsafe { slot.as_ref() });
        }
    }

    /// Marks every target as a root.
    pub fn trace(&self, visitor: &mut Visitor<'_>) {
        self.for_each_slot(|slot| {
            // SAFETY: slots only ever hold payload addresses or null.
            unsafe { visitor.visit_raw(slot.load(Ordering::Acquire)) };
        });
    }

    /// Clears slots whose target did not survive marking.
    pub fn clear_dead(&self, visitor: &Visitor<'_>) {
        self.for_each_slot(|slot| {
            let payload = slot.load(Ordering::Acquire);
            // SAFETY: as above.
            if !unsafe { visitor.is_alive_raw(payload) } {
                slot.store(ptr::null_mut(), Ordering::Release);
            }
        });
    }

    /// Clears slots whose target lives on a page owned by `owner`.
    pub fn clear_owned_by(&self, owner: *const ThreadState) {
        self.for_each_slot(|slot| {
            let payload = slot.load(Ordering::Acquire);
            if payload.is_null() {
                return;
            }
            // SAFETY: non-null slots point at heap payloads.
            let page = unsafe { crate::heap::BasePage::from_payload(payload).as_ref() };
            if page.owner() == owner {
                slot.store(ptr::null_mut(), Ordering::Release);
            }
        });
    }
}

fn new_slot<T>(gc: Option<Gc<T>>) -> Box<Slot> {
    let payload = gc.map_or(ptr::null_mut(), |gc| Gc::as_ptr(&gc).cast::<u8>().cast_mut());
    Box::new(AtomicPtr::new(payload))
}

fn load_slot<T>(slot: &Slot) -> Option<Gc<T>> {
    let payload = slot.load(Ordering::Acquire);
    // SAFETY: a non-null slot holds the payload of a live `T`.
    NonNull::new(payload).map(|payload| unsafe { Gc::from_raw(payload.cast::<T>().as_ptr()) })
}

/// A strong root owned by the current thread.
///
/// Keeps its target alive across collections until dropped.
pub struct Persistent<T: Trace + 'static> {
    slot: Box<Slot>,
    index: usize,
    state: Arc<ThreadState>,
    _marker: PhantomData<*const T>,
}

impl<T: Trace + 'static> Persistent<T> {
    /// Roots `gc` on the current thread.
    ///
    /// # Panics
    ///
    /// Panics if the current thread is not attached to a collector.
    #[must_use]
    pub fn new(gc: Gc<T>) -> Self {
        Self::with_state(ThreadState::current_or_panic(), Some(gc))
    }

    /// A root that holds nothing yet.
    ///
    /// # Panics
    ///
    /// Panics if the current thread is not attached to a collector.
    #[must_use]
    pub fn empty() -> Self {
        Self::with_state(ThreadState::current_or_panic(), None)
    }

    fn with_state(state: Arc<ThreadState>, gc: Option<Gc<T>>) -> Self {
        let slot = new_slot(gc);
        let index = state.persistents.lock().register(NonNull::from(&*slot));
        Self {
            slot,
            index,
            state,
            _marker: PhantomData,
        }
    }

    /// The target, if any.
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        load_slot(&self.slot)
    }

    /// Replaces the target.
    pub fn set(&self, gc: Option<Gc<T>>) {
        let payload = gc.map_or(ptr::null_mut(), |gc| Gc::as_ptr(&gc).cast::<u8>().cast_mut());
        self.slot.store(payload, Ordering::Release);
    }
}

impl<T: Trace + 'static> Drop for Persistent<T> {
    fn drop(&mut self) {
        self.state.persistents.lock().unregister(self.index);
    }
}

impl<T: Trace + 'static> fmt::Debug for Persistent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistent")
            .field("target", &self.slot.load(Ordering::Relaxed))
            .finish()
    }
}

/// A weak root owned by the current thread.
///
/// Does not keep its target alive; reads `None` once the target died.
pub struct WeakPersistent<T: Trace + 'static> {
    slot: Box<Slot>,
    index: usize,
    state: Arc<ThreadState>,
    _marker: PhantomData<*const T>,
}

impl<T: Trace + 'static> WeakPersistent<T> {
    /// Weakly roots `gc` on the current thread.
    ///
    /// # Panics
    ///
    /// Panics if the current thread is not attached to a collector.
    #[must_use]
    pub fn new(gc: Gc<T>) -> Self {
        let state = ThreadState::current_or_panic();
        let slot = new_slot(Some(gc));
        let index = state.weak_persistents.lock().register(NonNull::from(&*slot));
        Self {
            slot,
            index,
            state,
            _marker: PhantomData,
        }
    }

    /// The target, unless it was collected.
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        load_slot(&self.slot)
    }
}

impl<T: Trace + 'static> Drop for WeakPersistent<T> {
    fn drop(&mut self) {
        self.state.weak_persistents.lock().unregister(self.index);
    }
}

/// A strong root registered with the collector rather than a thread.
///
/// It may be moved to and dropped on any thread. Reading it from a thread
/// other than the target's owner requires `T: Send + Sync`. When the
/// owner thread terminates, the handle is cleared.
pub struct CrossThreadPersistent<T: Trace + 'static> {
    slot: Box<Slot>,
    index: usize,
    collector: Arc<CollectorInner>,
    _marker: PhantomData<*const T>,
}

// SAFETY: the slot is atomic and the region is behind a mutex; the target
// is shareable because `T` is.
unsafe impl<T: Trace + Send + Sync + 'static> Send for CrossThreadPersistent<T> {}
// SAFETY: as above.
unsafe impl<T: Trace + Send + Sync + 'static> Sync for CrossThreadPersistent<T> {}

impl<T: Trace + 'static> CrossThreadPersistent<T> {
    /// Roots `gc` in the current thread's collector.
    ///
    /// # Panics
    ///
    /// Panics if the current thread is not attached to a collector.
    #[must_use]
    pub fn new(gc: Gc<T>) -> Self {
        let collector = Arc::clone(ThreadState::current_or_panic().collector());
        let slot = new_slot(Some(gc));
        let index = collector
            .cross_thread_persistents
            .lock()
            .register(NonNull::from(&*slot));
        Self {
            slot,
            index,
            collector,
            _marker: PhantomData,
        }
    }

    /// The target; `None` after the owner thread terminated.
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        load_slot(&self.slot)
    }
}

impl<T: Trace + 'static> Drop for CrossThreadPersistent<T> {
    fn drop(&mut self) {
        self.collector
            .cross_thread_persistents
            .lock()
            .unregister(self.index);
    }
}
