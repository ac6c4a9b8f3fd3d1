//! Type descriptors.
//!
//! Every object header stores a 16-bit index into the process-wide
//! [`GcInfoTable`]. The entry says how to trace the object and how to
//! finalize it. Entries are immutable once registered.

use std::any::TypeId;
use std::collections::HashMap;
use std::num::NonZeroU16;
use std::sync::LazyLock;

use parking_lot::RwLock;

use crate::trace::{Trace, Visitor};

/// Walks the outgoing references of the object at `payload`.
pub type TraceCallback = unsafe fn(&mut Visitor<'_>, *const u8);

/// Releases the resources of the dead object at `payload`. Runs at most once.
pub type FinalizeCallback = unsafe fn(*mut u8);

/// Static description of a heap type.
#[derive(Debug, Clone, Copy)]
pub struct GcInfo {
    /// Trace callback.
    pub trace: TraceCallback,
    /// Finalize callback, `None` when the type needs no cleanup.
    pub finalize: Option<FinalizeCallback>,
    /// Human readable type name.
    pub name: &'static str,
}

/// Index of a registered [`GcInfo`]. Zero is reserved for free-list entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcInfoIndex(NonZeroU16);

impl GcInfoIndex {
    /// Wraps a raw header value; `None` for the free-list encoding.
    #[must_use]
    pub const fn new(raw: u16) -> Option<Self> {
        match NonZeroU16::new(raw) {
            Some(index) => Some(Self(index)),
            None => None,
        }
    }

    /// The raw header value.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

unsafe fn trace_thunk<T: Trace>(visitor: &mut Visitor<'_>, payload: *const u8) {
    // SAFETY: the payload holds an initialized `T`.
    unsafe { &*payload.cast::<T>() }.trace(visitor);
}

unsafe fn finalize_thunk<T>(payload: *mut u8) {
    // SAFETY: the payload holds an initialized `T` that is dropped once.
    unsafe { std::ptr::drop_in_place(payload.cast::<T>()) };
}

impl GcInfo {
    /// Descriptor of `T`: traces through [`Trace`] and finalizes with `Drop`.
    #[must_use]
    pub fn for_type<T: Trace>() -> Self {
        Self {
            trace: trace_thunk::<T>,
            finalize: std::mem::needs_drop::<T>().then_some(finalize_thunk::<T> as FinalizeCallback),
            name: std::any::type_name::<T>(),
        }
    }

    /// Index of `T`'s descriptor, registering it on first use.
    pub fn index_of<T: Trace + 'static>() -> GcInfoIndex {
        let table = GcInfoTable::global();
        let type_id = TypeId::of::<T>();
        if let Some(index) = table.by_type.read().get(&type_id) {
            return *index;
        }
        let mut by_type = table.by_type.write();
        *by_type
            .entry(type_id)
            .or_insert_with(|| table.register(Self::for_type::<T>()))
    }
}

/// Process-wide registry of [`GcInfo`]s.
pub struct GcInfoTable {
    entries: RwLock<Vec<&'static GcInfo>>,
    by_type: RwLock<HashMap<TypeId, GcInfoIndex>>,
}

static GC_INFO_TABLE: LazyLock<GcInfoTable> = LazyLock::new(|| GcInfoTable {
    entries: RwLock::new(Vec::new()),
    by_type: RwLock::new(HashMap::new()),
});

impl GcInfoTable {
    fn global() -> &'static Self {
        &GC_INFO_TABLE
    }

    fn register(&self, info: GcInfo) -> GcInfoIndex {
        let mut entries = self.entries.write();
        let Some(index) = u16::try_from(entries.len() + 1).ok().and_then(GcInfoIndex::new) else {
            panic!("GcInfoTable is full");
        };
        entries.push(Box::leak(Box::new(info)));
        index
    }

    /// Registers a descriptor for untyped allocations made through
    /// [`ThreadState::allocate_raw`](crate::ThreadState::allocate_raw).
    ///
    /// # Panics
    ///
    /// Panics when the 16-bit index space is exhausted.
    pub fn register_global(info: GcInfo) -> GcInfoIndex {
        Self::global().register(info)
    }

    /// Looks up a registered descriptor.
    ///
    /// # Panics
    ///
    /// Panics if `index` was never registered.
    #[must_use]
    pub fn get(index: GcInfoIndex) -> &'static GcInfo {
        Self::global().entries.read()[usize::from(index.get()) - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain(#[allow(dead_code)] u32);
    unsafe impl Trace for Plain {
        fn trace(&self, _visitor: &mut Visitor<'_>) {}
    }

    struct Owning(#[allow(dead_code)] Vec<u8>);
    unsafe impl Trace for Owning {
        fn trace(&self, _visitor: &mut Visitor<'_>) {}
    }

    #[test]
    fn test_index_is_stable_per_type() {
        let a = GcInfo::index_of::<Plain>();
        let b = GcInfo::index_of::<Plain>();
        let c = GcInfo::index_of::<Owning>();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_finalizer_only_when_needed() {
        let plain = GcInfoTable::get(GcInfo::index_of::<Plain>());
        let owning = GcInfoTable::get(GcInfo::index_of::<Owning>());
        assert!(plain.finalize.is_none());
        assert!(owning.finalize.is_some());
        assert!(owning.name.ends_with("Owning"));
    }

    #[test]
    fn test_zero_is_reserved() {
        assert!(GcInfoIndex::new(0).is_none());
        assert_eq!(GcInfoIndex::new(7).map(GcInfoIndex::get), Some(7));
    }
}
