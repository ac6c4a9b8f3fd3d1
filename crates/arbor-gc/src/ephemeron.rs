//! Key-gated tables.
//!
//! An ephemeron entry keeps its value alive only while its key is alive
//! through some other path. Marking iterates the tables to a fixed point:
//! every pass traces the values of entries whose key got marked, and stops
//! once a pass marks nothing new. Entries whose key died are removed
//! during weak processing.

use std::cell::RefCell;
use std::fmt;

use crate::trace::{Trace, Visitor};
use crate::Gc;

/// A weak-keyed map from heap objects to traced values.
///
/// Iteration order is insertion order. The table must live inside a heap
/// object.
pub struct EphemeronTable<K, V> {
    entries: RefCell<Vec<(Gc<K>, V)>>,
}

impl<K, V> EphemeronTable<K, V> {
    /// An empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
        }
    }

    /// Inserts or replaces the value for `key`.
    pub fn insert(&self, key: Gc<K>, value: V) -> Option<V> {
        let mut entries = self.entries.borrow_mut();
        if let Some(entry) = entries.iter_mut().find(|(k, _)| Gc::ptr_eq(k, &key)) {
            return Some(std::mem::replace(&mut entry.1, value));
        }
        entries.push((key, value));
        None
    }

    /// Removes the entry for `key`.
    pub fn remove(&self, key: &Gc<K>) -> Option<V> {
        let mut entries = self.entries.borrow_mut();
        let position = entries.iter().position(|(k, _)| Gc::ptr_eq(k, key))?;
        Some(entries.remove(position).1)
    }

    /// Whether `key` has an entry.
    #[must_use]
    pub fn contains_key(&self, key: &Gc<K>) -> bool {
        self.entries.borrow().iter().any(|(k, _)| Gc::ptr_eq(k, key))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl<K, V: Clone> EphemeronTable<K, V> {
    /// A copy of the value for `key`.
    #[must_use]
    pub fn get(&self, key: &Gc<K>) -> Option<V> {
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| Gc::ptr_eq(k, key))
            .map(|(_, v)| v.clone())
    }
}

impl<K, V> Default for EphemeronTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for EphemeronTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeronTable")
            .field("len", &self.len())
            .finish()
    }
}

unsafe fn trace_live_entries<K: Trace, V: Trace>(visitor: &mut Visitor<'_>, object: *const u8) {
    // SAFETY: registered with the address of a table inside a live heap object.
    let table = unsafe { &*object.cast::<EphemeronTable<K, V>>() };
    let Ok(entries) = table.entries.try_borrow() else {
        return;
    };
    for (key, value) in entries.iter() {
        if visitor.is_heap_object_alive(key) {
            value.trace(visitor);
        }
    }
}

unsafe fn remove_dead_entries<K: Trace, V: Trace>(visitor: &Visitor<'_>, object: *const u8) {
    // SAFETY: as above.
    let table = unsafe { &*object.cast::<EphemeronTable<K, V>>() };
    if let Ok(mut entries) = table.entries.try_borrow_mut() {
        entries.retain(|(key, _)| visitor.is_heap_object_alive(key));
    }
}

// SAFETY: values are traced by the ephemeron callback once their keys are
// marked; keys are held weakly.
unsafe impl<K: Trace, V: Trace> Trace for EphemeronTable<K, V> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        let object = std::ptr::from_ref(self).cast::<u8>();
        visitor.register_ephemeron_callback(object, trace_live_entries::<K, V>);
        visitor.register_weak_callback(object, remove_dead_entries::<K, V>);
    }
}
