//! A thread-local, segregated-arena mark-and-sweep garbage collector.
//!
//! `arbor-gc` manages a graph of heap objects shared by any number of
//! attached threads. Each thread allocates from its own arenas with a bump
//! pointer, a bucketed free list and a dedicated large-object arena.
//! Collections stop every attached thread at a safepoint, mark from the
//! registered roots (and, optionally, conservatively scanned stacks),
//! iterate ephemeron tables to a fixed point, clear weak references and
//! then sweep, either eagerly or lazily under a deadline.
//!
//! # Quick Start
//!
//! ```
//! use arbor_gc::{Collector, Gc, GcConfig, Member, Persistent, Trace};
//!
//! #[derive(Trace)]
//! struct Node {
//!     value: u32,
//!     next: Member<Node>,
//! }
//!
//! let collector = Collector::new(GcConfig::default());
//! let thread = collector.attach_current_thread();
//!
//! let a = Gc::new(Node { value: 1, next: Member::empty() });
//! let b = Gc::new(Node { value: 2, next: Member::new(a) });
//! a.next.set(Some(b));
//!
//! let root = Persistent::new(a);
//! thread.collect_all_garbage();
//! assert_eq!(root.get().unwrap().next.get().unwrap().value, 2);
//! ```
//!
//! # Threads
//!
//! `Gc<T>` is `!Send`: objects belong to the thread that allocated them.
//! Use [`CrossThreadPersistent`] to hold an object from another thread.
//! Long-running threads must reach a safepoint regularly, through
//! [`ThreadState::safe_point`] or a [`SafePointScope`], or a collection
//! started elsewhere is abandoned after [`GcConfig::park_timeout`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod ephemeron;
mod gc;
mod gc_info;
mod handles;
mod metrics;
mod persistent;
mod stack;
mod thread_state;
mod trace;
mod tracing;

/// Page, arena and header internals.
///
/// This module is public for testing and advanced use cases.
/// Most users should use `Gc<T>` directly.
pub mod heap;

// Re-export public API
pub use config::{GcConfig, GcThreshold};
pub use ephemeron::EphemeronTable;
pub use gc::{
    AttachedThread, CollectOutcome, Collector, GcReason, GcState, Interruptor, RootTracerId,
    SafePointScope, StackState, SweepKind, SweepProgress, SweepScheduler,
};
pub use gc_info::{FinalizeCallback, GcInfo, GcInfoIndex, GcInfoTable, TraceCallback};
pub use handles::{Gc, Member, WeakMember};
pub use heap::ArenaIndex;
pub use metrics::{GcMetrics, HeapStats};
pub use persistent::{CrossThreadPersistent, Persistent, WeakPersistent};
pub use thread_state::{GcForbiddenScope, NoAllocationScope, PreFinalize, ThreadState};
pub use trace::{Trace, Visitor, VisitorKind, WeakCallback};

// Re-export derive macro when feature is enabled
#[cfg(feature = "derive")]
pub use arbor_gc_derive::Trace;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    /// Clear CPU registers to prevent stale pointer values from being treated as roots.
    ///
    /// This is useful in tests to ensure objects are collected even when
    /// stale pointer values remain in callee-saved registers after function returns.
    ///
    /// # Safety
    ///
    /// This function clears callee-saved registers (R12-R15 on `x86_64`).
    /// It should only be called when those registers don't contain values
    /// needed by the calling code.
    pub unsafe fn clear_registers() {
        // SAFETY: Caller guarantees that callee-saved registers don't contain
        // values needed by the calling code.
        unsafe { crate::stack::clear_registers() };
    }
}
