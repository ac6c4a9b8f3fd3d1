//! Collection cycle coordination.
//!
//! - `state`: the per-thread GC state machine and cycle enums
//! - `safepoint`: the stop-the-world barrier
//! - `marking`: mark stack draining, ephemeron fixed point, weak processing
//! - `collector`: the collector instance and the cycle itself
//! - `sweep`: idle-time sweeping hooks

mod callback_stack;
mod collector;
mod marking;
mod safepoint;
mod state;
mod sweep;

pub use callback_stack::{CallbackItem, CallbackStack};
pub use collector::{AttachedThread, Collector, RootTracerId};
pub use safepoint::{Interruptor, SafePointScope};
pub use state::{CollectOutcome, GcReason, GcState, StackState, SweepKind};
pub use sweep::{SweepProgress, SweepScheduler};

pub(crate) use collector::CollectorInner;
pub(crate) use marking::MarkingWorklists;
pub(crate) use safepoint::SafePointBarrier;
pub(crate) use state::GcStateCell;
