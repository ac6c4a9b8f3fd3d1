//! The per-thread GC state machine and the small enums describing a cycle.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::metrics::GcMetrics;

/// Whether a thread's machine stack may hold heap pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    /// Only registered roots keep objects alive; stacks are not scanned.
    NoHeapPointersOnStack,
    /// Stacks and spilled registers are scanned conservatively.
    HeapPointersOnStack,
}

/// How a collection reclaims memory after marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// Sweep every page before returning to the mutator.
    Eager,
    /// Sweep on demand from the allocator or from idle tasks.
    Lazy,
}

/// Why a collection ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    /// An idle-time collection requested by the heuristics.
    IdleGc,
    /// A precise collection requested by the heuristics.
    PreciseGc,
    /// Memory pressure forced an immediate conservative collection.
    ConservativeGc,
    /// The embedder asked for a collection.
    ForcedGc,
    /// Final collections of a terminating thread.
    ThreadTerminationGc,
}

impl GcReason {
    /// Stable lowercase name, used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IdleGc => "idle",
            Self::PreciseGc => "precise",
            Self::ConservativeGc => "conservative",
            Self::ForcedGc => "forced",
            Self::ThreadTerminationGc => "thread_termination",
        }
    }
}

/// Result of [`ThreadState::collect_garbage`](crate::ThreadState::collect_garbage).
#[derive(Debug, Clone, Copy)]
pub enum CollectOutcome {
    /// The cycle ran to completion.
    Completed(GcMetrics),
    /// Another thread failed to reach a safepoint in time; nothing changed.
    Abandoned,
}

impl CollectOutcome {
    /// Whether the cycle ran.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// The metrics of a completed cycle.
    #[must_use]
    pub const fn metrics(&self) -> Option<&GcMetrics> {
        match self {
            Self::Completed(metrics) => Some(metrics),
            Self::Abandoned => None,
        }
    }
}

/// GC state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcState {
    /// Nothing pending.
    NoGcScheduled,
    /// An idle-time collection is requested.
    IdleGcScheduled,
    /// A precise collection is requested for the next safepoint.
    PreciseGcScheduled,
    /// A collect-all is requested for the next safepoint.
    FullGcScheduled,
    /// A collection cycle is marking.
    GcRunning,
    /// Marking finished; this thread sweeps eagerly when it resumes.
    EagerSweepScheduled,
    /// Marking finished; this thread sweeps lazily when it resumes.
    LazySweepScheduled,
    /// Sweeping is in progress.
    Sweeping,
    /// Sweeping, with an idle collection deferred until it completes.
    SweepingAndIdleGcScheduled,
    /// Sweeping, with a precise collection deferred until it completes.
    SweepingAndPreciseGcScheduled,
}

impl GcState {
    const ALL: [Self; 10] = [
        Self::NoGcScheduled,
        Self::IdleGcScheduled,
        Self::PreciseGcScheduled,
        Self::FullGcScheduled,
        Self::GcRunning,
        Self::EagerSweepScheduled,
        Self::LazySweepScheduled,
        Self::Sweeping,
        Self::SweepingAndIdleGcScheduled,
        Self::SweepingAndPreciseGcScheduled,
    ];

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use GcState::{
            EagerSweepScheduled, FullGcScheduled, GcRunning, IdleGcScheduled, LazySweepScheduled,
            NoGcScheduled, PreciseGcScheduled, Sweeping, SweepingAndIdleGcScheduled,
            SweepingAndPreciseGcScheduled,
        };
        match next {
            NoGcScheduled => matches!(
                self,
                IdleGcScheduled | PreciseGcScheduled | FullGcScheduled | Sweeping
            ),
            IdleGcScheduled => matches!(
                self,
                NoGcScheduled | IdleGcScheduled | SweepingAndIdleGcScheduled
            ),
            PreciseGcScheduled => matches!(
                self,
                NoGcScheduled | IdleGcScheduled | PreciseGcScheduled | SweepingAndPreciseGcScheduled
            ),
            FullGcScheduled => matches!(
                self,
                NoGcScheduled | IdleGcScheduled | PreciseGcScheduled | FullGcScheduled
            ),
            GcRunning => !matches!(self, GcRunning),
            EagerSweepScheduled | LazySweepScheduled => matches!(self, GcRunning),
            Sweeping => matches!(self, EagerSweepScheduled | LazySweepScheduled),
            SweepingAndIdleGcScheduled => matches!(self, Sweeping | SweepingAndIdleGcScheduled),
            SweepingAndPreciseGcScheduled => matches!(
                self,
                Sweeping | SweepingAndIdleGcScheduled | SweepingAndPreciseGcScheduled
            ),
        }
    }

    /// Whether the thread is in one of the sweeping states.
    #[must_use]
    pub const fn is_sweeping(self) -> bool {
        matches!(
            self,
            Self::Sweeping | Self::SweepingAndIdleGcScheduled | Self::SweepingAndPreciseGcScheduled
        )
    }

    /// The state sweeping ends in.
    #[must_use]
    pub const fn after_sweep(self) -> Self {
        match self {
            Self::SweepingAndIdleGcScheduled => Self::IdleGcScheduled,
            Self::SweepingAndPreciseGcScheduled => Self::PreciseGcScheduled,
            _ => Self::NoGcScheduled,
        }
    }
}

/// Atomically readable cell holding a [`GcState`].
///
/// The owner thread drives the machine; the collector reads and writes it
/// while the owner is parked.
#[derive(Debug)]
pub(crate) struct GcStateCell(AtomicU8);

impl GcStateCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(GcState::NoGcScheduled as u8))
    }

    pub fn get(&self) -> GcState {
        GcState::ALL[usize::from(self.0.load(Ordering::Acquire))]
    }

    /// Moves to `next`, aborting on an illegal transition.
    pub fn set(&self, next: GcState) {
        let current = self.get();
        assert!(
            current.can_transition_to(next),
            "illegal GC state transition {current:?} -> {next:?}"
        );
        self.0.store(next as u8, Ordering::Release);
    }
}
