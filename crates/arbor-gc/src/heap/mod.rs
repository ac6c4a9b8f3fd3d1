//! Segregated-arena heap internals.
//!
//! Every attached thread owns one [`ThreadHeap`]: four normal-page arenas
//! split by allocation size and one large-object arena. Pages are
//! [`PAGE_SIZE`]-aligned so any object address maps back to its page by
//! masking, and every object is preceded by an 8-byte [`ObjectHeader`].
//!
//! This module is public for testing and advanced use cases.

mod arena;
mod free_list;
mod header;
mod page;
mod page_pool;
mod region;

pub use header::ObjectHeader;
pub use page::{BasePage, LargeObjectPage, NormalPage, PageKind};

pub(crate) use arena::{LargeObjectArena, NormalPageArena, SweepResult};
pub(crate) use page_pool::{FreePagePool, OrphanedPagePool};
pub(crate) use region::PageMap;

use crate::config::GcConfig;
use crate::metrics::HeapStats;
use crate::thread_state::ThreadState;

/// Size and alignment of every heap page.
pub const PAGE_SIZE: usize = 1 << 17;

/// Every allocation size is a multiple of this.
pub const ALLOCATION_GRANULARITY: usize = 8;

/// Size of the header preceding each payload.
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

/// Smallest span that can hold a linked free-list entry.
pub const MIN_FREE_LIST_ENTRY_SIZE: usize = HEADER_SIZE + std::mem::size_of::<usize>();

/// Byte pattern written over orphaned pages.
pub const ORPHANED_ZAP_VALUE: u8 = 0xdc;

/// Byte pattern of a quarantined span that may be handed out again.
pub const REUSE_ALLOWED_ZAP_VALUE: u8 = 0x2a;

/// Byte pattern of a span freed by the latest sweep.
pub const REUSE_FORBIDDEN_ZAP_VALUE: u8 = 0x2c;

/// Number of normal-page arenas.
pub const NORMAL_ARENA_COUNT: usize = 4;

/// Identifies one arena of a thread heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArenaIndex {
    /// Allocation sizes below 64 bytes.
    NormalPage1 = 0,
    /// Allocation sizes below 128 bytes.
    NormalPage2 = 1,
    /// Allocation sizes below 256 bytes.
    NormalPage3 = 2,
    /// Every other size under the large-object threshold.
    NormalPage4 = 3,
    /// One object per page.
    LargeObject = 4,
}

impl ArenaIndex {
    /// Picks the normal arena for an allocation size (header included).
    #[must_use]
    pub const fn for_allocation_size(allocation_size: usize) -> Self {
        if allocation_size < 64 {
            Self::NormalPage1
        } else if allocation_size < 128 {
            Self::NormalPage2
        } else if allocation_size < 256 {
            Self::NormalPage3
        } else {
            Self::NormalPage4
        }
    }

    pub(crate) const fn from_normal(index: usize) -> Self {
        match index {
            0 => Self::NormalPage1,
            1 => Self::NormalPage2,
            2 => Self::NormalPage3,
            _ => Self::NormalPage4,
        }
    }

    pub(crate) const fn as_usize(self) -> usize {
        self as usize
    }
}

/// Rounds a requested payload size up to a full allocation size.
#[must_use]
pub const fn allocation_size_from_size(size: usize) -> usize {
    let with_header = size + HEADER_SIZE;
    let rounded = (with_header + ALLOCATION_GRANULARITY - 1) & !(ALLOCATION_GRANULARITY - 1);
    if rounded < MIN_FREE_LIST_ENTRY_SIZE {
        MIN_FREE_LIST_ENTRY_SIZE
    } else {
        rounded
    }
}

/// Collector-owned services an arena needs while growing or sweeping.
pub(crate) struct HeapContext<'a> {
    pub config: &'a GcConfig,
    pub free_pages: &'a FreePagePool,
    pub orphaned_pages: &'a OrphanedPagePool,
    pub page_map: &'a PageMap,
    pub stats: &'a HeapStats,
    pub owner: *const ThreadState,
}

/// The arenas of one thread.
pub(crate) struct ThreadHeap {
    pub normal: [NormalPageArena; NORMAL_ARENA_COUNT],
    pub large: LargeObjectArena,
}

impl ThreadHeap {
    pub fn new() -> Self {
        Self {
            normal: std::array::from_fn(|i| NormalPageArena::new(ArenaIndex::from_normal(i))),
            large: LargeObjectArena::new(),
        }
    }

    /// Flushes bump regions and free lists, unmarks survivors on unswept
    /// pages and marks the rest dead so the next marking starts from a
    /// clean slate.
    pub fn make_consistent_for_gc(&mut self) {
        for arena in &mut self.normal {
            arena.make_consistent_for_gc();
        }
        self.large.make_consistent_for_gc();
    }

    /// Moves every swept page onto the to-sweep list.
    pub fn prepare_for_sweep(&mut self) {
        for arena in &mut self.normal {
            arena.prepare_for_sweep();
        }
        self.large.prepare_for_sweep();
    }

    pub fn has_unswept_pages(&self) -> bool {
        self.normal.iter().any(NormalPageArena::has_unswept_pages) || self.large.has_unswept_pages()
    }

    /// Sweeps one page of any arena; `None` once nothing is left.
    pub fn sweep_one_page(&mut self, ctx: &HeapContext<'_>) -> Option<SweepResult> {
        for arena in &mut self.normal {
            if let Some(result) = arena.sweep_next_page(ctx) {
                return Some(result);
            }
        }
        self.large.sweep_next_page(ctx)
    }

    pub fn complete_sweep(&mut self, ctx: &HeapContext<'_>) -> usize {
        let mut swept = 0;
        while let Some(result) = self.sweep_one_page(ctx) {
            swept += result.freed_bytes;
        }
        swept
    }

    /// Hands every page to the orphaned page pool.
    ///
    /// Objects left on those pages no longer count as live.
    pub fn orphan_pages(&mut self, ctx: &HeapContext<'_>) {
        let mut remaining = self.large.object_bytes();
        for arena in &self.normal {
            arena.for_each_object(|header| remaining += header.size());
        }
        ctx.stats.decrease_live(remaining);
        for arena in &mut self.normal {
            arena.orphan_pages(ctx);
        }
        self.large.orphan_pages(ctx);
    }

    pub fn page_count(&self) -> usize {
        self.normal.iter().map(NormalPageArena::page_count).sum::<usize>() + self.large.page_count()
    }
}
