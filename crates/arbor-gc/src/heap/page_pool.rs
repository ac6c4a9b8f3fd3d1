//! Page memory and the two page pools.
//!
//! [`FreePagePool`] keeps decommitted normal-page mappings for reuse so the
//! arenas do not churn through `mmap`. [`OrphanedPagePool`] quarantines the
//! pages of terminated threads until a global marking proves that nothing
//! traced into them.

use std::alloc::{handle_alloc_error, Layout};
use std::io;
use std::ptr::NonNull;

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use super::page::{BasePage, PageKind};
use super::{PageMap, NORMAL_ARENA_COUNT, ORPHANED_ZAP_VALUE, PAGE_SIZE};
use crate::metrics::HeapStats;

/// A `PAGE_SIZE`-aligned block of virtual memory.
///
/// The mapping over-reserves one page so the usable range can be aligned.
pub(crate) struct PageMemory {
    mmap: Mmap,
    offset: usize,
    len: usize,
}

impl PageMemory {
    /// Maps `len` bytes aligned to `PAGE_SIZE`.
    pub fn allocate(len: usize) -> io::Result<Self> {
        let os_page = sys_alloc::page_size();
        let len = (len + os_page - 1) & !(os_page - 1);
        let mmap = MmapOptions::new()
            .len(len + PAGE_SIZE)
            .no_reserve(true)
            .map_anon()?;
        let start = mmap.ptr() as usize;
        let aligned = (start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        Ok(Self {
            mmap,
            offset: aligned - start,
            len,
        })
    }

    /// Maps `len` bytes, retrying once before giving up on the process.
    pub fn allocate_or_abort(len: usize) -> Box<Self> {
        match Self::allocate(len).or_else(|_| Self::allocate(len)) {
            Ok(memory) => Box::new(memory),
            Err(_) => handle_alloc_error(
                Layout::from_size_align(len, PAGE_SIZE).unwrap_or_else(|_| Layout::new::<u8>()),
            ),
        }
    }

    pub fn base(&self) -> NonNull<u8> {
        // SAFETY: `offset` lies inside the mapping, which is never null.
        unsafe { NonNull::new_unchecked(self.mmap.ptr().add(self.offset)) }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub fn commit(&self) -> io::Result<()> {
        self.mmap.commit(self.offset, self.len)
    }

    pub fn decommit(&self) -> io::Result<()> {
        self.mmap.decommit(self.offset, self.len)
    }
}

/// Decommitted normal pages, one stack per normal arena.
pub(crate) struct FreePagePool {
    pools: [Mutex<Vec<Box<PageMemory>>>; NORMAL_ARENA_COUNT],
}

impl FreePagePool {
    pub fn new() -> Self {
        Self {
            pools: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    /// Decommits `memory` and keeps it for the arena `index`.
    pub fn add_free_page(&self, index: usize, memory: Box<PageMemory>) {
        // A mapping that cannot be decommitted is simply unmapped.
        if memory.decommit().is_ok() {
            self.pools[index].lock().push(memory);
        }
    }

    /// Pops and recommits a page for arena `index`.
    ///
    /// Mappings that fail to recommit are dropped; `None` means the caller
    /// has to map a fresh page.
    pub fn take_free_page(&self, index: usize) -> Option<Box<PageMemory>> {
        loop {
            let memory = self.pools[index].lock().pop()?;
            if memory.commit().is_ok() {
                return Some(memory);
            }
        }
    }

    pub fn len(&self, index: usize) -> usize {
        self.pools[index].lock().len()
    }
}

struct OrphanedPage(NonNull<BasePage>);

// SAFETY: orphaned pages are owned by the pool and only touched under its lock
// or during a stop-the-world pause.
unsafe impl Send for OrphanedPage {}

/// Quarantine for the pages of terminated threads.
pub(crate) struct OrphanedPagePool {
    pages: Mutex<Vec<OrphanedPage>>,
}

impl OrphanedPagePool {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(Vec::new()),
        }
    }

    /// Zaps the page payload and quarantines the page.
    ///
    /// # Safety
    ///
    /// `page` must be a live page that is no longer linked into any arena.
    pub unsafe fn add_orphaned_page(&self, page: NonNull<BasePage>) {
        // SAFETY: caller hands over a detached, live page.
        let base = unsafe { page.as_ref() };
        base.orphan();
        let (start, len) = base.payload_range();
        // SAFETY: the payload range lies inside the committed page.
        unsafe { std::ptr::write_bytes(start, ORPHANED_ZAP_VALUE, len) };
        self.pages.lock().push(OrphanedPage(page));
    }

    /// Releases every orphaned page that the last marking did not reach.
    ///
    /// Normal pages go back to the free page pool, large pages are unmapped.
    /// Returns `(released, still_quarantined)`.
    pub fn decommit_orphaned_pages(
        &self,
        free_pages: &FreePagePool,
        page_map: &PageMap,
        stats: &HeapStats,
    ) -> (usize, usize) {
        let mut pages = self.pages.lock();
        let mut released = 0;
        pages.retain(|page| {
            // SAFETY: pages in the pool stay mapped until released here.
            let base = unsafe { page.0.as_ref() };
            if base.take_traced_after_orphaned() {
                return true;
            }
            released += 1;
            // SAFETY: the page is untraced and owned by the pool.
            unsafe { release_page(page.0, free_pages, page_map, stats) };
            false
        });
        (released, pages.len())
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }
}

impl Drop for OrphanedPagePool {
    fn drop(&mut self) {
        for page in self.pages.get_mut().drain(..) {
            // SAFETY: the pool owns the page; reclaiming the box unmaps it.
            drop(unsafe { BasePage::take_memory(page.0) });
        }
    }
}

/// Unregisters `page` and returns its memory: normal pages to the free page
/// pool, large pages to the OS.
///
/// # Safety
///
/// `page` must not be referenced by any arena or pool afterwards.
pub(crate) unsafe fn release_page(
    page: NonNull<BasePage>,
    free_pages: &FreePagePool,
    page_map: &PageMap,
    stats: &HeapStats,
) {
    // SAFETY: the page is still mapped here.
    let (kind, arena) = unsafe {
        let base = page.as_ref();
        (base.kind(), base.arena_index().as_usize())
    };
    page_map.remove(page.as_ptr() as usize);
    // SAFETY: caller relinquishes the page.
    let memory = unsafe { BasePage::take_memory(page) };
    stats.decrease_space(memory.len());
    match kind {
        PageKind::Normal => free_pages.add_free_page(arena, memory),
        PageKind::LargeObject => drop(memory),
    }
}
