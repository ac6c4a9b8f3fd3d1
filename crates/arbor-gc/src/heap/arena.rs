//! Arenas: page lists, bump allocation, free lists and sweeping.
//!
//! Each arena keeps two intrusive page lists. Pages on the swept list are
//! safe to allocate from; pages on the to-sweep list still carry the mark
//! bits of the last cycle and are swept lazily, one page at a time, when
//! the allocator runs dry or when an idle task asks for it.

use std::ptr::{self, NonNull};

use super::free_list::FreeList;
use super::header::ObjectHeader;
use super::page::{finalize, BasePage, LargeObjectPage, NormalPage};
use super::page_pool::{release_page, PageMemory};
use super::{ArenaIndex, HeapContext, PAGE_SIZE};

/// Outcome of sweeping one page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SweepResult {
    pub freed_bytes: usize,
    pub page_released: bool,
}

fn push_page(list: &mut Option<NonNull<BasePage>>, page: NonNull<BasePage>) {
    // SAFETY: pages on arena lists stay mapped while linked.
    unsafe { page.as_ref() }.set_next(*list);
    *list = Some(page);
}

fn pop_page(list: &mut Option<NonNull<BasePage>>) -> Option<NonNull<BasePage>> {
    let page = (*list)?;
    // SAFETY: as above.
    let base = unsafe { page.as_ref() };
    *list = base.next();
    base.set_next(None);
    Some(page)
}

fn for_each_page(list: Option<NonNull<BasePage>>, mut f: impl FnMut(&BasePage)) {
    let mut cursor = list;
    while let Some(page) = cursor {
        // SAFETY: as above.
        let base = unsafe { page.as_ref() };
        cursor = base.next();
        f(base);
    }
}

fn count_pages(list: Option<NonNull<BasePage>>) -> usize {
    let mut count = 0;
    for_each_page(list, |_| count += 1);
    count
}

/// Appends `from` in front of `to`, clearing the swept flag on the way.
fn splice_unswept(from: &mut Option<NonNull<BasePage>>, to: &mut Option<NonNull<BasePage>>) {
    while let Some(page) = pop_page(from) {
        // SAFETY: as above.
        unsafe { page.as_ref() }.set_swept(false);
        push_page(to, page);
    }
}

fn orphan_list(list: &mut Option<NonNull<BasePage>>, ctx: &HeapContext<'_>) {
    while let Some(page) = pop_page(list) {
        // SAFETY: the page was just unlinked and is handed to the pool.
        unsafe { ctx.orphaned_pages.add_orphaned_page(page) };
    }
}

/// Returns a freed span to `free_list`, honouring the reuse quarantine.
///
/// # Safety
///
/// The span must be unused memory inside one page of the arena.
unsafe fn add_gap(free_list: &mut FreeList, start: NonNull<u8>, size: usize, reusable: bool) {
    #[cfg(feature = "delayed-reuse")]
    {
        use super::{MIN_FREE_LIST_ENTRY_SIZE, REUSE_ALLOWED_ZAP_VALUE, REUSE_FORBIDDEN_ZAP_VALUE};
        if !reusable {
            // SAFETY: caller hands over the span.
            unsafe { FreeList::add_quarantined(start, size, REUSE_FORBIDDEN_ZAP_VALUE) };
            return;
        }
        // SAFETY: caller hands over the span.
        unsafe {
            free_list.add_to_free_list(start, size);
            if size > MIN_FREE_LIST_ENTRY_SIZE {
                ptr::write_bytes(
                    start.as_ptr().add(MIN_FREE_LIST_ENTRY_SIZE),
                    REUSE_ALLOWED_ZAP_VALUE,
                    size - MIN_FREE_LIST_ENTRY_SIZE,
                );
            }
        }
    }
    #[cfg(not(feature = "delayed-reuse"))]
    {
        let _ = reusable;
        // SAFETY: caller hands over the span.
        unsafe { free_list.add_to_free_list(start, size) };
    }
}

/// Arena of normal pages for one size range.
pub(crate) struct NormalPageArena {
    index: ArenaIndex,
    first_page: Option<NonNull<BasePage>>,
    first_unswept_page: Option<NonNull<BasePage>>,
    free_list: FreeList,
    current_allocation_point: Option<NonNull<u8>>,
    remaining_allocation_size: usize,
    promptly_freed_size: usize,
}

impl NormalPageArena {
    pub const fn new(index: ArenaIndex) -> Self {
        Self {
            index,
            first_page: None,
            first_unswept_page: None,
            free_list: FreeList::new(),
            current_allocation_point: None,
            remaining_allocation_size: 0,
            promptly_freed_size: 0,
        }
    }

    pub const fn promptly_freed_size(&self) -> usize {
        self.promptly_freed_size
    }

    pub const fn has_unswept_pages(&self) -> bool {
        self.first_unswept_page.is_some()
    }

    pub fn page_count(&self) -> usize {
        count_pages(self.first_page) + count_pages(self.first_unswept_page)
    }

    /// Bytes on the free list, bump region included.
    pub fn free_size(&self) -> usize {
        self.free_list.free_size() + self.remaining_allocation_size
    }

    /// Replaces the bump region, returning the old remainder to the free list.
    fn set_allocation_point(&mut self, point: Option<NonNull<u8>>, size: usize) {
        if let Some(old) = self.current_allocation_point {
            if self.remaining_allocation_size > 0 {
                // SAFETY: the bump remainder is unused memory of this arena.
                unsafe { add_gap(&mut self.free_list, old, self.remaining_allocation_size, true) };
            }
        }
        self.current_allocation_point = point;
        self.remaining_allocation_size = if point.is_some() { size } else { 0 };
    }

    /// Step 1: carve from the bump region. Returns the header address.
    pub fn allocate_from_bump(&mut self, allocation_size: usize) -> Option<NonNull<u8>> {
        if self.remaining_allocation_size < allocation_size {
            return None;
        }
        let point = self.current_allocation_point?;
        self.remaining_allocation_size -= allocation_size;
        // SAFETY: the bump region holds at least `allocation_size` more bytes.
        let next = unsafe { point.add(allocation_size) };
        self.current_allocation_point = Some(next);
        Some(point)
    }

    /// Step 2: largest free-list bucket, remainder becomes the bump region.
    pub fn allocate_from_free_list(&mut self, allocation_size: usize) -> Option<NonNull<u8>> {
        let (entry, size) = self.free_list.take_largest(allocation_size)?;
        self.set_allocation_point(Some(entry), size);
        self.allocate_from_bump(allocation_size)
    }

    /// Step 3: sweep to-sweep pages until the free list can serve the request.
    pub fn lazy_sweep(
        &mut self,
        allocation_size: usize,
        ctx: &HeapContext<'_>,
    ) -> Option<NonNull<u8>> {
        while self.sweep_next_page(ctx).is_some() {
            if let Some(address) = self.allocate_from_free_list(allocation_size) {
                return Some(address);
            }
        }
        None
    }

    /// Sweeps the next to-sweep page.
    pub fn sweep_next_page(&mut self, ctx: &HeapContext<'_>) -> Option<SweepResult> {
        let page = pop_page(&mut self.first_unswept_page)?;
        // SAFETY: pages of a normal arena are normal pages.
        let normal = unsafe { page.as_ref().as_normal() };
        let free_list = &mut self.free_list;
        let sweep = normal.sweep(|start, size, reusable| {
            // SAFETY: gaps reported by the sweep are unused memory of this page.
            unsafe { add_gap(free_list, start, size, reusable) };
        });
        ctx.stats.decrease_live(sweep.freed_bytes);
        let page_released = sweep.live_bytes == 0;
        if page_released {
            // SAFETY: the page is unlinked and holds no live objects.
            unsafe { release_page(page, ctx.free_pages, ctx.page_map, ctx.stats) };
        } else {
            push_page(&mut self.first_page, page);
        }
        Some(SweepResult {
            freed_bytes: sweep.freed_bytes,
            page_released,
        })
    }

    pub fn complete_sweep(&mut self, ctx: &HeapContext<'_>) -> usize {
        let mut freed = 0;
        while let Some(result) = self.sweep_next_page(ctx) {
            freed += result.freed_bytes;
        }
        freed
    }

    /// Step 4: rebuilds the free list from free and promptly freed spans of
    /// all swept pages, merging neighbours.
    pub fn coalesce(&mut self) {
        self.set_allocation_point(None, 0);
        self.free_list.clear();
        let mut gaps: Vec<(NonNull<u8>, usize, bool)> = Vec::new();
        for_each_page(self.first_page, |base| {
            // SAFETY: pages of a normal arena are normal pages.
            let page = unsafe { base.as_normal() };
            let mut gap: Option<(NonNull<u8>, usize, bool)> = None;
            page.for_each_header(|header| {
                if header.is_free_or_promptly_freed() {
                    let reusable = !header.is_reuse_forbidden();
                    if cfg!(feature = "delayed-reuse")
                        && gap.is_some_and(|(_, _, gap_reusable)| gap_reusable != reusable)
                    {
                        if let Some(done) = gap.take() {
                            gaps.push(done);
                        }
                    }
                    match &mut gap {
                        Some((_, size, gap_reusable)) => {
                            *size += header.size();
                            *gap_reusable &= reusable;
                        }
                        None => {
                            // SAFETY: header addresses are never null.
                            let start = unsafe { NonNull::new_unchecked(header.address()) };
                            gap = Some((start, header.size(), reusable));
                        }
                    }
                } else if let Some(done) = gap.take() {
                    gaps.push(done);
                }
            });
            if let Some(done) = gap {
                gaps.push(done);
            }
            page.invalidate_object_start_bitmap();
        });
        for (start, size, reusable) in gaps {
            // SAFETY: every gap is free memory of a swept page of this arena.
            unsafe { add_gap(&mut self.free_list, start, size, reusable) };
        }
        self.promptly_freed_size = 0;
    }

    /// Step 5: maps a fresh page and turns its whole payload into a free entry.
    pub fn allocate_page(&mut self, ctx: &HeapContext<'_>) {
        let index = self.index.as_usize();
        let memory = ctx
            .free_pages
            .take_free_page(index)
            .unwrap_or_else(|| PageMemory::allocate_or_abort(PAGE_SIZE));
        let base = memory.base().as_ptr() as usize;
        let len = memory.len();
        let page = NormalPage::initialize(memory, self.index, ctx.owner);
        ctx.page_map.insert(base, len);
        ctx.stats.increase_space(len);
        // SAFETY: the page was just initialized.
        let start = unsafe { page.as_ref() }.payload_start();
        push_page(&mut self.first_page, page.cast::<BasePage>());
        // SAFETY: the payload of a fresh page is unused.
        unsafe {
            self.free_list.add_to_free_list(
                NonNull::new_unchecked(start),
                NormalPage::payload_size(),
            );
        }
    }

    /// Releases an object ahead of the next sweep.
    ///
    /// # Safety
    ///
    /// `header` must belong to a live object of this arena that nothing
    /// references any more.
    pub unsafe fn promptly_free(&mut self, header: &ObjectHeader) -> usize {
        // SAFETY: forwarded from the caller.
        unsafe { finalize(header) };
        let size = header.size();
        let address = header.address();
        // SAFETY: the object spans `size` bytes.
        let end = unsafe { address.add(size) };
        if self.current_allocation_point.map(NonNull::as_ptr) == Some(end) {
            // Last object carved from the bump region: give the bytes straight back.
            // SAFETY: as above.
            unsafe { ptr::write_bytes(address, 0, size) };
            self.current_allocation_point = NonNull::new(address);
            self.remaining_allocation_size += size;
            return size;
        }
        header.mark_promptly_freed();
        // SAFETY: the payload is no longer in use.
        unsafe { ptr::write_bytes(header.payload(), 0, size - super::HEADER_SIZE) };
        self.promptly_freed_size += size;
        size
    }

    pub fn make_consistent_for_gc(&mut self) {
        self.set_allocation_point(None, 0);
        self.free_list.clear();
        self.promptly_freed_size = 0;
        for_each_page(self.first_unswept_page, |base| {
            // SAFETY: pages of a normal arena are normal pages.
            let page = unsafe { base.as_normal() };
            page.make_consistent_for_gc();
            page.invalidate_object_start_bitmap();
        });
        for_each_page(self.first_page, |base| {
            // SAFETY: as above.
            unsafe { base.as_normal() }.invalidate_object_start_bitmap();
        });
    }

    pub fn prepare_for_sweep(&mut self) {
        splice_unswept(&mut self.first_page, &mut self.first_unswept_page);
    }

    pub fn orphan_pages(&mut self, ctx: &HeapContext<'_>) {
        self.set_allocation_point(None, 0);
        self.free_list.clear();
        orphan_list(&mut self.first_page, ctx);
        orphan_list(&mut self.first_unswept_page, ctx);
    }

    /// Calls `f` for every live header on swept and unswept pages.
    pub fn for_each_object(&self, mut f: impl FnMut(&ObjectHeader)) {
        let bump = self
            .current_allocation_point
            .map(|point| (point.as_ptr().cast_const(), self.remaining_allocation_size));
        for list in [self.first_page, self.first_unswept_page] {
            for_each_page(list, |base| {
                // SAFETY: pages of a normal arena are normal pages.
                unsafe { base.as_normal() }.for_each_header_around(bump, |header| {
                    if !header.is_free_or_promptly_freed() {
                        f(header);
                    }
                });
            });
        }
    }
}

/// Arena holding one object per page.
pub(crate) struct LargeObjectArena {
    first_page: Option<NonNull<BasePage>>,
    first_unswept_page: Option<NonNull<BasePage>>,
}

impl LargeObjectArena {
    pub const fn new() -> Self {
        Self {
            first_page: None,
            first_unswept_page: None,
        }
    }

    pub const fn has_unswept_pages(&self) -> bool {
        self.first_unswept_page.is_some()
    }

    pub fn page_count(&self) -> usize {
        count_pages(self.first_page) + count_pages(self.first_unswept_page)
    }

    /// Sweeps pages until at least `allocation_size` bytes were reclaimed.
    pub fn lazy_sweep(&mut self, allocation_size: usize, ctx: &HeapContext<'_>) -> bool {
        let mut swept = 0;
        while let Some(result) = self.sweep_next_page(ctx) {
            swept += result.freed_bytes;
            if swept >= allocation_size {
                return true;
            }
        }
        false
    }

    pub fn sweep_next_page(&mut self, ctx: &HeapContext<'_>) -> Option<SweepResult> {
        let page = pop_page(&mut self.first_unswept_page)?;
        // SAFETY: pages of the large arena are large pages.
        let large = unsafe { page.as_ref().as_large() };
        let promptly_freed = large.header().is_promptly_freed();
        if large.sweep() {
            push_page(&mut self.first_page, page);
            return Some(SweepResult {
                freed_bytes: 0,
                page_released: false,
            });
        }
        // The same quantity allocation counted as live.
        let freed_bytes = super::HEADER_SIZE + large.payload_size();
        if !promptly_freed {
            ctx.stats.decrease_live(freed_bytes);
        }
        // SAFETY: the page is unlinked and its object is dead.
        unsafe { release_page(page, ctx.free_pages, ctx.page_map, ctx.stats) };
        Some(SweepResult {
            freed_bytes,
            page_released: true,
        })
    }

    pub fn complete_sweep(&mut self, ctx: &HeapContext<'_>) -> usize {
        let mut freed = 0;
        while let Some(result) = self.sweep_next_page(ctx) {
            freed += result.freed_bytes;
        }
        freed
    }

    /// Maps a dedicated page and returns the header address of its object.
    pub fn allocate_page(&mut self, payload_size: usize, ctx: &HeapContext<'_>) -> NonNull<u8> {
        let memory = PageMemory::allocate_or_abort(LargeObjectPage::page_size_for(payload_size));
        let base = memory.base().as_ptr() as usize;
        let len = memory.len();
        let page = LargeObjectPage::initialize(memory, ctx.owner, payload_size);
        ctx.page_map.insert(base, len);
        ctx.stats.increase_space(len);
        push_page(&mut self.first_page, page.cast::<BasePage>());
        // SAFETY: the page was just initialized.
        unsafe { page.as_ref() }.header_address()
    }

    /// Finalizes a large object ahead of the next sweep; its page is
    /// released when that sweep reaches it.
    ///
    /// # Safety
    ///
    /// See [`NormalPageArena::promptly_free`].
    pub unsafe fn promptly_free(&mut self, header: &ObjectHeader) {
        // SAFETY: forwarded from the caller.
        unsafe { finalize(header) };
        header.mark_promptly_freed();
    }

    pub fn make_consistent_for_gc(&mut self) {
        for_each_page(self.first_unswept_page, |base| {
            // SAFETY: pages of the large arena are large pages.
            unsafe { base.as_large() }.make_consistent_for_gc();
        });
    }

    pub fn prepare_for_sweep(&mut self) {
        splice_unswept(&mut self.first_page, &mut self.first_unswept_page);
    }

    pub fn orphan_pages(&mut self, ctx: &HeapContext<'_>) {
        orphan_list(&mut self.first_page, ctx);
        orphan_list(&mut self.first_unswept_page, ctx);
    }

    /// Bytes of the objects not freed yet, counted the way allocation
    /// counts them.
    pub fn object_bytes(&self) -> usize {
        let mut bytes = 0;
        for list in [self.first_page, self.first_unswept_page] {
            for_each_page(list, |base| {
                // SAFETY: pages of the large arena are large pages.
                let large = unsafe { base.as_large() };
                if !large.header().is_promptly_freed() {
                    bytes += super::HEADER_SIZE + large.payload_size();
                }
            });
        }
        bytes
    }

    pub fn for_each_object(&self, mut f: impl FnMut(&ObjectHeader)) {
        for list in [self.first_page, self.first_unswept_page] {
            for_each_page(list, |base| {
                // SAFETY: pages of the large arena are large pages.
                let header = unsafe { base.as_large() }.header();
                if !header.is_promptly_freed() {
                    f(header);
                }
            });
        }
    }
}
