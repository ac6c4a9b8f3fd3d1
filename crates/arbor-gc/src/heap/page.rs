//! Page metadata.
//!
//! Page metadata lives at the start of its own `PAGE_SIZE`-aligned mapping.
//! A [`NormalPage`] holds a sequence of `(header, payload)` records followed
//! by an object-start bitmap used to resolve interior pointers; a
//! [`LargeObjectPage`] holds exactly one object.

use std::cell::{Cell, UnsafeCell};
use std::ptr::{self, NonNull};

use super::header::ObjectHeader;
use super::page_pool::PageMemory;
use super::{ArenaIndex, ALLOCATION_GRANULARITY, HEADER_SIZE, PAGE_SIZE};
use crate::gc_info::GcInfoTable;
use crate::thread_state::ThreadState;

/// Magic number for validating GC pages ("ARBR" in ASCII).
pub const MAGIC_GC_PAGE: u32 = 0x4152_4252;

const BITMAP_BITS: usize = PAGE_SIZE / ALLOCATION_GRANULARITY;
const BITMAP_WORDS: usize = BITMAP_BITS / 64;

/// Kind of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    /// Many objects of one arena.
    Normal,
    /// Exactly one object.
    LargeObject,
}

/// Metadata shared by all pages.
#[repr(C)]
pub struct BasePage {
    magic: u32,
    kind: PageKind,
    arena_index: ArenaIndex,
    swept: Cell<bool>,
    orphaned: Cell<bool>,
    traced_after_orphaned: Cell<bool>,
    owner: Cell<*const ThreadState>,
    next: Cell<Option<NonNull<BasePage>>>,
    memory: Cell<*mut PageMemory>,
}

impl BasePage {
    fn new(
        kind: PageKind,
        arena_index: ArenaIndex,
        owner: *const ThreadState,
        memory: Box<PageMemory>,
    ) -> Self {
        Self {
            magic: MAGIC_GC_PAGE,
            kind,
            arena_index,
            swept: Cell::new(true),
            orphaned: Cell::new(false),
            traced_after_orphaned: Cell::new(false),
            owner: Cell::new(owner),
            next: Cell::new(None),
            memory: Cell::new(Box::into_raw(memory)),
        }
    }

    /// Returns the page containing the object header at `address`.
    ///
    /// Only meaningful for addresses already known to be inside the heap.
    #[must_use]
    pub fn from_object_address(address: *const u8) -> NonNull<Self> {
        let base = address as usize & !(PAGE_SIZE - 1);
        // SAFETY: heap addresses are never in the first page of the address space.
        unsafe { NonNull::new_unchecked(base as *mut Self) }
    }

    /// Returns the page holding the object whose payload starts at `payload`.
    #[must_use]
    pub fn from_payload(payload: *const u8) -> NonNull<Self> {
        Self::from_object_address(payload.wrapping_sub(HEADER_SIZE))
    }

    /// Reclaims the page memory. The metadata is gone afterwards.
    ///
    /// # Safety
    ///
    /// `page` must not be used again.
    pub(crate) unsafe fn take_memory(page: NonNull<Self>) -> Box<PageMemory> {
        // SAFETY: `memory` was created by `Box::into_raw` and is taken once.
        unsafe { Box::from_raw(page.as_ref().memory.get()) }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.magic == MAGIC_GC_PAGE
    }

    /// Kind of the page.
    #[must_use]
    pub const fn kind(&self) -> PageKind {
        self.kind
    }

    /// Arena the page belongs to.
    #[must_use]
    pub const fn arena_index(&self) -> ArenaIndex {
        self.arena_index
    }

    pub(crate) fn owner(&self) -> *const ThreadState {
        self.owner.get()
    }

    /// Whether the page was swept since the last marking.
    #[must_use]
    pub fn is_swept(&self) -> bool {
        self.swept.get()
    }

    pub(crate) fn set_swept(&self, swept: bool) {
        self.swept.set(swept);
    }

    /// Whether the page belongs to a terminated thread.
    #[must_use]
    pub fn is_orphaned(&self) -> bool {
        self.orphaned.get()
    }

    pub(crate) fn orphan(&self) {
        self.orphaned.set(true);
        self.traced_after_orphaned.set(false);
        self.owner.set(ptr::null());
        self.next.set(None);
    }

    pub(crate) fn mark_traced_after_orphaned(&self) {
        self.traced_after_orphaned.set(true);
    }

    pub(crate) fn take_traced_after_orphaned(&self) -> bool {
        self.traced_after_orphaned.replace(false)
    }

    pub(crate) fn next(&self) -> Option<NonNull<Self>> {
        self.next.get()
    }

    pub(crate) fn set_next(&self, next: Option<NonNull<Self>>) {
        self.next.set(next);
    }

    fn address(&self) -> *mut u8 {
        ptr::from_ref(self).cast::<u8>().cast_mut()
    }

    /// Mapped length of the page.
    pub(crate) fn size(&self) -> usize {
        // SAFETY: `memory` stays valid for the lifetime of the page.
        unsafe { (*self.memory.get()).len() }
    }

    /// `[start, start + len)` holding object headers and payloads.
    pub(crate) fn payload_range(&self) -> (*mut u8, usize) {
        match self.kind {
            PageKind::Normal => {
                // SAFETY: `NormalPage` starts with its `BasePage`.
                let page = unsafe { self.as_normal() };
                (page.payload_start(), page.payload_end() as usize - page.payload_start() as usize)
            }
            PageKind::LargeObject => {
                // SAFETY: `LargeObjectPage` starts with its `BasePage`.
                let page = unsafe { self.as_large() };
                let header = page.header().address();
                (header, HEADER_SIZE + page.payload_size())
            }
        }
    }

    /// # Safety
    ///
    /// `self.kind()` must be [`PageKind::Normal`].
    pub(crate) unsafe fn as_normal(&self) -> &NormalPage {
        debug_assert_eq!(self.kind, PageKind::Normal);
        // SAFETY: `NormalPage` is `repr(C)` with `BasePage` first.
        unsafe { &*ptr::from_ref(self).cast::<NormalPage>() }
    }

    /// # Safety
    ///
    /// `self.kind()` must be [`PageKind::LargeObject`].
    pub(crate) unsafe fn as_large(&self) -> &LargeObjectPage {
        debug_assert_eq!(self.kind, PageKind::LargeObject);
        // SAFETY: `LargeObjectPage` is `repr(C)` with `BasePage` first.
        unsafe { &*ptr::from_ref(self).cast::<LargeObjectPage>() }
    }

    /// Resolves an arbitrary address inside this page to the object that
    /// contains it, skipping free and dead spans.
    pub(crate) fn find_live_header(&self, address: *const u8) -> Option<&ObjectHeader> {
        if self.is_orphaned() {
            return None;
        }
        let header = match self.kind {
            // SAFETY: kind checked by the match.
            PageKind::Normal => unsafe { self.as_normal() }.find_header_from_address(address)?,
            PageKind::LargeObject => {
                // SAFETY: kind checked by the match.
                let page = unsafe { self.as_large() };
                if !page.contains(address) {
                    return None;
                }
                page.header()
            }
        };
        if header.is_free_or_promptly_freed() || header.is_dead() {
            return None;
        }
        Some(header)
    }
}

/// Bytes reclaimed and retained by one page sweep.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PageSweep {
    pub live_bytes: usize,
    pub freed_bytes: usize,
}

/// A page holding many objects of one arena.
#[repr(C)]
pub struct NormalPage {
    base: BasePage,
    object_start_bitmap_computed: Cell<bool>,
    object_start_bitmap: UnsafeCell<[u64; BITMAP_WORDS]>,
}

impl NormalPage {
    const fn payload_offset() -> usize {
        let size = std::mem::size_of::<Self>();
        (size + ALLOCATION_GRANULARITY - 1) & !(ALLOCATION_GRANULARITY - 1)
    }

    /// Bytes available for headers and payloads.
    #[must_use]
    pub const fn payload_size() -> usize {
        PAGE_SIZE - Self::payload_offset()
    }

    /// Largest payload a single object in a normal page can have.
    #[must_use]
    pub const fn max_payload_size() -> usize {
        Self::payload_size() - HEADER_SIZE
    }

    /// Formats fresh page memory as an empty normal page.
    pub(crate) fn initialize(
        memory: Box<PageMemory>,
        arena_index: ArenaIndex,
        owner: *const ThreadState,
    ) -> NonNull<Self> {
        let page = memory.base().cast::<Self>();
        let base = BasePage::new(PageKind::Normal, arena_index, owner, memory);
        // SAFETY: the memory is committed, aligned and large enough.
        unsafe {
            page.as_ptr().write(Self {
                base,
                object_start_bitmap_computed: Cell::new(false),
                object_start_bitmap: UnsafeCell::new([0; BITMAP_WORDS]),
            });
        }
        page
    }

    /// The shared page metadata.
    #[must_use]
    pub const fn base(&self) -> &BasePage {
        &self.base
    }

    pub(crate) fn payload_start(&self) -> *mut u8 {
        // SAFETY: the payload offset is inside the page.
        unsafe { self.base.address().add(Self::payload_offset()) }
    }

    pub(crate) fn payload_end(&self) -> *mut u8 {
        // SAFETY: one past the end of the page mapping.
        unsafe { self.base.address().add(PAGE_SIZE) }
    }

    pub(crate) fn contains_payload(&self, address: *const u8) -> bool {
        address >= self.payload_start().cast_const() && address < self.payload_end().cast_const()
    }

    /// Calls `f` for every header in address order.
    ///
    /// The page must not contain an unformatted bump region.
    pub(crate) fn for_each_header(&self, f: impl FnMut(&ObjectHeader)) {
        self.for_each_header_around(None, f);
    }

    /// Like [`Self::for_each_header`], stepping over the unformatted
    /// `(start, len)` bump region if it lies on this page.
    pub(crate) fn for_each_header_around(
        &self,
        bump: Option<(*const u8, usize)>,
        mut f: impl FnMut(&ObjectHeader),
    ) {
        let end = self.payload_end();
        let mut address = self.payload_start();
        while address < end {
            if let Some((start, len)) = bump {
                if ptr::eq(address.cast_const(), start) && len > 0 {
                    // SAFETY: the bump region lies inside the payload area.
                    address = unsafe { address.add(len) };
                    continue;
                }
            }
            // SAFETY: headers tile the payload area without gaps.
            let header = unsafe { ObjectHeader::at(address) };
            let size = header.size();
            debug_assert!(size >= HEADER_SIZE, "unformatted span in normal page");
            if size < HEADER_SIZE {
                break;
            }
            f(header);
            // SAFETY: `size` keeps the cursor within the page.
            address = unsafe { address.add(size) };
        }
    }

    pub(crate) fn invalidate_object_start_bitmap(&self) {
        self.object_start_bitmap_computed.set(false);
    }

    fn populate_object_start_bitmap(&self) {
        // SAFETY: only the collecting thread touches the bitmap.
        let bitmap = unsafe { &mut *self.object_start_bitmap.get() };
        bitmap.fill(0);
        let base = self.base.address() as usize;
        self.for_each_header(|header| {
            let bit = (header.address() as usize - base) / ALLOCATION_GRANULARITY;
            bitmap[bit / 64] |= 1 << (bit % 64);
        });
        self.object_start_bitmap_computed.set(true);
    }

    /// Finds the header whose span contains `address`.
    pub(crate) fn find_header_from_address(&self, address: *const u8) -> Option<&ObjectHeader> {
        if !self.contains_payload(address) {
            return None;
        }
        if !self.object_start_bitmap_computed.get() {
            self.populate_object_start_bitmap();
        }
        // SAFETY: populated above; only the collecting thread reads it.
        let bitmap = unsafe { &*self.object_start_bitmap.get() };
        let base = self.base.address() as usize;
        let bit = (address as usize - base) / ALLOCATION_GRANULARITY;
        let mut word_index = bit / 64;
        let mut word = bitmap[word_index] & (u64::MAX >> (63 - bit % 64));
        while word == 0 {
            if word_index == 0 {
                return None;
            }
            word_index -= 1;
            word = bitmap[word_index];
        }
        let start_bit = word_index * 64 + (63 - word.leading_zeros() as usize);
        let header_address = (base + start_bit * ALLOCATION_GRANULARITY) as *const u8;
        // SAFETY: the bitmap only records header starts.
        let header = unsafe { ObjectHeader::at(header_address) };
        if (address as usize) < header_address as usize + header.size() {
            Some(header)
        } else {
            None
        }
    }

    /// Unmarks survivors of an unswept page and marks everything else dead.
    pub(crate) fn make_consistent_for_gc(&self) {
        self.for_each_header(|header| {
            if header.is_free_or_promptly_freed() {
                return;
            }
            if header.is_marked() {
                header.unmark();
            } else {
                header.mark_dead();
            }
        });
    }

    /// Finalizes unmarked objects and hands the freed spans to `add_gap`.
    ///
    /// Gaps are only reported for pages that keep at least one live object;
    /// a page with no survivors reports zero live bytes and the caller
    /// releases it whole.
    ///
    /// `add_gap(start, size, reusable)`: `reusable` is `false` when the gap
    /// holds memory freed by this very sweep. Spans quarantined by the
    /// previous sweep come back reusable. With `delayed-reuse`, gaps never
    /// mix the two, so a quarantined span waits exactly one sweep.
    pub(crate) fn sweep(&self, mut add_gap: impl FnMut(NonNull<u8>, usize, bool)) -> PageSweep {
        let mut result = PageSweep::default();
        let mut gaps: Vec<(NonNull<u8>, usize, bool)> = Vec::new();
        let mut gap: Option<(NonNull<u8>, usize, bool)> = None;

        self.for_each_header(|header| {
            let size = header.size();
            let reusable = if header.is_free() || header.is_promptly_freed() {
                true
            } else if header.is_marked() {
                header.unmark();
                result.live_bytes += size;
                if let Some(done) = gap.take() {
                    gaps.push(done);
                }
                return;
            } else {
                // SAFETY: unmarked, unfinalized object on a page being swept.
                unsafe { finalize(header) };
                result.freed_bytes += size;
                false
            };
            if cfg!(feature = "delayed-reuse")
                && gap.is_some_and(|(_, _, gap_reusable)| gap_reusable != reusable)
            {
                if let Some(done) = gap.take() {
                    gaps.push(done);
                }
            }
            match &mut gap {
                Some((_, gap_size, gap_reusable)) => {
                    *gap_size += size;
                    *gap_reusable &= reusable;
                }
                None => {
                    // SAFETY: header addresses are never null.
                    let start = unsafe { NonNull::new_unchecked(header.address()) };
                    gap = Some((start, size, reusable));
                }
            }
        });
        if let Some(done) = gap {
            gaps.push(done);
        }

        if result.live_bytes > 0 {
            for (start, size, reusable) in gaps {
                add_gap(start, size, reusable);
            }
        }
        self.invalidate_object_start_bitmap();
        self.base.set_swept(true);
        result
    }
}

/// A page holding exactly one object.
#[repr(C)]
pub struct LargeObjectPage {
    base: BasePage,
    payload_size: usize,
}

impl LargeObjectPage {
    const fn header_offset() -> usize {
        let size = std::mem::size_of::<Self>();
        (size + ALLOCATION_GRANULARITY - 1) & !(ALLOCATION_GRANULARITY - 1)
    }

    /// Mapping size needed for a payload of `payload_size` bytes.
    #[must_use]
    pub const fn page_size_for(payload_size: usize) -> usize {
        Self::header_offset() + HEADER_SIZE + payload_size
    }

    /// Formats fresh page memory as a large-object page and writes its header.
    pub(crate) fn initialize(
        memory: Box<PageMemory>,
        owner: *const ThreadState,
        payload_size: usize,
    ) -> NonNull<Self> {
        let page = memory.base().cast::<Self>();
        let base = BasePage::new(PageKind::LargeObject, ArenaIndex::LargeObject, owner, memory);
        // SAFETY: the memory is committed, aligned and large enough.
        unsafe { page.as_ptr().write(Self { base, payload_size }) };
        page
    }

    /// The shared page metadata.
    #[must_use]
    pub const fn base(&self) -> &BasePage {
        &self.base
    }

    pub(crate) fn header_address(&self) -> NonNull<u8> {
        // SAFETY: inside the page, never null.
        unsafe { NonNull::new_unchecked(self.base.address().add(Self::header_offset())) }
    }

    /// Header of the single object.
    pub fn header(&self) -> &ObjectHeader {
        // SAFETY: written when the object was allocated.
        unsafe { ObjectHeader::at(self.header_address().as_ptr()) }
    }

    /// Payload size of the single object.
    #[must_use]
    pub const fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub(crate) fn contains(&self, address: *const u8) -> bool {
        let start = self.header_address().as_ptr() as usize;
        let end = start + HEADER_SIZE + self.payload_size;
        (start..end).contains(&(address as usize))
    }

    pub(crate) fn make_consistent_for_gc(&self) {
        let header = self.header();
        if header.is_marked() {
            header.unmark();
        } else if !header.is_promptly_freed() {
            header.mark_dead();
        }
    }

    /// Returns `true` if the object survives; dead objects are finalized.
    pub(crate) fn sweep(&self) -> bool {
        let header = self.header();
        self.base.set_swept(true);
        if header.is_marked() {
            header.unmark();
            return true;
        }
        if !header.is_promptly_freed() {
            // SAFETY: the object is unreachable and finalized exactly once here.
            unsafe { finalize(header) };
        }
        false
    }
}

/// Runs the finalizer of the object behind `header`, if its type has one.
///
/// # Safety
///
/// The object must be unreachable and not yet finalized.
pub(crate) unsafe fn finalize(header: &ObjectHeader) {
    assert!(!header.is_free(), "finalizing a free-list entry");
    if let Some(index) = header.gc_info_index() {
        if let Some(finalize) = GcInfoTable::get(index).finalize {
            // SAFETY: the payload holds an initialized object of this type.
            unsafe { finalize(header.payload()) };
        }
    }
}
