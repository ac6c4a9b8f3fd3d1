//! The per-object header.

use std::cell::Cell;
use std::ptr::NonNull;

use super::{ALLOCATION_GRANULARITY, HEADER_SIZE};
use crate::gc_info::GcInfoIndex;

const FREE: u16 = 1 << 0;
const MARKED: u16 = 1 << 1;
const DEAD: u16 = 1 << 2;
const PROMPTLY_FREED: u16 = 1 << 3;
const REUSE_FORBIDDEN: u16 = 1 << 4;

/// `size` value reserved for the single object of a large-object page.
const LARGE_OBJECT_SIZE_ENCODING: u32 = 0;

/// `gc_info_index` value reserved for free-list entries.
const FREE_LIST_GC_INFO_INDEX: u16 = 0;

/// Header physically preceding every payload.
///
/// `size` covers header and payload. Large objects store `0` and keep their
/// real size in the page. Free-list entries store `gc_info_index == 0` and
/// have the `FREE` flag set.
#[repr(C)]
pub struct ObjectHeader {
    size: Cell<u32>,
    gc_info_index: Cell<u16>,
    flags: Cell<u16>,
}

const _: () = assert!(std::mem::size_of::<ObjectHeader>() == ALLOCATION_GRANULARITY);

impl ObjectHeader {
    /// Writes a header for a live object at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be granularity-aligned and valid for `HEADER_SIZE` bytes.
    pub(crate) unsafe fn write_object<'a>(
        address: NonNull<u8>,
        size: usize,
        index: GcInfoIndex,
    ) -> &'a Self {
        debug_assert!(size % ALLOCATION_GRANULARITY == 0);
        let header = address.cast::<Self>();
        // SAFETY: caller guarantees the slot.
        unsafe {
            header.as_ptr().write(Self {
                size: Cell::new(u32::try_from(size).unwrap_or(u32::MAX)),
                gc_info_index: Cell::new(index.get()),
                flags: Cell::new(0),
            });
            &*header.as_ptr()
        }
    }

    /// Writes the header of a large object.
    ///
    /// # Safety
    ///
    /// See [`ObjectHeader::write_object`].
    pub(crate) unsafe fn write_large_object<'a>(
        address: NonNull<u8>,
        index: GcInfoIndex,
    ) -> &'a Self {
        let header = address.cast::<Self>();
        // SAFETY: caller guarantees the slot.
        unsafe {
            header.as_ptr().write(Self {
                size: Cell::new(LARGE_OBJECT_SIZE_ENCODING),
                gc_info_index: Cell::new(index.get()),
                flags: Cell::new(0),
            });
            &*header.as_ptr()
        }
    }

    /// Writes a free-list entry header.
    ///
    /// # Safety
    ///
    /// See [`ObjectHeader::write_object`].
    pub(crate) unsafe fn write_free<'a>(address: NonNull<u8>, size: usize) -> &'a Self {
        let header = address.cast::<Self>();
        // SAFETY: caller guarantees the slot.
        unsafe {
            header.as_ptr().write(Self {
                size: Cell::new(u32::try_from(size).unwrap_or(u32::MAX)),
                gc_info_index: Cell::new(FREE_LIST_GC_INFO_INDEX),
                flags: Cell::new(FREE),
            });
            &*header.as_ptr()
        }
    }

    /// Returns the header of the object whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be the payload address of a heap object.
    #[must_use]
    pub unsafe fn from_payload<'a>(payload: *const u8) -> &'a Self {
        // SAFETY: the header immediately precedes every payload.
        unsafe { &*payload.sub(HEADER_SIZE).cast::<Self>() }
    }

    /// Reads the header at `address`.
    ///
    /// # Safety
    ///
    /// `address` must point at a header inside a heap page.
    pub(crate) unsafe fn at<'a>(address: *const u8) -> &'a Self {
        // SAFETY: caller guarantees a header lives there.
        unsafe { &*address.cast::<Self>() }
    }

    /// Address of the header itself.
    pub(crate) fn address(&self) -> *mut u8 {
        std::ptr::from_ref(self).cast::<u8>().cast_mut()
    }

    /// Address of the payload.
    #[must_use]
    pub fn payload(&self) -> *mut u8 {
        // SAFETY: the payload follows the header in the same allocation.
        unsafe { self.address().add(HEADER_SIZE) }
    }

    /// Span size including the header; `0` for large objects.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.get() as usize
    }

    /// Whether this is the header of a large-object page.
    #[must_use]
    pub fn is_large_object(&self) -> bool {
        self.size.get() == LARGE_OBJECT_SIZE_ENCODING
    }

    /// Index of the object's type descriptor, `None` for free entries.
    #[must_use]
    pub fn gc_info_index(&self) -> Option<GcInfoIndex> {
        GcInfoIndex::new(self.gc_info_index.get())
    }

    /// Whether this span is a free-list entry.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.flags.get() & FREE != 0
    }

    /// Whether the object was marked in the current cycle.
    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.flags.get() & MARKED != 0
    }

    /// Whether the object was found dead by an earlier cycle and awaits its sweep.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.flags.get() & DEAD != 0
    }

    /// Whether the object was released explicitly and already finalized.
    #[must_use]
    pub fn is_promptly_freed(&self) -> bool {
        self.flags.get() & PROMPTLY_FREED != 0
    }

    /// Whether the span holds no object that still needs finalization.
    pub(crate) fn is_free_or_promptly_freed(&self) -> bool {
        self.flags.get() & (FREE | PROMPTLY_FREED) != 0
    }

    /// Sets the mark bit. Returns `false` if it was already set.
    pub(crate) fn try_mark(&self) -> bool {
        let flags = self.flags.get();
        debug_assert!(flags & DEAD == 0, "dead objects are never marked");
        if flags & MARKED != 0 {
            return false;
        }
        self.flags.set(flags | MARKED);
        true
    }

    pub(crate) fn unmark(&self) {
        self.flags.set(self.flags.get() & !MARKED);
    }

    pub(crate) fn mark_dead(&self) {
        debug_assert!(!self.is_marked());
        self.flags.set(self.flags.get() | DEAD);
    }

    pub(crate) fn mark_promptly_freed(&self) {
        self.flags.set(self.flags.get() | PROMPTLY_FREED);
    }

    pub(crate) fn is_reuse_forbidden(&self) -> bool {
        self.flags.get() & REUSE_FORBIDDEN != 0
    }

    pub(crate) fn forbid_reuse(&self) {
        self.flags.set(self.flags.get() | REUSE_FORBIDDEN);
    }
}

impl std::fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("address", &self.address())
            .field("size", &self.size())
            .field("gc_info_index", &self.gc_info_index.get())
            .field("free", &self.is_free())
            .field("marked", &self.is_marked())
            .field("dead", &self.is_dead())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Box<[u64; 4]> {
        Box::new([0; 4])
    }

    #[test]
    fn test_object_header_flags() {
        let mut memory = slot();
        let address = NonNull::from(&mut memory[0]).cast::<u8>();
        let index = GcInfoIndex::new(3).expect("non-zero");
        let header = unsafe { ObjectHeader::write_object(address, 32, index) };

        assert_eq!(header.size(), 32);
        assert_eq!(header.gc_info_index(), Some(index));
        assert!(!header.is_free());
        assert!(header.try_mark());
        assert!(!header.try_mark());
        assert!(header.is_marked());
        header.unmark();
        header.mark_dead();
        assert!(header.is_dead());
        assert!(!header.is_marked());
    }

    #[test]
    fn test_free_header_has_reserved_index() {
        let mut memory = slot();
        let address = NonNull::from(&mut memory[0]).cast::<u8>();
        let header = unsafe { ObjectHeader::write_free(address, 24) };
        assert!(header.is_free());
        assert_eq!(header.gc_info_index(), None);
        assert!(!header.is_large_object());
    }

    #[test]
    fn test_payload_round_trip() {
        let mut memory = slot();
        let address = NonNull::from(&mut memory[0]).cast::<u8>();
        let index = GcInfoIndex::new(1).expect("non-zero");
        let header = unsafe { ObjectHeader::write_large_object(address, index) };
        assert!(header.is_large_object());
        let again = unsafe { ObjectHeader::from_payload(header.payload()) };
        assert!(std::ptr::eq(header, again));
    }
}
