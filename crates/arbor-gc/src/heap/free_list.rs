//! Power-of-two bucketed free list.
//!
//! An entry is a free [`ObjectHeader`] whose first payload word links to the
//! next entry of the same bucket. Bucket `i` holds spans of size
//! `[2^i, 2^(i+1))`.

use std::ptr::{self, NonNull};

use super::header::ObjectHeader;
use super::{HEADER_SIZE, MIN_FREE_LIST_ENTRY_SIZE};

const BUCKET_COUNT: usize = usize::BITS as usize;

pub(crate) struct FreeList {
    heads: [Option<NonNull<u8>>; BUCKET_COUNT],
    biggest_free_list_index: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            heads: [None; BUCKET_COUNT],
            biggest_free_list_index: 0,
        }
    }

    const fn bucket_index_for_size(size: usize) -> usize {
        debug_assert!(size > 0);
        (usize::BITS - 1 - size.leading_zeros()) as usize
    }

    fn next_of(entry: NonNull<u8>) -> Option<NonNull<u8>> {
        // SAFETY: the link slot is the first payload word of a linked entry.
        unsafe { entry.as_ptr().add(HEADER_SIZE).cast::<Option<NonNull<u8>>>().read() }
    }

    /// Formats `[address, address + size)` as free memory and links it.
    ///
    /// Spans too small to hold a link become unlinked filler entries.
    ///
    /// # Safety
    ///
    /// The span must be unused heap memory inside one page.
    pub unsafe fn add_to_free_list(&mut self, address: NonNull<u8>, size: usize) {
        // SAFETY: caller hands over the span.
        unsafe {
            ObjectHeader::write_free(address, size);
            if size > HEADER_SIZE {
                ptr::write_bytes(address.as_ptr().add(HEADER_SIZE), 0, size - HEADER_SIZE);
            }
        }
        if size < MIN_FREE_LIST_ENTRY_SIZE {
            return;
        }
        let index = Self::bucket_index_for_size(size);
        // SAFETY: the span can hold a link word.
        unsafe {
            address
                .as_ptr()
                .add(HEADER_SIZE)
                .cast::<Option<NonNull<u8>>>()
                .write(self.heads[index]);
        }
        self.heads[index] = Some(address);
        if index > self.biggest_free_list_index {
            self.biggest_free_list_index = index;
        }
    }

    /// Formats the span as an unlinked entry whose reuse is deferred to the
    /// next sweep.
    ///
    /// # Safety
    ///
    /// See [`FreeList::add_to_free_list`].
    #[cfg_attr(not(feature = "delayed-reuse"), allow(dead_code))]
    pub unsafe fn add_quarantined(address: NonNull<u8>, size: usize, zap: u8) {
        // SAFETY: caller hands over the span.
        let header = unsafe { ObjectHeader::write_free(address, size) };
        header.forbid_reuse();
        if size > HEADER_SIZE {
            // SAFETY: as above.
            unsafe { ptr::write_bytes(address.as_ptr().add(HEADER_SIZE), zap, size - HEADER_SIZE) };
        }
    }

    /// Takes the head of the largest non-empty bucket if it can hold
    /// `allocation_size` bytes.
    ///
    /// Returns the entry start and its full size. The entry bytes are left
    /// as they were; the caller reformats them.
    pub fn take_largest(&mut self, allocation_size: usize) -> Option<(NonNull<u8>, usize)> {
        let mut index = self.biggest_free_list_index;
        loop {
            if let Some(entry) = self.heads[index] {
                // SAFETY: linked entries carry a valid free header.
                let size = unsafe { ObjectHeader::at(entry.as_ptr()) }.size();
                if size < allocation_size {
                    self.biggest_free_list_index = index;
                    return None;
                }
                self.heads[index] = Self::next_of(entry);
                // Clear the link so the span reads as zeroed memory.
                // SAFETY: the link slot belongs to the entry.
                unsafe { entry.as_ptr().add(HEADER_SIZE).cast::<usize>().write(0) };
                self.biggest_free_list_index = index;
                return Some((entry, size));
            }
            if index == 0 {
                self.biggest_free_list_index = 0;
                return None;
            }
            index -= 1;
        }
    }

    pub fn clear(&mut self) {
        self.heads = [None; BUCKET_COUNT];
        self.biggest_free_list_index = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(Option::is_none)
    }

    /// Sum of the sizes of all linked entries.
    pub fn free_size(&self) -> usize {
        let mut total = 0;
        for head in &self.heads {
            let mut cursor = *head;
            while let Some(entry) = cursor {
                // SAFETY: linked entries carry a valid free header.
                total += unsafe { ObjectHeader::at(entry.as_ptr()) }.size();
                cursor = Self::next_of(entry);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Span(Vec<u64>);

    impl Span {
        fn new(bytes: usize) -> Self {
            Self(vec![u64::MAX; bytes / 8])
        }

        fn at(&mut self, offset: usize) -> NonNull<u8> {
            NonNull::new(self.0.as_mut_ptr().cast::<u8>().wrapping_add(offset)).expect("non-null")
        }
    }

    #[test]
    fn test_largest_bucket_is_taken_first() {
        let mut memory = Span::new(1024);
        let mut list = FreeList::new();
        unsafe {
            list.add_to_free_list(memory.at(0), 32);
            list.add_to_free_list(memory.at(64), 256);
            list.add_to_free_list(memory.at(512), 64);
        }
        assert_eq!(list.free_size(), 352);

        let (entry, size) = list.take_largest(16).expect("entry");
        assert_eq!(entry, memory.at(64));
        assert_eq!(size, 256);
        let (_, size) = list.take_largest(16).expect("entry");
        assert_eq!(size, 64);
    }

    #[test]
    fn test_head_too_small_fails_without_scanning() {
        let mut memory = Span::new(512);
        let mut list = FreeList::new();
        unsafe { list.add_to_free_list(memory.at(0), 40) };
        assert!(list.take_largest(48).is_none());
        assert!(!list.is_empty());
    }

    #[test]
    fn test_free_entry_payload_is_zeroed() {
        let mut memory = Span::new(128);
        let mut list = FreeList::new();
        unsafe { list.add_to_free_list(memory.at(0), 128) };
        assert!(memory.0[2..].iter().all(|word| *word == 0));

        let (_, _) = list.take_largest(16).expect("entry");
        assert_eq!(memory.0[1], 0, "link word is cleared on take");
        assert!(list.is_empty());
    }

    #[test]
    fn test_filler_entries_are_not_linked() {
        let mut memory = Span::new(64);
        let mut list = FreeList::new();
        unsafe { list.add_to_free_list(memory.at(0), 8) };
        assert!(list.is_empty());
        let header = unsafe { ObjectHeader::at(memory.at(0).as_ptr()) };
        assert!(header.is_free());
        assert_eq!(header.size(), 8);
    }
}
