//! Address-range lookup for conservative pointers.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use parking_lot::RwLock;

use super::page::BasePage;

/// Maps the address range of every live page to its metadata.
///
/// Used to decide whether an arbitrary word found on a stack points into
/// the heap; precise pointers find their page by masking instead.
pub(crate) struct PageMap {
    // page base -> page end
    ranges: RwLock<BTreeMap<usize, usize>>,
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            ranges: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, base: usize, len: usize) {
        self.ranges.write().insert(base, base + len);
    }

    pub fn remove(&self, base: usize) {
        self.ranges.write().remove(&base);
    }

    /// Returns the page whose range contains `address`.
    pub fn lookup(&self, address: usize) -> Option<NonNull<BasePage>> {
        let ranges = self.ranges.read();
        let (&base, &end) = ranges.range(..=address).next_back()?;
        if address >= end {
            return None;
        }
        NonNull::new(base as *mut BasePage)
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_respects_range_end() {
        let map = PageMap::new();
        map.insert(0x10_0000, 0x2_0000);
        map.insert(0x40_0000, 0x8_0000);

        assert_eq!(map.lookup(0x10_0000).map(|p| p.as_ptr() as usize), Some(0x10_0000));
        assert_eq!(map.lookup(0x11_fff8).map(|p| p.as_ptr() as usize), Some(0x10_0000));
        assert!(map.lookup(0x12_0000).is_none());
        assert!(map.lookup(0x0f_ffff).is_none());
        assert_eq!(map.lookup(0x47_0000).map(|p| p.as_ptr() as usize), Some(0x40_0000));

        map.remove(0x40_0000);
        assert!(map.lookup(0x47_0000).is_none());
        assert_eq!(map.len(), 1);
    }
}
