//! Mark stack draining, the ephemeron fixed point and weak processing.

use crate::gc::CallbackStack;
use crate::gc_info::TraceCallback;
use crate::heap::BasePage;
use crate::trace::{Visitor, WeakCallback};

/// Worklists shared by every visitor of one marking.
#[derive(Default)]
pub struct MarkingWorklists {
    pub(crate) marking: CallbackStack<TraceCallback>,
    pub(crate) post_marking: CallbackStack<TraceCallback>,
    pub(crate) ephemerons: CallbackStack<TraceCallback>,
    pub(crate) global_weak: CallbackStack<WeakCallback>,
}

// SAFETY: the raw object pointers are only dereferenced by the collector
// while it holds the worklists mutex with every mutator parked.
unsafe impl Send for MarkingWorklists {}

impl MarkingWorklists {
    pub(crate) const fn new() -> Self {
        Self {
            marking: CallbackStack::new(),
            post_marking: CallbackStack::new(),
            ephemerons: CallbackStack::new(),
            global_weak: CallbackStack::new(),
        }
    }

    /// Drops leftovers of an aborted marking.
    pub(crate) fn clear(&mut self) {
        self.marking.clear();
        self.post_marking.clear();
        self.ephemerons.clear();
        self.global_weak.clear();
    }
}

impl Visitor<'_> {
    /// Pops and traces objects until the mark stack is empty.
    pub(crate) fn drain_mark_stack(&mut self) {
        while let Some(item) = self.worklists.marking.pop() {
            // SAFETY: only payloads of heap objects are pushed.
            self.current_owner = unsafe { BasePage::from_payload(item.object).as_ref() }.owner();
            // SAFETY: the callback belongs to the object's type.
            unsafe { (item.callback)(self, item.object) };
        }
        self.current_owner = std::ptr::null();
    }

    /// Drains the mark stack, then reruns every ephemeron callback until a
    /// whole pass pushes no new mark work. Returns the number of passes.
    pub(crate) fn mark_to_fixed_point(&mut self) -> usize {
        let mut passes = 0;
        loop {
            self.drain_mark_stack();
            if self.worklists.ephemerons.is_empty() {
                return passes;
            }
            passes += 1;
            let before = self.worklists.marking.total_pushed();
            let callbacks: Vec<_> = self.worklists.ephemerons.iter().copied().collect();
            for item in callbacks {
                self.current_owner = self
                    .page_map
                    .lookup(item.object as usize)
                    // SAFETY: the page map only yields mapped pages.
                    .map_or(std::ptr::null(), |page| unsafe { page.as_ref() }.owner());
                // SAFETY: the callback was registered for this object.
                unsafe { (item.callback)(self, item.object) };
            }
            self.current_owner = std::ptr::null();
            if self.worklists.marking.total_pushed() == before {
                self.worklists.ephemerons.clear();
                return passes;
            }
        }
    }

    /// Runs the post-marking callbacks.
    ///
    /// # Panics
    ///
    /// Panics if a callback marks an object.
    pub(crate) fn run_post_marking_callbacks(&mut self) {
        while let Some(item) = self.worklists.post_marking.pop() {
            let before = self.worklists.marking.total_pushed();
            // SAFETY: the callback was registered for this object.
            unsafe { (item.callback)(self, item.object) };
            assert_eq!(
                self.worklists.marking.total_pushed(),
                before,
                "post-marking callbacks must not mark objects"
            );
        }
    }

    /// Runs and drains a weak callback stack.
    pub(crate) fn process_weak_callbacks(&self, stack: &mut CallbackStack<WeakCallback>) {
        while let Some(item) = stack.pop() {
            // SAFETY: the callback was registered for this object.
            unsafe { (item.callback)(self, item.object) };
        }
    }

    /// Runs the global weak callbacks.
    pub(crate) fn process_global_weak_callbacks(&mut self) {
        let mut stack = std::mem::take(&mut self.worklists.global_weak);
        self.process_weak_callbacks(&mut stack);
        self.worklists.global_weak = stack;
    }

    /// Marks the object containing `word` if it looks like a heap address.
    pub(crate) fn visit_conservatively(&mut self, word: usize) {
        let Some(page) = self.page_map.lookup(word) else {
            return;
        };
        // SAFETY: the page map only yields mapped pages.
        let page = unsafe { page.as_ref() };
        if !self.should_trace_page(page) {
            return;
        }
        if let Some(header) = page.find_live_header(word as *const u8) {
            self.mark_header(page, header);
        }
    }

    /// Conservatively scans `[start, end)` word by word.
    ///
    /// # Safety
    ///
    /// The range must be readable and word aligned.
    pub(crate) unsafe fn scan_range(&mut self, start: *const usize, end: *const usize) {
        let mut cursor = start;
        while cursor < end {
            // SAFETY: caller guarantees the range is readable.
            let word = unsafe { cursor.read_volatile() };
            self.visit_conservatively(word);
            // SAFETY: stays within or one past the range.
            cursor = unsafe { cursor.add(1) };
        }
    }

    pub(crate) const fn marked_objects(&self) -> usize {
        self.marked_objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::PageMap;
    use crate::VisitorKind;

    static HITS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

    unsafe fn count_hit(_visitor: &Visitor<'_>, _object: *const u8) {
        HITS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    #[test]
    fn test_global_weak_callbacks_run_once() {
        let mut worklists = MarkingWorklists::new();
        let page_map = PageMap::new();
        let mut visitor = Visitor::new(
            VisitorKind::GlobalMarking,
            &mut worklists,
            &page_map,
            std::ptr::null(),
        );
        visitor.register_global_weak_callback(std::ptr::null(), count_hit);
        visitor.register_weak_callback(std::ptr::null(), count_hit);
        visitor.process_global_weak_callbacks();
        visitor.process_global_weak_callbacks();
        assert_eq!(HITS.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[test]
    fn test_fixed_point_without_ephemerons_is_zero_passes() {
        let mut worklists = MarkingWorklists::new();
        let page_map = PageMap::new();
        let mut visitor = Visitor::new(
            VisitorKind::GlobalMarking,
            &mut worklists,
            &page_map,
            std::ptr::null(),
        );
        visitor.visit_conservatively(0x1000);
        assert_eq!(visitor.mark_to_fixed_point(), 0);
        assert_eq!(visitor.marked_objects(), 0);
    }
}
