//! Chunked LIFO of `(object, callback)` pairs.
//!
//! Used for the mark stack, post-marking callbacks, weak callbacks and
//! ephemeron callbacks. Storage grows in fixed-size blocks so a deep object
//! graph never triggers one huge reallocation; drained blocks are kept as
//! a spare to avoid churn on the next cycle.

const BLOCK_SIZE: usize = 8192;

/// One entry of a [`CallbackStack`].
#[derive(Debug, Clone, Copy)]
pub struct CallbackItem<F: Copy> {
    /// The object the callback is invoked with.
    pub object: *const u8,
    /// The callback.
    pub callback: F,
}

/// Growable stack of [`CallbackItem`]s.
#[derive(Debug)]
pub struct CallbackStack<F: Copy> {
    blocks: Vec<Vec<CallbackItem<F>>>,
    spare: Option<Vec<CallbackItem<F>>>,
    total_pushed: usize,
}

impl<F: Copy> Default for CallbackStack<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Copy> CallbackStack<F> {
    /// Creates an empty stack without allocating.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            blocks: Vec::new(),
            spare: None,
            total_pushed: 0,
        }
    }

    /// Pushes an entry.
    pub fn push(&mut self, object: *const u8, callback: F) {
        let needs_block = self.blocks.last().is_none_or(|block| block.len() == BLOCK_SIZE);
        if needs_block {
            let block = self
                .spare
                .take()
                .unwrap_or_else(|| Vec::with_capacity(BLOCK_SIZE));
            self.blocks.push(block);
        }
        if let Some(block) = self.blocks.last_mut() {
            block.push(CallbackItem { object, callback });
        }
        self.total_pushed += 1;
    }

    /// Pops the most recently pushed entry.
    pub fn pop(&mut self) -> Option<CallbackItem<F>> {
        loop {
            let block = self.blocks.last_mut()?;
            if let Some(item) = block.pop() {
                return Some(item);
            }
            if let Some(empty) = self.blocks.pop() {
                self.spare = Some(empty);
            }
        }
    }

    /// Whether no entry is left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Vec::is_empty)
    }

    /// Number of entries currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// Entries pushed since creation, popped ones included.
    ///
    /// Comparing two readings tells whether anything new was pushed in between.
    #[must_use]
    pub const fn total_pushed(&self) -> usize {
        self.total_pushed
    }

    /// Iterates from the oldest to the newest entry without popping.
    pub fn iter(&self) -> impl Iterator<Item = &CallbackItem<F>> + '_ {
        self.blocks.iter().flatten()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        while let Some(block) = self.blocks.pop() {
            let mut block = block;
            block.clear();
            self.spare = Some(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_order_across_blocks() {
        let mut stack: CallbackStack<usize> = CallbackStack::new();
        let count = BLOCK_SIZE * 2 + 17;
        for i in 0..count {
            stack.push(std::ptr::null(), i);
        }
        assert_eq!(stack.len(), count);
        for expected in (0..count).rev() {
            assert_eq!(stack.pop().map(|item| item.callback), Some(expected));
        }
        assert!(stack.pop().is_none());
        assert!(stack.is_empty());
        assert_eq!(stack.total_pushed(), count);
    }

    #[test]
    fn test_iter_does_not_consume() {
        let mut stack: CallbackStack<u8> = CallbackStack::new();
        stack.push(std::ptr::null(), 1);
        stack.push(std::ptr::null(), 2);
        let seen: Vec<u8> = stack.iter().map(|item| item.callback).collect();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(stack.len(), 2);

        stack.clear();
        assert!(stack.is_empty());
        stack.push(std::ptr::null(), 3);
        assert_eq!(stack.pop().map(|item| item.callback), Some(3));
    }
}
