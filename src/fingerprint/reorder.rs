//! Reorder buffer for out-of-order parallel results

use std::collections::BTreeMap;

/// Holds results that completed ahead of their turn and releases them in
/// strictly ascending index order.
///
/// Invariant: every held index is greater than `next_expected`.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    held: BTreeMap<usize, T>,
    next_expected: usize,
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        ReorderBuffer {
            held: BTreeMap::new(),
            next_expected: 0,
        }
    }

    /// Accept a completed result. Returns false for stale or duplicate indices.
    pub fn insert(&mut self, index: usize, item: T) -> bool {
        if index < self.next_expected || self.held.contains_key(&index) {
            return false;
        }
        self.held.insert(index, item);
        true
    }

    /// Release the next in-order item, advancing the cursor
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.held.remove(&self.next_expected)?;
        self.next_expected += 1;
        Some(item)
    }

    /// Index of the next item to be released
    pub fn next_expected(&self) -> usize {
        self.next_expected
    }

    /// Number of items waiting for an earlier index
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Drop every held item
    pub fn clear(&mut self) {
        self.held.clear();
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
