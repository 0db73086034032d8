use std::collections::BTreeMap;

/// Releases items in ordinal order while they arrive in completion order.
///
/// Ordinals are 1-based. An item is held until every lower ordinal has been
/// released.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Add an item and return every item now ready, in order.
    pub fn push(&mut self, ordinal: usize, item: T) -> Vec<T> {
        if ordinal < self.next {
            tracing::debug!(%ordinal, next = self.next, "Ignoring already released ordinal");
            return Vec::new();
        }
        self.pending.insert(ordinal, item);
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    /// Items still held back by a gap, in ordinal order.
    pub fn drain_remaining(&mut self) -> Vec<T> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
