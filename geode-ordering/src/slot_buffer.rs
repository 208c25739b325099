//! Insertion-buffered map yielding a gapless prefix in index order.

use std::collections::BTreeMap;

/// Buffers out-of-order insertions and releases them only while the index prefix is
/// contiguous.
///
/// Duplicate insertions, including re-delivery of an already-consumed index, are no-ops, so
/// upstream retransmissions cannot disturb the output sequence.
#[derive(Debug, Clone)]
pub struct SlotBuffer<T> {
    buffer: BTreeMap<u64, T>,
    next_index: Option<u64>,
}

impl<T> Default for SlotBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotBuffer<T> {
    /// Creates an empty buffer anchored at index zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BTreeMap::new(),
            next_index: Some(0),
        }
    }

    /// Creates an empty buffer that adopts the index of the first insertion as its base.
    ///
    /// Only valid for streams whose producer is a single FIFO source, where the first arrival
    /// is guaranteed to carry the lowest index.
    #[must_use]
    pub fn starting_at_first_index() -> Self {
        Self {
            buffer: BTreeMap::new(),
            next_index: None,
        }
    }

    /// Buffers one item at the given index; duplicates are ignored.
    pub fn insert(&mut self, index: u64, item: T) {
        if let Some(next_index) = self.next_index
            && index < next_index
        {
            return;
        }
        let _ = self.buffer.entry(index).or_insert(item);
        if self.next_index.is_none() {
            self.next_index = Some(index);
        }
    }

    /// Whether the item at the cursor has arrived.
    #[must_use]
    pub fn has_next(&self) -> bool {
        let Some(next_index) = self.next_index else {
            return false;
        };
        self.buffer.contains_key(&next_index)
    }

    /// Item at the cursor, when present.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.buffer.get(&self.next_index?)
    }

    /// Consumes and returns the item at the cursor, advancing it.
    pub fn next(&mut self) -> Option<(u64, T)> {
        let next_index = self.next_index?;
        let item = self.buffer.remove(&next_index)?;
        self.next_index = Some(next_index + 1);
        Some((next_index, item))
    }
}
