//! Per-origin join of batch bodies with their slot order.

use std::collections::VecDeque;

use geode_core::containers::HotMap;
use geode_core::txn::Batch;

use geode_common::ids::{BatchId, SlotId};

use crate::slot_buffer::SlotBuffer;

/// Buffers batches and slot assignments for one origin and emits batches in slot order.
///
/// Bodies and orders arrive independently (the body travels once, the order comes from the
/// origin's Paxos stream), so either side may lead. The multi-home log reuses this type with
/// the batch id doubling as the slot id, the multi-home orderer having already produced a
/// total order.
#[derive(Debug, Default)]
pub struct BatchLog {
    batches: HotMap<BatchId, Batch>,
    slots: SlotBuffer<BatchId>,
    ready_batches: VecDeque<Batch>,
}

impl BatchLog {
    /// Creates an empty log whose slot stream starts at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log for a stream that is already totally ordered by its producer.
    ///
    /// The slot base is adopted from the first arrival; the multi-home orderer is a single
    /// FIFO source, so its first batch carries the lowest id.
    #[must_use]
    pub fn pre_ordered() -> Self {
        Self {
            batches: HotMap::default(),
            slots: SlotBuffer::starting_at_first_index(),
            ready_batches: VecDeque::new(),
        }
    }

    /// Stores one batch body by its id.
    pub fn add_batch(&mut self, batch: Batch) {
        let _ = self.batches.insert(batch.id, batch);
        self.update_ready_batches();
    }

    /// Records that the given batch occupies the given slot.
    pub fn add_slot(&mut self, slot_id: SlotId, batch_id: BatchId) {
        self.slots.insert(slot_id, batch_id);
        self.update_ready_batches();
    }

    /// Whether a batch is ready for consumption.
    #[must_use]
    pub fn has_next_batch(&self) -> bool {
        !self.ready_batches.is_empty()
    }

    /// Consumes the next ready batch.
    ///
    /// # Panics
    ///
    /// Panics when no batch is ready; callers must check [`Self::has_next_batch`] first.
    pub fn next_batch(&mut self) -> Batch {
        self.ready_batches
            .pop_front()
            .unwrap_or_else(|| panic!("next_batch() was called when there is no batch"))
    }

    fn update_ready_batches(&mut self) {
        while let Some(next_batch_id) = self.slots.peek().copied() {
            let Some(batch) = self.batches.remove(&next_batch_id) else {
                break;
            };
            let _ = self.slots.next();
            self.ready_batches.push_back(batch);
        }
    }
}
