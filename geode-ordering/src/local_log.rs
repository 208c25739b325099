//! Slot-ordered merge of the local region's batch streams.

use std::collections::VecDeque;

use geode_core::containers::HotMap;

use geode_common::ids::{BatchId, QueueId, SlotId};

use crate::slot_buffer::SlotBuffer;

/// Joins the Paxos-issued slot stream with per-queue batch-id streams.
///
/// The slot stream names, per slot, the queue that owns it; each queue delivers batch ids in
/// the order its origin machine created them. A `(slot, batch)` pair becomes ready only when
/// both sides have supplied their next entry, so the join is FIFO per queue and gapless in
/// slot order.
#[derive(Debug, Default)]
pub struct LocalLog {
    slots: SlotBuffer<QueueId>,
    batch_queues: HotMap<QueueId, SlotBuffer<BatchId>>,
    ready_batches: VecDeque<(SlotId, BatchId)>,
}

impl LocalLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one batch id at its position inside the origin queue.
    pub fn add_batch_id(&mut self, queue_id: QueueId, position: u32, batch_id: BatchId) {
        self.batch_queues
            .entry(queue_id)
            .or_default()
            .insert(u64::from(position), batch_id);
        self.update_ready_batches();
    }

    /// Records the owner queue of one slot.
    pub fn add_slot(&mut self, slot_id: SlotId, queue_id: QueueId) {
        self.slots.insert(slot_id, queue_id);
        self.update_ready_batches();
    }

    /// Whether a `(slot, batch)` pair is ready for consumption.
    #[must_use]
    pub fn has_next_batch(&self) -> bool {
        !self.ready_batches.is_empty()
    }

    /// Consumes the next ready `(slot, batch)` pair.
    ///
    /// # Panics
    ///
    /// Panics when no pair is ready; callers must check [`Self::has_next_batch`] first.
    pub fn next_batch(&mut self) -> (SlotId, BatchId) {
        self.ready_batches
            .pop_front()
            .unwrap_or_else(|| panic!("next_batch() was called when there is no batch"))
    }

    fn update_ready_batches(&mut self) {
        while let Some(next_queue_id) = self.slots.peek().copied() {
            let Some(next_queue) = self.batch_queues.get_mut(&next_queue_id) else {
                break;
            };
            if !next_queue.has_next() {
                break;
            }
            let Some((slot_id, _)) = self.slots.next() else {
                break;
            };
            let Some((_, batch_id)) = next_queue.next() else {
                break;
            };
            self.ready_batches.push_back((slot_id, batch_id));
        }
    }
}
