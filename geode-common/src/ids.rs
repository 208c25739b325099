//! Canonical identifier types used across ordering, scheduling, and storage.

use serde::{Deserialize, Serialize};

/// Numeric region (full dataset replica) identifier.
pub type ReplicaId = u32;

/// Numeric partition identifier inside one region.
pub type PartitionId = u32;

/// Process-unique transaction identifier allocated by coordinating servers.
pub type TxnId = u64;

/// Monotonic batch identifier, unique within its origin machine.
pub type BatchId = u64;

/// Paxos-assigned position in a region's local log.
pub type SlotId = u64;

/// Identifier of one batch queue inside the local log (one queue per origin partition).
pub type QueueId = u32;

/// Packed numeric machine address: `num_partitions * replica + partition`.
pub type MachineIdNum = u32;

/// Key of a lock-only shard: the parent transaction plus the region the shard locks for.
pub type TxnReplicaId = (TxnId, ReplicaId);

/// Unpacked machine address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId {
    /// Region hosting the machine.
    pub replica: ReplicaId,
    /// Partition owned by the machine inside its region.
    pub partition: PartitionId,
}

/// Typed mailbox address inside one machine.
///
/// Every module owns exactly one channel; workers are addressed by their index inside the
/// scheduler's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Client-facing server module.
    Server,
    /// Forwarder module (external collaborator).
    Forwarder,
    /// Sequencer module (external collaborator).
    Sequencer,
    /// Per-partition log merger.
    Interleaver,
    /// Per-partition deterministic executor front-end.
    Scheduler,
    /// One executor shard owned by the scheduler.
    Worker(u32),
}

#[cfg(test)]
mod tests {
    use super::{Channel, MachineId};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn machine_id_equality_covers_both_fields() {
        let machine = MachineId {
            replica: 1,
            partition: 2,
        };
        assert_that!(
            machine,
            eq(MachineId {
                replica: 1,
                partition: 2
            })
        );
        assert_that!(
            machine == MachineId {
                replica: 2,
                partition: 1
            },
            eq(false)
        );
    }

    #[rstest]
    fn worker_channels_are_distinct_per_index() {
        assert_that!(Channel::Worker(0) == Channel::Worker(1), eq(false));
        assert_that!(Channel::Worker(3), eq(Channel::Worker(3)));
    }
}
