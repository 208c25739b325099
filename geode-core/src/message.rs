//! Internal message vocabulary exchanged between modules.
//!
//! Every message travels inside an [`Envelope`] naming the sending machine; the destination is
//! carried by the broker's `(machine, channel)` addressing, never by the payload itself.

use serde::{Deserialize, Serialize};

use geode_common::ids::{BatchId, MachineIdNum, PartitionId, QueueId, SlotId, TxnId};

use crate::txn::{Batch, Key, Transaction, Value};

/// Batch-forwarding payload: either the batch body or an ordering hint for a known batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardBatch {
    /// The batch body plus its position among batches created by the same origin machine.
    BatchData {
        /// Forwarded batch.
        batch: Box<Batch>,
        /// Creation order among batches from the same origin machine.
        same_origin_position: u32,
    },
    /// A slot assignment for a batch whose body travels separately.
    BatchOrder {
        /// Batch being ordered.
        batch_id: BatchId,
        /// Slot the batch occupies in its origin region's log.
        slot: SlotId,
    },
}

/// Values read by one partition on behalf of a transaction, relayed to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReadResult {
    /// Transaction the reads belong to.
    pub txn_id: TxnId,
    /// Partition that produced the reads.
    pub partition: PartitionId,
    /// True when the sending partition decided to abort the transaction.
    pub will_abort: bool,
    /// Key/value pairs read on the sending partition.
    pub reads: Vec<(Key, Value)>,
}

/// Request messages consumed by the ordering and scheduling modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Paxos-issued slot assignment for the local log: sequencer → interleaver.
    LocalQueueOrder {
        /// Slot being assigned.
        slot: SlotId,
        /// Queue (origin partition) the slot belongs to.
        queue_id: QueueId,
    },
    /// Batch body or batch order: sequencer/peer interleaver → interleaver.
    ForwardBatch(ForwardBatch),
    /// One ordered transaction: interleaver → scheduler.
    ForwardTxn {
        /// Transaction in global order.
        txn: Box<Transaction>,
    },
    /// Cross-partition read relay: scheduler ↔ scheduler and scheduler → worker.
    RemoteReadResult(RemoteReadResult),
    /// Ownership hand-off of a ready transaction: scheduler → worker.
    DispatchTxn {
        /// Transaction ready for execution on this partition.
        txn: Box<Transaction>,
    },
    /// Executed sub-transaction: scheduler → coordinating server.
    CompletedSubtxn {
        /// Executed transaction body.
        txn: Box<Transaction>,
        /// Partition that executed this sub-transaction.
        partition: PartitionId,
        /// Every partition involved in the full transaction.
        involved_partitions: Vec<PartitionId>,
    },
    /// Statistics snapshot request: server → scheduler.
    Stats {
        /// Correlation id echoed in the response.
        id: u32,
        /// Verbosity level.
        level: u32,
    },
}

/// Response messages produced by the scheduling modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Execution finished: worker → scheduler, carrying the executed transaction back.
    Worker {
        /// Executed transaction, ownership returned to the scheduler.
        txn: Box<Transaction>,
    },
    /// Statistics snapshot: scheduler → server.
    Stats {
        /// Correlation id from the request.
        id: u32,
        /// JSON document with scheduler and lock manager counters.
        stats_json: String,
    },
}

/// Direction-agnostic message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// A request.
    Request(Request),
    /// A response.
    Response(Response),
}

/// A message annotated with its sending machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Machine that sent the message.
    pub from: MachineIdNum,
    /// Message body.
    pub message: Message,
}
