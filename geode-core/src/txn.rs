//! Transaction and batch data model.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use geode_common::ids::{BatchId, MachineId, MachineIdNum, ReplicaId, TxnId, TxnReplicaId};

/// Data item key.
pub type Key = String;

/// Data item value.
pub type Value = String;

/// Per-key master record captured at sequencing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterMetadata {
    /// Region currently authoritative for the key.
    pub master: ReplicaId,
    /// Number of remasters the key has gone through.
    pub counter: u32,
}

/// Classification of a transaction by the homes of its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// All keys are mastered in one region.
    SingleHome,
    /// Keys span multiple master regions.
    MultiHome,
    /// Per-region lock-acquisition shard of a multi-home transaction.
    LockOnly,
}

/// Execution outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Not yet executed by a worker.
    NotStarted,
    /// Executed and applied.
    Committed,
    /// Aborted before or during execution.
    Aborted,
}

/// One step of a key-value stored procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Read a key into the transaction buffer.
    Get {
        /// Key to read.
        key: Key,
    },
    /// Write a value to a key.
    Set {
        /// Key to write.
        key: Key,
        /// New value.
        value: Value,
    },
    /// Delete a key.
    Delete {
        /// Key to delete.
        key: Key,
    },
}

/// Procedure carried by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Procedure {
    /// Ordinary key-value stored procedure.
    Operations(Vec<Operation>),
    /// Master-change directive for the single key in the write set.
    Remaster {
        /// Region the key moves to.
        new_master: ReplicaId,
    },
}

/// Milestones recorded on transactions and batches as they move through the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionEvent {
    /// Batch containing the transaction entered the interleaver.
    EnterInterleaverInBatch,
    /// Transaction left the interleaver toward the scheduler.
    ExitInterleaver,
    /// Transaction entered the scheduler.
    EnterScheduler,
    /// Lock manager saw all parts of the transaction.
    Accepted,
    /// Transaction was handed to a worker.
    Dispatched,
    /// Locks were released after execution.
    ReleaseLocks,
    /// Completed sub-transaction left the scheduler.
    ExitScheduler,
}

/// One trace entry: what happened, when, and on which machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Recorded milestone.
    pub event: TransactionEvent,
    /// Wall-clock nanoseconds since the epoch.
    pub time_ns: i64,
    /// Machine that recorded the milestone.
    pub machine: MachineIdNum,
}

/// A transaction as seen by the ordering and scheduling core.
///
/// Read and write sets use ordered maps: every replica must walk the same keys in the same
/// order when acquiring locks, or the deterministic schedule diverges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Process-unique transaction id.
    pub id: TxnId,
    /// Home classification.
    pub txn_type: TransactionType,
    /// Execution outcome so far.
    pub status: TransactionStatus,
    /// Keys read; values are filled in during execution.
    pub read_set: BTreeMap<Key, Value>,
    /// Keys written; values are filled in during execution.
    pub write_set: BTreeMap<Key, Value>,
    /// Keys deleted on commit.
    pub delete_set: Vec<Key>,
    /// Master record per key, captured at sequencing time.
    pub master_metadata: BTreeMap<Key, MasterMetadata>,
    /// Stored procedure or remaster directive.
    pub procedure: Procedure,
    /// Server that coordinates the overall transaction.
    pub coordinating_server: MachineId,
    /// Milestone trace.
    pub events: Vec<EventRecord>,
}

impl Transaction {
    /// Creates a transaction with empty key sets.
    #[must_use]
    pub fn new(
        id: TxnId,
        txn_type: TransactionType,
        procedure: Procedure,
        coordinating_server: MachineId,
    ) -> Self {
        Self {
            id,
            txn_type,
            status: TransactionStatus::NotStarted,
            read_set: BTreeMap::new(),
            write_set: BTreeMap::new(),
            delete_set: Vec::new(),
            master_metadata: BTreeMap::new(),
            procedure,
            coordinating_server,
            events: Vec::new(),
        }
    }

    /// Appends one milestone to the trace.
    pub fn record_event(&mut self, event: TransactionEvent, machine: MachineIdNum) {
        self.events.push(EventRecord {
            event,
            time_ns: now_ns(),
            machine,
        });
    }

    /// Region a lock-only shard acquires locks for, taken from its key master metadata.
    ///
    /// Returns `None` when the shard carries no master metadata at all, which is a malformed
    /// input from the sequencing layer.
    #[must_use]
    pub fn lock_only_home(&self) -> Option<ReplicaId> {
        self.master_metadata
            .values()
            .next()
            .map(|metadata| metadata.master)
    }

    /// Key of this transaction in the scheduler's lock-only shard map.
    #[must_use]
    pub fn lock_only_key(&self) -> Option<TxnReplicaId> {
        self.lock_only_home().map(|home| (self.id, home))
    }
}

/// A sequencer-produced bundle of transactions, the unit of cross-region forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch id, monotonic within its origin machine.
    pub id: BatchId,
    /// Type shared by every transaction in the batch.
    pub transaction_type: TransactionType,
    /// Transactions in sequencing order.
    pub transactions: Vec<Transaction>,
    /// Milestone trace for the whole batch.
    pub events: Vec<EventRecord>,
}

impl Batch {
    /// Creates a batch over the given transactions.
    #[must_use]
    pub fn new(
        id: BatchId,
        transaction_type: TransactionType,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            id,
            transaction_type,
            transactions,
            events: Vec::new(),
        }
    }

    /// Appends one milestone to the batch trace.
    pub fn record_event(&mut self, event: TransactionEvent, machine: MachineIdNum) {
        self.events.push(EventRecord {
            event,
            time_ns: now_ns(),
            machine,
        });
    }
}

/// Wall-clock nanoseconds since the Unix epoch, saturating on clock skew.
#[must_use]
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| {
            i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
        })
}

#[cfg(test)]
mod tests {
    use super::{
        Batch, MasterMetadata, Operation, Procedure, Transaction, TransactionEvent,
        TransactionType,
    };
    use geode_common::ids::MachineId;
    use googletest::prelude::*;
    use rstest::rstest;

    fn lock_only_shard(id: u64, home: u32) -> Transaction {
        let mut txn = Transaction::new(
            id,
            TransactionType::LockOnly,
            Procedure::Operations(vec![Operation::Get {
                key: "0".to_owned(),
            }]),
            MachineId {
                replica: 0,
                partition: 0,
            },
        );
        let _ = txn.read_set.insert("0".to_owned(), String::new());
        let _ = txn.master_metadata.insert(
            "0".to_owned(),
            MasterMetadata {
                master: home,
                counter: 0,
            },
        );
        txn
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    fn lock_only_key_uses_master_metadata_home(#[case] home: u32) {
        let txn = lock_only_shard(77, home);
        assert_that!(txn.lock_only_key(), eq(Some((77_u64, home))));
    }

    #[rstest]
    fn lock_only_key_is_none_without_metadata() {
        let txn = Transaction::new(
            1,
            TransactionType::LockOnly,
            Procedure::Operations(Vec::new()),
            MachineId {
                replica: 0,
                partition: 0,
            },
        );
        assert_that!(txn.lock_only_key().is_none(), eq(true));
    }

    #[rstest]
    fn batch_round_trip_preserves_transaction_order() {
        let transactions = [3_u64, 1, 2]
            .into_iter()
            .map(|id| lock_only_shard(id, 0))
            .collect::<Vec<_>>();
        let batch = Batch::new(42, TransactionType::LockOnly, transactions);

        let encoded = serde_json::to_string(&batch).expect("batch must serialize");
        let decoded: Batch = serde_json::from_str(&encoded).expect("batch must deserialize");

        assert_that!(decoded.id, eq(42_u64));
        let ids = decoded
            .transactions
            .iter()
            .map(|txn| txn.id)
            .collect::<Vec<_>>();
        assert_that!(ids, eq(&vec![3_u64, 1, 2]));
    }

    #[rstest]
    fn event_records_carry_machine_and_order() {
        let mut batch = Batch::new(9, TransactionType::SingleHome, Vec::new());
        batch.record_event(TransactionEvent::EnterInterleaverInBatch, 3);
        batch.record_event(TransactionEvent::ExitInterleaver, 3);

        assert_that!(batch.events.len(), eq(2_usize));
        assert_that!(
            batch.events[0].event,
            eq(TransactionEvent::EnterInterleaverInBatch)
        );
        assert_that!(batch.events[1].event, eq(TransactionEvent::ExitInterleaver));
        assert_that!(batch.events[0].machine, eq(3_u32));
    }
}
