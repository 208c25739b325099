//! Per-transaction state bundle owned by the scheduler.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use geode_common::config::Configuration;
use geode_common::ids::{PartitionId, ReplicaId, TxnId, TxnReplicaId};
use geode_core::message::RemoteReadResult;
use geode_core::txn::{Key, Transaction};

/// Lock mode requested for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared read lock.
    Read,
    /// Exclusive write lock.
    Write,
}

/// Identity of a holder inside the scheduler's maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HolderId {
    /// A single-home or multi-home transaction in the main map.
    Txn(TxnId),
    /// A lock-only shard keyed by parent transaction and home region.
    LockOnly(TxnReplicaId),
}

impl HolderId {
    /// Transaction id behind this holder; for a lock-only shard, the parent's id.
    #[must_use]
    pub fn txn_id(self) -> TxnId {
        match self {
            Self::Txn(txn_id) => txn_id,
            Self::LockOnly((txn_id, _)) => txn_id,
        }
    }
}

/// Partition footprint of a transaction, derived from its key sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionFootprint {
    /// Partitions owning at least one key of the transaction.
    pub involved: BTreeSet<PartitionId>,
    /// Partitions owning at least one write-set key.
    pub active: BTreeSet<PartitionId>,
}

/// Computes the partition footprint of a transaction under the given configuration.
#[must_use]
pub fn partition_footprint(config: &Configuration, txn: &Transaction) -> PartitionFootprint {
    let mut footprint = PartitionFootprint::default();
    for key in txn.read_set.keys() {
        let _ = footprint.involved.insert(config.partition_of_key(key));
    }
    for key in txn.write_set.keys() {
        let partition = config.partition_of_key(key);
        let _ = footprint.involved.insert(partition);
        let _ = footprint.active.insert(partition);
    }
    footprint
}

/// Scheduler-owned state for one transaction (or lock-only shard).
///
/// A holder is created on first contact, either when the ordered transaction arrives or when
/// an early remote read precedes it, and destroyed exactly once: after the worker reply
/// finishes the release/reply path, or when abort finalization erases it.
#[derive(Debug, Default)]
pub struct TransactionHolder {
    txn: Option<Transaction>,
    keys_in_partition: Vec<(Key, LockMode)>,
    involved_partitions: BTreeSet<PartitionId>,
    active_partitions: BTreeSet<PartitionId>,
    involved_replicas: BTreeSet<ReplicaId>,
    worker: Option<u32>,
    early_remote_reads: VecDeque<RemoteReadResult>,
}

impl TransactionHolder {
    /// Installs the transaction body and derives the partition-filtered views.
    ///
    /// Write locks win for keys present in both key sets. The key list stays in the ordered
    /// map's deterministic order: every replica must request locks in the same sequence.
    pub fn set_transaction(&mut self, config: &Configuration, txn: Transaction) {
        let mut keys_in_partition = Vec::new();
        for key in txn.write_set.keys() {
            if config.is_local_partition(key) {
                keys_in_partition.push((key.clone(), LockMode::Write));
            }
        }
        for key in txn.read_set.keys() {
            if config.is_local_partition(key) && !txn.write_set.contains_key(key) {
                keys_in_partition.push((key.clone(), LockMode::Read));
            }
        }
        keys_in_partition.sort_by(|(left, _), (right, _)| left.cmp(right));

        let footprint = partition_footprint(config, &txn);
        // Only regions mastering a local key matter: their lock-only shards are the ones
        // this partition will ever see, and the multi-home gate counts exactly those.
        let involved_replicas = txn
            .master_metadata
            .iter()
            .filter(|(key, _)| config.is_local_partition(key))
            .map(|(_, metadata)| metadata.master)
            .collect::<BTreeSet<_>>();

        self.keys_in_partition = keys_in_partition;
        self.involved_partitions = footprint.involved;
        self.active_partitions = footprint.active;
        self.involved_replicas = involved_replicas;
        self.txn = Some(txn);
    }

    /// Re-installs a transaction body without recomputing derived state.
    ///
    /// Used when the executed body returns from a worker and when a body is borrowed for an
    /// outgoing message.
    pub fn set_transaction_body(&mut self, txn: Transaction) {
        self.txn = Some(txn);
    }

    /// Transaction body, when it has arrived.
    #[must_use]
    pub fn txn(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }

    /// Mutable access to the transaction body.
    pub fn txn_mut(&mut self) -> Option<&mut Transaction> {
        self.txn.as_mut()
    }

    /// Takes the transaction body out of the holder.
    pub fn take_transaction(&mut self) -> Option<Transaction> {
        self.txn.take()
    }

    /// Keys of the transaction residing on the local partition, with their lock modes.
    #[must_use]
    pub fn keys_in_partition(&self) -> &[(Key, LockMode)] {
        &self.keys_in_partition
    }

    /// Partitions owning at least one key of the full transaction.
    #[must_use]
    pub fn involved_partitions(&self) -> &BTreeSet<PartitionId> {
        &self.involved_partitions
    }

    /// Partitions owning at least one write of the full transaction.
    #[must_use]
    pub fn active_partitions(&self) -> &BTreeSet<PartitionId> {
        &self.active_partitions
    }

    /// Regions mastering at least one key of the full transaction.
    #[must_use]
    pub fn involved_replicas(&self) -> &BTreeSet<ReplicaId> {
        &self.involved_replicas
    }

    /// Index of the worker executing this transaction, set at dispatch.
    #[must_use]
    pub fn worker(&self) -> Option<u32> {
        self.worker
    }

    /// Binds the transaction to a worker.
    pub fn set_worker(&mut self, worker: u32) {
        self.worker = Some(worker);
    }

    /// Remote reads that arrived before the transaction was dispatched.
    pub fn early_remote_reads_mut(&mut self) -> &mut VecDeque<RemoteReadResult> {
        &mut self.early_remote_reads
    }

    /// Number of buffered early remote reads.
    #[must_use]
    pub fn num_early_remote_reads(&self) -> usize {
        self.early_remote_reads.len()
    }
}
