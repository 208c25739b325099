//! Executor shard owned by the scheduler.

use std::sync::Arc;

use tracing::{debug, error, warn};

use geode_common::config::Configuration;
use geode_common::ids::{Channel, MachineIdNum, TxnId};
use geode_core::broker::Sender;
use geode_core::containers::HotMap;
use geode_core::message::{Message, RemoteReadResult, Request, Response};
use geode_core::module::NetworkedModule;
use geode_core::txn::{
    Key, Operation, Procedure, Transaction, TransactionStatus, Value,
};
use geode_storage::{Record, Storage};

use crate::holder::partition_footprint;

/// A transaction parked until reads from its peer partitions arrive.
#[derive(Debug)]
struct PendingTxn {
    txn: Transaction,
    awaiting_reads: usize,
}

/// Executes dispatched transactions against local storage.
///
/// Execution is split at the remote-read exchange: a multi-partition transaction sends its
/// local reads to the other active partitions, parks, and resumes when each involved peer has
/// answered. The scheduler guarantees the dispatch message precedes any read for the same
/// transaction, so a read for an unknown transaction is a protocol error, not a race.
pub struct Worker {
    worker_index: u32,
    config: Arc<Configuration>,
    sender: Sender,
    storage: Arc<dyn Storage>,
    pending: HotMap<TxnId, PendingTxn>,
}

impl Worker {
    /// Creates one executor shard.
    #[must_use]
    pub fn new(
        worker_index: u32,
        config: Arc<Configuration>,
        sender: Sender,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            worker_index,
            config,
            sender,
            storage,
            pending: HotMap::default(),
        }
    }

    /// Index of this shard inside the scheduler's pool.
    #[must_use]
    pub fn worker_index(&self) -> u32 {
        self.worker_index
    }

    fn start_transaction(&mut self, mut txn: Transaction) {
        debug!(txn_id = txn.id, worker = self.worker_index, "executing transaction");

        // First, read every local key of the read and write sets into the buffers.
        let mut local_reads = Vec::<(Key, Value)>::new();
        for (key, value) in txn
            .read_set
            .iter_mut()
            .chain(txn.write_set.iter_mut())
        {
            if !self.config.is_local_partition(key) {
                continue;
            }
            *value = self
                .storage
                .read(key)
                .map_or_else(String::new, |record| record.value);
            local_reads.push((key.clone(), value.clone()));
        }

        let footprint = partition_footprint(&self.config, &txn);
        let local_partition = self.config.local_partition;
        let local_active = footprint.active.contains(&local_partition);

        if footprint.involved.len() > 1 {
            // Send local reads to every other active partition of the local region.
            let reads = RemoteReadResult {
                txn_id: txn.id,
                partition: local_partition,
                will_abort: false,
                reads: local_reads,
            };
            for partition in &footprint.active {
                if *partition != local_partition {
                    self.sender.send_to(
                        Message::Request(Request::RemoteReadResult(reads.clone())),
                        Channel::Scheduler,
                        self.config
                            .machine_id_num(self.config.local_replica, *partition),
                    );
                }
            }

            // Active partitions apply writes, so they must see reads from every other
            // involved partition first; passive partitions are done after sending theirs.
            let awaiting_reads = if local_active {
                footprint.involved.len() - 1
            } else {
                0
            };
            if awaiting_reads > 0 {
                let _ = self.pending.insert(txn.id, PendingTxn { txn, awaiting_reads });
                return;
            }
        }

        self.finish_transaction(txn);
    }

    fn handle_remote_read(&mut self, read: RemoteReadResult) {
        let Some(pending) = self.pending.get_mut(&read.txn_id) else {
            warn!(
                txn_id = read.txn_id,
                worker = self.worker_index,
                "dropping remote read for unknown transaction"
            );
            return;
        };

        if read.will_abort {
            let Some(mut pending) = self.pending.remove(&read.txn_id) else {
                return;
            };
            pending.txn.status = TransactionStatus::Aborted;
            self.reply(pending.txn);
            return;
        }

        for (key, value) in read.reads {
            if let Some(buffer) = pending.txn.read_set.get_mut(&key) {
                *buffer = value.clone();
            }
            if let Some(buffer) = pending.txn.write_set.get_mut(&key) {
                *buffer = value;
            }
        }
        pending.awaiting_reads = pending.awaiting_reads.saturating_sub(1);
        if pending.awaiting_reads == 0 {
            let Some(pending) = self.pending.remove(&read.txn_id) else {
                return;
            };
            self.finish_transaction(pending.txn);
        }
    }

    fn finish_transaction(&mut self, mut txn: Transaction) {
        Self::execute_procedure(&mut txn);
        txn.status = TransactionStatus::Committed;
        self.apply_writes(&txn);
        self.reply(txn);
    }

    fn execute_procedure(txn: &mut Transaction) {
        let Procedure::Operations(operations) = txn.procedure.clone() else {
            // Remaster directives carry no data operations; the master change happens when
            // writes are applied.
            return;
        };
        for operation in operations {
            match operation {
                Operation::Get { .. } => {}
                Operation::Set { key, value } => {
                    if let Some(buffer) = txn.write_set.get_mut(&key) {
                        *buffer = value;
                    }
                }
                Operation::Delete { key } => {
                    if !txn.delete_set.contains(&key) {
                        txn.delete_set.push(key);
                    }
                }
            }
        }
    }

    fn apply_writes(&self, txn: &Transaction) {
        let remaster = match txn.procedure {
            Procedure::Remaster { new_master } => Some(new_master),
            Procedure::Operations(_) => None,
        };
        for (key, value) in &txn.write_set {
            if !self.config.is_local_partition(key) {
                continue;
            }
            if let Some(new_master) = remaster {
                let Some(mut record) = self.storage.read(key) else {
                    warn!(key = key.as_str(), "remaster target key is missing from storage");
                    continue;
                };
                record.metadata.master = new_master;
                record.metadata.counter += 1;
                self.storage.write(key.clone(), record);
                continue;
            }
            let record = match self.storage.read(key) {
                Some(mut record) => {
                    record.value = value.clone();
                    record
                }
                None => {
                    let Some(metadata) = txn.master_metadata.get(key).copied() else {
                        error!(
                            key = key.as_str(),
                            "master metadata for new key is missing; dropping write"
                        );
                        continue;
                    };
                    Record {
                        value: value.clone(),
                        metadata,
                    }
                }
            };
            self.storage.write(key.clone(), record);
        }
        for key in &txn.delete_set {
            if self.config.is_local_partition(key) {
                self.storage.delete(key);
            }
        }
    }

    fn reply(&self, txn: Transaction) {
        self.sender.send(
            Message::Response(Response::Worker { txn: Box::new(txn) }),
            Channel::Scheduler,
        );
    }
}

impl NetworkedModule for Worker {
    fn name(&self) -> &'static str {
        "worker"
    }

    fn handle_request(&mut self, request: Request, _from: MachineIdNum) {
        match request {
            Request::DispatchTxn { txn } => self.start_transaction(*txn),
            Request::RemoteReadResult(read) => self.handle_remote_read(read),
            other => {
                error!(request = ?other, "worker received unexpected request");
            }
        }
    }
}
