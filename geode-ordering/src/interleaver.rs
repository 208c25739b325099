//! Per-partition log merger.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};

use geode_common::config::Configuration;
use geode_common::ids::{Channel, MachineIdNum, ReplicaId};
use geode_core::broker::Sender;
use geode_core::message::{ForwardBatch, Message, Request, Response};
use geode_core::module::NetworkedModule;
use geode_core::txn::{Batch, TransactionEvent, TransactionType};

use crate::batch_log::BatchLog;
use crate::local_log::LocalLog;

/// Merges the local, single-home, and multi-home logs into one deterministic emission order.
///
/// Single-home logs are kept in an ordered map: every replica must drain them in the same
/// region order for the cross-log interleaving to be identical everywhere.
pub struct Interleaver {
    config: Arc<Configuration>,
    sender: Sender,
    local_log: LocalLog,
    single_home_logs: BTreeMap<ReplicaId, BatchLog>,
    multi_home_log: BatchLog,
}

impl Interleaver {
    /// Creates the interleaver for the local partition.
    #[must_use]
    pub fn new(config: Arc<Configuration>, sender: Sender) -> Self {
        Self {
            config,
            sender,
            local_log: LocalLog::new(),
            single_home_logs: BTreeMap::new(),
            multi_home_log: BatchLog::pre_ordered(),
        }
    }

    fn handle_batch_data(&mut self, mut batch: Batch, same_origin_position: u32, from: MachineIdNum) {
        let local_machine = self.config.local_machine_id_num();
        batch.record_event(TransactionEvent::EnterInterleaverInBatch, local_machine);

        let from_machine = self.config.unpack_machine_id(from);
        match batch.transaction_type {
            TransactionType::SingleHome => {
                debug!(
                    batch_id = batch.id,
                    from,
                    num_txns = batch.transactions.len(),
                    "received data for single-home batch"
                );
                if from_machine.replica == self.config.local_replica {
                    // Batches generated by the same machine need to follow their order of
                    // creation; the origin position carries that order.
                    self.local_log.add_batch_id(
                        from_machine.partition,
                        same_origin_position,
                        batch.id,
                    );
                }
                self.single_home_logs
                    .entry(from_machine.replica)
                    .or_default()
                    .add_batch(batch);
            }
            TransactionType::MultiHome => {
                debug!(
                    batch_id = batch.id,
                    num_txns = batch.transactions.len(),
                    "received data for multi-home batch"
                );
                // Multi-home batches are already ordered with respect to each other and their
                // ids were replaced with slot ids by the orderer, so id and slot coincide.
                self.multi_home_log.add_slot(batch.id, batch.id);
                self.multi_home_log.add_batch(batch);
            }
            TransactionType::LockOnly => {
                error!(
                    batch_id = batch.id,
                    "dropping batch with invalid transaction type; only single-home and \
                     multi-home batches are accepted"
                );
            }
        }
    }

    fn advance_logs(&mut self) {
        let local_replica = self.config.local_replica;
        let local_partition = self.config.local_partition;

        // Local log first: each ready (slot, batch) pair is replicated to the same partition
        // in every other region before it joins the local region's single-home log.
        while self.local_log.has_next_batch() {
            let (slot_id, batch_id) = self.local_log.next_batch();
            let order = Request::ForwardBatch(ForwardBatch::BatchOrder { batch_id, slot: slot_id });
            for replica in 0..self.config.num_replicas {
                if replica != local_replica {
                    self.sender.send_to(
                        Message::Request(order.clone()),
                        Channel::Interleaver,
                        self.config.machine_id_num(replica, local_partition),
                    );
                }
            }
            self.single_home_logs
                .entry(local_replica)
                .or_default()
                .add_slot(slot_id, batch_id);
        }

        let mut ready = Vec::new();
        for log in self.single_home_logs.values_mut() {
            while log.has_next_batch() {
                ready.push(log.next_batch());
            }
        }
        while self.multi_home_log.has_next_batch() {
            ready.push(self.multi_home_log.next_batch());
        }
        for batch in ready {
            self.emit_batch(batch);
        }
    }

    fn emit_batch(&mut self, batch: Batch) {
        debug!(batch_id = batch.id, "processing batch from global log");
        let local_machine = self.config.local_machine_id_num();
        for mut txn in batch.transactions {
            // Each transaction inherits the trace recorded while it travelled inside the batch.
            txn.events.extend(batch.events.iter().copied());
            txn.record_event(TransactionEvent::ExitInterleaver, local_machine);
            self.sender.send(
                Message::Request(Request::ForwardTxn { txn: Box::new(txn) }),
                Channel::Scheduler,
            );
        }
    }
}

impl NetworkedModule for Interleaver {
    fn name(&self) -> &'static str {
        "interleaver"
    }

    fn handle_request(&mut self, request: Request, from: MachineIdNum) {
        match request {
            Request::LocalQueueOrder { slot, queue_id } => {
                debug!(slot, queue_id, "received local queue order");
                self.local_log.add_slot(slot, queue_id);
            }
            Request::ForwardBatch(ForwardBatch::BatchData {
                batch,
                same_origin_position,
            }) => {
                self.handle_batch_data(*batch, same_origin_position, from);
            }
            Request::ForwardBatch(ForwardBatch::BatchOrder { batch_id, slot }) => {
                debug!(batch_id, from, slot, "received order for batch");
                let from_replica = self.config.unpack_machine_id(from).replica;
                self.single_home_logs
                    .entry(from_replica)
                    .or_default()
                    .add_slot(slot, batch_id);
            }
            other => {
                error!(request = ?other, "unexpected request type received");
            }
        }
        self.advance_logs();
    }

    fn handle_response(&mut self, response: Response, _from: MachineIdNum) {
        error!(response = ?response, "interleaver received unexpected response");
    }
}
