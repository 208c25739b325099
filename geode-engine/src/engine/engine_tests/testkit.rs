use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use geode_common::config::{Configuration, Partitioning, RemasterProtocol};
use geode_common::constants::BROKER_POLL_TIMEOUT_MS;
use geode_common::ids::{Channel, MachineId, MachineIdNum, PartitionId, ReplicaId};
use geode_core::broker::{Network, Sender};
use geode_core::message::{Envelope, ForwardBatch, Message, Request, Response};
use geode_core::txn::{
    Batch, MasterMetadata, Operation, Procedure, Transaction, TransactionType,
};
use geode_storage::{MemStorage, Record, Storage};

use crate::engine::PartitionEngine;

/// A miniature deployment: engines for the configured local machines plus harness-side
/// mailboxes standing in for the server and the peer regions' interleavers.
pub(super) struct TestHarness {
    pub(super) network: Arc<Network>,
    pub(super) storages: Vec<Arc<MemStorage>>,
    pub(super) server_mailboxes: Vec<(MachineIdNum, Receiver<Envelope>)>,
    /// Held for their module threads; dropped (and joined) with the harness.
    _engines: Vec<PartitionEngine>,
}

impl TestHarness {
    /// Starts one engine per partition of replica zero.
    pub(super) fn start(
        num_replicas: u32,
        num_partitions: u32,
        num_workers: u32,
        remaster_protocol: RemasterProtocol,
    ) -> Self {
        let network = Network::new();
        let mut storages = Vec::new();
        let mut server_mailboxes = Vec::new();
        let mut engines = Vec::new();
        for partition in 0..num_partitions {
            let config = Arc::new(
                Configuration::new(
                    num_replicas,
                    num_partitions,
                    0,
                    partition,
                    num_workers,
                    remaster_protocol,
                    Partitioning::Modulo,
                )
                .expect("harness configuration must be valid"),
            );
            let machine = config.local_machine_id_num();
            let server_mailbox = network
                .register(machine, Channel::Server)
                .expect("server mailbox must register");
            server_mailboxes.push((machine, server_mailbox));
            let storage = Arc::new(MemStorage::new());
            let engine = PartitionEngine::start(
                config,
                Arc::clone(&network),
                Arc::clone(&storage) as Arc<dyn Storage>,
            )
            .expect("engine must start");
            storages.push(storage);
            engines.push(engine);
        }
        Self {
            network,
            storages,
            server_mailboxes,
            _engines: engines,
        }
    }

    /// Sending handle that impersonates an arbitrary machine, e.g. a peer region's sequencer.
    pub(super) fn sender_as(&self, machine: MachineIdNum) -> Sender {
        Sender::new(Arc::clone(&self.network), machine)
    }

    /// Sends one request to a channel of a machine, as if it came from `from`.
    pub(super) fn send(
        &self,
        from: MachineIdNum,
        to_machine: MachineIdNum,
        to_channel: Channel,
        request: Request,
    ) {
        self.sender_as(from)
            .send_to(Message::Request(request), to_channel, to_machine);
    }

    /// Receives the next completed sub-transaction addressed to the given server machine.
    pub(super) fn recv_completed_subtxn(
        &self,
        machine: MachineIdNum,
    ) -> (Transaction, PartitionId, Vec<u32>) {
        let envelope = self.recv_server_envelope(machine);
        let Message::Request(Request::CompletedSubtxn {
            txn,
            partition,
            involved_partitions,
        }) = envelope.message
        else {
            panic!("server mailbox must receive a completed subtxn");
        };
        (*txn, partition, involved_partitions)
    }

    /// Receives the next stats response addressed to the given server machine.
    pub(super) fn recv_stats(&self, machine: MachineIdNum) -> serde_json::Value {
        let envelope = self.recv_server_envelope(machine);
        let Message::Response(Response::Stats { stats_json, .. }) = envelope.message else {
            panic!("server mailbox must receive a stats response");
        };
        serde_json::from_str(&stats_json).expect("stats must be valid JSON")
    }

    fn recv_server_envelope(&self, machine: MachineIdNum) -> Envelope {
        let Some((_, mailbox)) = self
            .server_mailboxes
            .iter()
            .find(|(mailbox_machine, _)| *mailbox_machine == machine)
        else {
            panic!("no server mailbox is registered for machine {machine}");
        };
        mailbox
            .recv_timeout(Duration::from_millis(BROKER_POLL_TIMEOUT_MS * 50))
            .expect("server message must arrive before the timeout")
    }

    /// Asserts the scheduler of the given machine eventually tracks no transactions.
    ///
    /// Polled because cleanup can depend on in-flight messages from peer partitions.
    pub(super) fn assert_no_tracked_txns(&self, machine: MachineIdNum) {
        let mut last = serde_json::Value::Null;
        for _ in 0..50 {
            self.send(machine, machine, Channel::Scheduler, Request::Stats {
                id: u32::MAX,
                level: 0,
            });
            let stats = self.recv_stats(machine);
            last = stats["num_all_txns"].clone();
            if last == serde_json::json!(0) {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("machine {machine} still tracks transactions: num_all_txns = {last}");
    }
}

/// Seeds one record on a partition's storage.
pub(super) fn seed(storage: &MemStorage, key: &str, value: &str, master: ReplicaId, counter: u32) {
    storage.write(
        key.to_owned(),
        Record {
            value: value.to_owned(),
            metadata: MasterMetadata { master, counter },
        },
    );
}

/// A single-home write transaction; every key is mastered by `home`.
pub(super) fn write_txn(id: u64, keys: &[&str], home: ReplicaId) -> Transaction {
    let mut txn = Transaction::new(
        id,
        TransactionType::SingleHome,
        Procedure::Operations(
            keys.iter()
                .map(|key| Operation::Set {
                    key: (*key).to_owned(),
                    value: format!("value-{id}"),
                })
                .collect(),
        ),
        MachineId {
            replica: 0,
            partition: 0,
        },
    );
    for key in keys {
        let _ = txn.write_set.insert((*key).to_owned(), String::new());
        let _ = txn.master_metadata.insert(
            (*key).to_owned(),
            MasterMetadata {
                master: home,
                counter: 0,
            },
        );
    }
    txn
}

/// Rewrites a transaction into the lock-only shard for one home's keys.
pub(super) fn lock_only_shard(parent: &Transaction, home: ReplicaId) -> Transaction {
    let mut shard = parent.clone();
    shard.txn_type = TransactionType::LockOnly;
    shard
        .master_metadata
        .retain(|_, metadata| metadata.master == home);
    let keys = shard.master_metadata.keys().cloned().collect::<Vec<_>>();
    shard.read_set.retain(|key, _| keys.contains(key));
    shard.write_set.retain(|key, _| keys.contains(key));
    shard
}

/// Wraps transactions into a batch.
pub(super) fn batch(id: u64, txn_type: TransactionType, transactions: Vec<Transaction>) -> Batch {
    Batch::new(id, txn_type, transactions)
}

/// Request carrying a batch body.
pub(super) fn batch_data(batch: Batch, same_origin_position: u32) -> Request {
    Request::ForwardBatch(ForwardBatch::BatchData {
        batch: Box::new(batch),
        same_origin_position,
    })
}

/// Request carrying a batch order.
pub(super) fn batch_order(batch_id: u64, slot: u64) -> Request {
    Request::ForwardBatch(ForwardBatch::BatchOrder { batch_id, slot })
}
