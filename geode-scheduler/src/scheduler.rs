//! Per-partition deterministic executor front-end.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error};

use geode_common::config::{Configuration, RemasterProtocol};
use geode_common::ids::{Channel, MachineIdNum, TxnId, TxnReplicaId};
use geode_core::broker::Sender;
use geode_core::containers::{HotMap, HotSet};
use geode_core::message::{Message, RemoteReadResult, Request, Response};
use geode_core::module::NetworkedModule;
use geode_core::txn::{
    Procedure, Transaction, TransactionEvent, TransactionStatus, TransactionType,
};
use geode_storage::Storage;

use crate::holder::{HolderId, TransactionHolder};
use crate::lock_manager::{AcquireLocksResult, LockManager};
use crate::remaster::{
    NoOpRemasterManager, PerKeyRemasterManager, RemasterManager, RemasterResult,
    SimpleRemasterManager, VerifyMasterResult,
};

/// Decision produced while a holder is still borrowed, acted on afterwards.
enum LockDecision {
    Dispatch(TxnId),
    Abort(TxnId),
    Wait,
}

/// Accepts globally ordered transactions and drives them to execution.
///
/// The scheduler exclusively owns all holder state; workers receive transaction bodies by
/// value and return them in their completion response.
pub struct Scheduler {
    config: Arc<Configuration>,
    sender: Sender,
    all_txns: HotMap<TxnId, TransactionHolder>,
    lock_only_txns: HotMap<TxnReplicaId, TransactionHolder>,
    aborting_txns: HotSet<TxnId>,
    mh_abort_waiting_on: HotMap<TxnId, i64>,
    lock_manager: LockManager,
    remaster_manager: Box<dyn RemasterManager>,
}

impl Scheduler {
    /// Creates the scheduler, selecting the remaster strategy from the configuration.
    #[must_use]
    pub fn new(config: Arc<Configuration>, sender: Sender, storage: Arc<dyn Storage>) -> Self {
        let remaster_manager: Box<dyn RemasterManager> = match config.remaster_protocol {
            RemasterProtocol::Simple => Box::new(SimpleRemasterManager::new(Arc::clone(&storage))),
            RemasterProtocol::PerKey => Box::new(PerKeyRemasterManager::new(Arc::clone(&storage))),
            RemasterProtocol::None | RemasterProtocol::Counterless => {
                Box::new(NoOpRemasterManager)
            }
        };
        let lock_manager = if config.remaster_protocol == RemasterProtocol::Counterless {
            LockManager::with_counter_checks()
        } else {
            LockManager::new()
        };
        Self {
            config,
            sender,
            all_txns: HotMap::default(),
            lock_only_txns: HotMap::default(),
            aborting_txns: HotSet::default(),
            mh_abort_waiting_on: HotMap::default(),
            lock_manager,
            remaster_manager,
        }
    }

    /// Number of transactions currently tracked by the holder map.
    #[must_use]
    pub fn num_tracked_txns(&self) -> usize {
        self.all_txns.len()
    }

    /// Number of lock-only shards currently tracked.
    #[must_use]
    pub fn num_lock_only_txns(&self) -> usize {
        self.lock_only_txns.len()
    }

    fn local_machine(&self) -> MachineIdNum {
        self.config.local_machine_id_num()
    }

    fn has_remaster_manager(&self) -> bool {
        matches!(
            self.config.remaster_protocol,
            RemasterProtocol::Simple | RemasterProtocol::PerKey
        )
    }

    // Transaction processing

    fn process_transaction(&mut self, mut txn: Transaction) {
        txn.record_event(TransactionEvent::EnterScheduler, self.local_machine());

        let txn_id = txn.id;
        let txn_type = txn.txn_type;
        match txn_type {
            TransactionType::SingleHome | TransactionType::MultiHome => {
                let holder = self.all_txns.entry(txn_id).or_default();
                holder.set_transaction(&self.config, txn);
                if holder.keys_in_partition().is_empty() {
                    let _ = self.all_txns.remove(&txn_id);
                    return;
                }
            }
            TransactionType::LockOnly => {
                let Some(key) = txn.lock_only_key() else {
                    error!(txn_id, "dropping lock-only shard without master metadata");
                    return;
                };
                let holder = self.lock_only_txns.entry(key).or_default();
                holder.set_transaction(&self.config, txn);
                if holder.keys_in_partition().is_empty() {
                    let _ = self.lock_only_txns.remove(&key);
                    return;
                }
                self.route_lock_only(key);
                return;
            }
        }

        match txn_type {
            TransactionType::SingleHome => {
                debug!(txn_id, "accepted single-home transaction");
                if self.maybe_continue_pre_dispatch_abort(txn_id) {
                    return;
                }
                if self.has_remaster_manager() {
                    if self.maybe_abort_remaster_transaction(txn_id) {
                        return;
                    }
                    self.send_to_remaster_manager(HolderId::Txn(txn_id));
                } else {
                    self.send_to_lock_manager(HolderId::Txn(txn_id));
                }
            }
            TransactionType::MultiHome => {
                debug!(txn_id, "accepted multi-home transaction");
                if self.aborting_txns.contains(&txn_id) {
                    let _ = self.maybe_continue_pre_dispatch_abort(txn_id);
                    return;
                }
                if self.config.remaster_protocol == RemasterProtocol::Counterless
                    && self.maybe_abort_remaster_transaction(txn_id)
                {
                    return;
                }
                self.send_to_lock_manager(HolderId::Txn(txn_id));
            }
            TransactionType::LockOnly => {}
        }
    }

    fn route_lock_only(&mut self, key: TxnReplicaId) {
        debug!(txn_id = key.0, replica = key.1, "accepted lock-only transaction");
        if self.maybe_continue_pre_dispatch_abort_lock_only(key) {
            return;
        }
        if self.has_remaster_manager() {
            self.send_to_remaster_manager(HolderId::LockOnly(key));
        } else {
            self.send_to_lock_manager(HolderId::LockOnly(key));
        }
    }

    /// Aborts a remaster directive whose new master equals the key's current master.
    fn maybe_abort_remaster_transaction(&mut self, txn_id: TxnId) -> bool {
        let is_trivial = self.all_txns.get(&txn_id).and_then(|holder| {
            let txn = holder.txn()?;
            let Procedure::Remaster { new_master } = txn.procedure else {
                return None;
            };
            let current = txn.master_metadata.values().next()?.master;
            Some(new_master == current)
        });
        if is_trivial == Some(true) {
            self.trigger_pre_dispatch_abort(txn_id);
            return true;
        }
        false
    }

    fn send_to_remaster_manager(&mut self, id: HolderId) {
        let holder = match id {
            HolderId::Txn(txn_id) => self.all_txns.get(&txn_id),
            HolderId::LockOnly(key) => self.lock_only_txns.get(&key),
        };
        let Some(holder) = holder else {
            error!(holder = ?id, "remaster check on unknown holder");
            return;
        };
        match self.remaster_manager.verify_master(id, holder) {
            VerifyMasterResult::Valid => self.send_to_lock_manager(id),
            VerifyMasterResult::Abort => {
                self.trigger_pre_dispatch_abort(id.txn_id());
            }
            VerifyMasterResult::Waiting => {
                debug!(holder = ?id, "transaction waiting on remaster");
            }
        }
    }

    fn process_remaster_result(&mut self, result: RemasterResult) {
        for id in result.unblocked {
            self.send_to_lock_manager(id);
        }
        let mut aborting_ids = Vec::new();
        for id in &result.should_abort {
            let txn_id = id.txn_id();
            assert!(
                !aborting_ids.contains(&txn_id),
                "duplicate transactions returned for abort: {txn_id}"
            );
            aborting_ids.push(txn_id);
        }
        for txn_id in aborting_ids {
            self.trigger_pre_dispatch_abort(txn_id);
        }
    }

    fn send_to_lock_manager(&mut self, id: HolderId) {
        let local_machine = self.local_machine();
        let decision = match id {
            HolderId::Txn(txn_id) => {
                let Some(holder) = self.all_txns.get_mut(&txn_id) else {
                    error!(txn_id, "lock request on unknown holder");
                    return;
                };
                let Some(txn_type) = holder.txn().map(|txn| txn.txn_type) else {
                    return;
                };
                match txn_type {
                    TransactionType::SingleHome => {
                        let _ = self.lock_manager.accept_transaction(holder);
                        match self.lock_manager.acquire_locks(txn_id, holder) {
                            AcquireLocksResult::Acquired => LockDecision::Dispatch(txn_id),
                            AcquireLocksResult::Abort => LockDecision::Abort(txn_id),
                            AcquireLocksResult::Waiting => LockDecision::Wait,
                        }
                    }
                    TransactionType::MultiHome => {
                        if self.lock_manager.accept_transaction(holder) {
                            if let Some(txn) = holder.txn_mut() {
                                txn.record_event(TransactionEvent::Accepted, local_machine);
                            }
                            LockDecision::Dispatch(txn_id)
                        } else {
                            LockDecision::Wait
                        }
                    }
                    TransactionType::LockOnly => {
                        error!(txn_id, "lock-only shard stored in the main holder map");
                        LockDecision::Wait
                    }
                }
            }
            HolderId::LockOnly(key) => {
                let Some(holder) = self.lock_only_txns.get(&key) else {
                    error!(txn_id = key.0, "lock request on unknown lock-only shard");
                    return;
                };
                match self.lock_manager.acquire_locks(key.0, holder) {
                    AcquireLocksResult::Acquired => LockDecision::Dispatch(key.0),
                    AcquireLocksResult::Abort => LockDecision::Abort(key.0),
                    AcquireLocksResult::Waiting => LockDecision::Wait,
                }
            }
        };
        match decision {
            LockDecision::Dispatch(txn_id) => self.dispatch_transaction(txn_id),
            LockDecision::Abort(txn_id) => self.trigger_pre_dispatch_abort(txn_id),
            LockDecision::Wait => {}
        }
    }

    // Transaction dispatch

    fn dispatch_transaction(&mut self, txn_id: TxnId) {
        let local_machine = self.local_machine();
        let worker = select_worker(txn_id, self.config.num_workers);

        let Some(holder) = self.all_txns.get_mut(&txn_id) else {
            panic!("txn {txn_id} is not in the holder map");
        };

        // Lock-only shards of a multi-home parent are consumed by its dispatch.
        if holder.txn().map(|txn| txn.txn_type) == Some(TransactionType::MultiHome) {
            for replica in holder.involved_replicas().clone() {
                let _ = self.lock_only_txns.remove(&(txn_id, replica));
            }
        }

        holder.set_worker(worker);
        if let Some(txn) = holder.txn_mut() {
            txn.record_event(TransactionEvent::Dispatched, local_machine);
        }
        let Some(txn) = holder.take_transaction() else {
            panic!("txn {txn_id} was dispatched without a body");
        };
        let early_reads = holder
            .early_remote_reads_mut()
            .drain(..)
            .collect::<Vec<_>>();

        // The transaction must always reach the worker before any remote read for it.
        self.sender.send(
            Message::Request(Request::DispatchTxn { txn: Box::new(txn) }),
            Channel::Worker(worker),
        );
        for read in early_reads {
            self.sender.send(
                Message::Request(Request::RemoteReadResult(read)),
                Channel::Worker(worker),
            );
        }
        debug!(txn_id, worker, "dispatched transaction");
    }

    fn process_worker_response(&mut self, txn: Transaction) {
        let txn_id = txn.id;
        let local_machine = self.local_machine();
        let has_remaster_manager = self.has_remaster_manager();
        let Some(holder) = self.all_txns.get_mut(&txn_id) else {
            error!(txn_id, "worker reply for unknown transaction");
            return;
        };
        holder.set_transaction_body(txn);

        // Release locks held by this txn and enqueue whatever became ready.
        let unblocked = self.lock_manager.release_locks(holder);
        if let Some(txn) = holder.txn_mut() {
            txn.record_event(TransactionEvent::ReleaseLocks, local_machine);
        }
        let remaster_event = if has_remaster_manager {
            holder.txn().and_then(|txn| {
                let Procedure::Remaster { .. } = txn.procedure else {
                    return None;
                };
                let key = txn.write_set.keys().next()?.clone();
                let counter = txn.master_metadata.get(&key)?.counter + 1;
                Some((key, counter))
            })
        } else {
            None
        };

        for unblocked_txn in unblocked {
            self.dispatch_transaction(unblocked_txn);
        }
        if let Some((key, counter)) = remaster_event {
            let result = self.remaster_manager.remaster_occurred(&key, counter);
            self.process_remaster_result(result);
        }

        self.send_to_coordinating_server(txn_id);
        let _ = self.all_txns.remove(&txn_id);
    }

    fn send_to_coordinating_server(&mut self, txn_id: TxnId) {
        let local_machine = self.local_machine();
        let local_partition = self.config.local_partition;
        let Some(holder) = self.all_txns.get_mut(&txn_id) else {
            return;
        };
        if let Some(txn) = holder.txn_mut() {
            txn.record_event(TransactionEvent::ExitScheduler, local_machine);
        }
        let Some(txn) = holder.txn() else {
            return;
        };
        let involved_partitions = holder.involved_partitions().iter().copied().collect();
        let coordinating_server = self
            .config
            .machine_id_num(txn.coordinating_server.replica, txn.coordinating_server.partition);
        let message = Request::CompletedSubtxn {
            txn: Box::new(txn.clone()),
            partition: local_partition,
            involved_partitions,
        };
        self.sender
            .send_to(Message::Request(message), Channel::Server, coordinating_server);
    }

    // Remote read relay

    fn process_remote_read_result(&mut self, read: RemoteReadResult) {
        let txn_id = read.txn_id;
        let dispatched_worker = self
            .all_txns
            .get(&txn_id)
            .and_then(TransactionHolder::worker);

        if let Some(worker) = dispatched_worker {
            debug!(txn_id, "got remote read result");
            self.sender.send(
                Message::Request(Request::RemoteReadResult(read)),
                Channel::Worker(worker),
            );
            return;
        }

        // Reads that arrive before the transaction is dispatched are buffered on the holder.
        debug!(txn_id, "got early remote read result");
        let remote_abort = read.will_abort;
        self.all_txns
            .entry(txn_id)
            .or_default()
            .early_remote_reads_mut()
            .push_back(read);

        if self.aborting_txns.contains(&txn_id) {
            // This may have been the last remote read the abort was waiting for.
            self.maybe_finish_abort(txn_id);
        } else if remote_abort {
            self.trigger_pre_dispatch_abort(txn_id);
        }
    }

    // Pre-dispatch abort processing

    fn trigger_pre_dispatch_abort(&mut self, txn_id: TxnId) {
        assert!(
            !self.aborting_txns.contains(&txn_id),
            "abort was triggered twice: {txn_id}"
        );
        debug!(txn_id, "triggering abort of txn");

        let holder = self.all_txns.entry(txn_id).or_default();
        assert!(
            holder.worker().is_none(),
            "dispatched transactions are handled by the worker: {txn_id}"
        );
        let has_body = holder.txn().is_some();
        let _ = self.aborting_txns.insert(txn_id);

        if has_body {
            let _ = self.maybe_continue_pre_dispatch_abort(txn_id);
        } else {
            debug!(txn_id, "deferring abort until txn arrives");
        }
    }

    fn maybe_continue_pre_dispatch_abort(&mut self, txn_id: TxnId) -> bool {
        if !self.aborting_txns.contains(&txn_id) {
            return false;
        }
        let Some(holder) = self.all_txns.get_mut(&txn_id) else {
            return false;
        };
        let Some(txn) = holder.txn_mut() else {
            return true;
        };
        debug!(txn_id, "main txn of abort arrived");
        txn.status = TransactionStatus::Aborted;
        let txn_type = txn.txn_type;
        let multi_partition = holder.involved_partitions().len() > 1;

        self.send_to_coordinating_server(txn_id);
        if multi_partition {
            self.send_abort_to_partitions(txn_id);
        }

        // The txn may still sit in the remaster or lock manager when the abort came from a
        // remote partition; both managers must forget it, and doing so can unblock others.
        if self.has_remaster_manager() {
            let result = self.remaster_manager.release_transaction(txn_id);
            self.process_remaster_result(result);
        }
        let unblocked = match self.all_txns.get(&txn_id) {
            Some(holder) => self.lock_manager.release_locks(holder),
            None => Vec::new(),
        };
        for unblocked_txn in unblocked {
            self.dispatch_transaction(unblocked_txn);
        }

        if txn_type == TransactionType::MultiHome {
            self.collect_lock_only_txns_for_abort(txn_id);
        }

        self.maybe_finish_abort(txn_id);
        true
    }

    fn maybe_continue_pre_dispatch_abort_lock_only(&mut self, key: TxnReplicaId) -> bool {
        let txn_id = key.0;
        if !self.aborting_txns.contains(&txn_id) {
            return false;
        }
        debug!(txn_id, replica = key.1, "aborting lock-only txn arrived");
        let _ = self.lock_only_txns.remove(&key);
        *self.mh_abort_waiting_on.entry(txn_id).or_insert(0) -= 1;

        // This may have been the last lock-only shard.
        self.maybe_finish_abort(txn_id);
        true
    }

    fn collect_lock_only_txns_for_abort(&mut self, txn_id: TxnId) {
        let involved_replicas = match self.all_txns.get(&txn_id) {
            Some(holder) => holder.involved_replicas().clone(),
            None => return,
        };
        let waiting = self.mh_abort_waiting_on.entry(txn_id).or_insert(0);
        *waiting += involved_replicas.len() as i64;

        // Shards that already arrived were released together with the parent; drop them now.
        for replica in involved_replicas {
            if self.lock_only_txns.remove(&(txn_id, replica)).is_some() {
                *self.mh_abort_waiting_on.entry(txn_id).or_insert(0) -= 1;
            }
        }
    }

    fn send_abort_to_partitions(&mut self, txn_id: TxnId) {
        let local_partition = self.config.local_partition;
        let local_replica = self.config.local_replica;
        let Some(holder) = self.all_txns.get(&txn_id) else {
            return;
        };
        let read = RemoteReadResult {
            txn_id,
            partition: local_partition,
            will_abort: true,
            reads: Vec::new(),
        };
        for partition in holder.active_partitions().clone() {
            if partition != local_partition {
                self.sender.send_to(
                    Message::Request(Request::RemoteReadResult(read.clone())),
                    Channel::Scheduler,
                    self.config.machine_id_num(local_replica, partition),
                );
            }
        }
    }

    fn maybe_finish_abort(&mut self, txn_id: TxnId) {
        debug!(txn_id, "attempting to finish abort");
        let Some(holder) = self.all_txns.get(&txn_id) else {
            return;
        };
        // Lock-only shards may arrive before the multi-home body does.
        let Some(txn) = holder.txn() else {
            return;
        };

        // Active partitions must collect remote reads from all other involved partitions.
        let num_remote_partitions = holder.involved_partitions().len().saturating_sub(1);
        let local_partition_active = holder
            .active_partitions()
            .contains(&self.config.local_partition);
        if num_remote_partitions > 0
            && local_partition_active
            && holder.num_early_remote_reads() < num_remote_partitions
        {
            return;
        }

        // Multi-homes must collect all their lock-only shards.
        if txn.txn_type == TransactionType::MultiHome {
            if self.mh_abort_waiting_on.get(&txn_id).copied().unwrap_or(0) != 0 {
                return;
            }
            let _ = self.mh_abort_waiting_on.remove(&txn_id);
        }

        let _ = self.aborting_txns.remove(&txn_id);
        let _ = self.all_txns.remove(&txn_id);
        debug!(txn_id, "finished abort");
    }

    // Statistics

    fn process_stats_request(&mut self, id: u32, level: u32) {
        let mut stats = json!({
            "num_all_txns": self.all_txns.len(),
        });
        if level >= 1 {
            let mut txn_ids = self.all_txns.keys().copied().collect::<Vec<_>>();
            txn_ids.sort_unstable();
            stats["all_txns"] = json!(txn_ids);
        }
        if let serde_json::Value::Object(lock_stats) = self.lock_manager.stats(level) {
            for (key, value) in lock_stats {
                stats[key] = value;
            }
        }
        self.sender.send(
            Message::Response(Response::Stats {
                id,
                stats_json: stats.to_string(),
            }),
            Channel::Server,
        );
    }
}

impl NetworkedModule for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn handle_request(&mut self, request: Request, _from: MachineIdNum) {
        match request {
            Request::ForwardTxn { txn } => self.process_transaction(*txn),
            Request::RemoteReadResult(read) => self.process_remote_read_result(read),
            Request::Stats { id, level } => self.process_stats_request(id, level),
            other => {
                error!(request = ?other, "unexpected request type received");
            }
        }
    }

    fn handle_response(&mut self, response: Response, _from: MachineIdNum) {
        match response {
            Response::Worker { txn } => self.process_worker_response(*txn),
            Response::Stats { .. } => {
                error!("scheduler received unexpected stats response");
            }
        }
    }
}

/// Maps a transaction id onto a worker shard.
///
/// Ids are hashed first: structured id spaces (client counters, machine prefixes) would bias
/// a plain modulo.
fn select_worker(txn_id: TxnId, num_workers: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    txn_id.hash(&mut hasher);
    match u32::try_from(hasher.finish() % u64::from(num_workers)) {
        Ok(worker) => worker,
        Err(_) => unreachable!("modulo num_workers ensures worker index fits into u32"),
    }
}
