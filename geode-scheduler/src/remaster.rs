//! Master-counter validation strategies in front of the lock manager.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use geode_common::ids::{ReplicaId, TxnId};
use geode_core::containers::HotMap;
use geode_core::txn::{Key, Transaction};
use geode_storage::Storage;

use crate::holder::{HolderId, TransactionHolder};

/// Outcome of checking a transaction's master metadata against storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMasterResult {
    /// Every key's counter matches storage; pass through to the lock manager.
    Valid,
    /// At least one key's counter runs ahead of storage; queued until the remaster lands.
    Waiting,
    /// At least one key's counter is behind storage and can never match again.
    Abort,
}

/// Holders whose state changed after a remaster event or a release.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RemasterResult {
    /// Holders that became valid and should proceed to the lock manager.
    pub unblocked: Vec<HolderId>,
    /// Holders that became unreachable and must abort.
    pub should_abort: Vec<HolderId>,
}

/// Counter-validation capability selected at bootstrap per the remaster protocol.
pub trait RemasterManager: Send {
    /// Validates the holder's master metadata, queueing it when a remaster is still pending.
    fn verify_master(&mut self, id: HolderId, holder: &TransactionHolder) -> VerifyMasterResult;

    /// Re-evaluates queued holders after a key changed master.
    fn remaster_occurred(&mut self, key: &str, new_counter: u32) -> RemasterResult;

    /// Removes every queued holder belonging to the transaction, rechecking exposed heads.
    fn release_transaction(&mut self, txn_id: TxnId) -> RemasterResult;
}

/// Strategy used when the protocol tracks no counters at all.
#[derive(Debug, Default)]
pub struct NoOpRemasterManager;

impl RemasterManager for NoOpRemasterManager {
    fn verify_master(&mut self, _id: HolderId, _holder: &TransactionHolder) -> VerifyMasterResult {
        VerifyMasterResult::Valid
    }

    fn remaster_occurred(&mut self, _key: &str, _new_counter: u32) -> RemasterResult {
        RemasterResult::default()
    }

    fn release_transaction(&mut self, _txn_id: TxnId) -> RemasterResult {
        RemasterResult::default()
    }
}

/// One queued holder with the counters it was verified against.
#[derive(Debug, Clone)]
struct QueuedShard {
    id: HolderId,
    keys: Vec<(Key, u32)>,
}

impl QueuedShard {
    fn txn_id(&self) -> TxnId {
        self.id.txn_id()
    }
}

fn counter_keys(holder: &TransactionHolder) -> Vec<(Key, u32)> {
    let Some(txn) = holder.txn() else {
        return Vec::new();
    };
    holder
        .keys_in_partition()
        .iter()
        .filter_map(|(key, _)| {
            txn.master_metadata
                .get(key)
                .map(|metadata| (key.clone(), metadata.counter))
        })
        .collect()
}

fn check_counters(storage: &dyn Storage, keys: &[(Key, u32)]) -> VerifyMasterResult {
    let mut waiting = false;
    for (key, expected) in keys {
        let current = storage
            .read(key)
            .map_or(0, |record| record.metadata.counter);
        if *expected < current {
            return VerifyMasterResult::Abort;
        }
        if *expected > current {
            waiting = true;
        }
    }
    if waiting {
        VerifyMasterResult::Waiting
    } else {
        VerifyMasterResult::Valid
    }
}

/// Head-blocking strategy with one FIFO queue per home region.
///
/// A waiting transaction stalls everything behind it from the same home; only queue heads are
/// re-evaluated, which keeps transactions of one home in their log order.
pub struct SimpleRemasterManager {
    storage: Arc<dyn Storage>,
    queues: HotMap<ReplicaId, VecDeque<QueuedShard>>,
}

impl SimpleRemasterManager {
    /// Creates the strategy over the shared storage engine.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            queues: HotMap::default(),
        }
    }

    fn advance_heads(&mut self, result: &mut RemasterResult) {
        for queue in self.queues.values_mut() {
            while let Some(head) = queue.front() {
                match check_counters(self.storage.as_ref(), &head.keys) {
                    VerifyMasterResult::Valid => {
                        let Some(head) = queue.pop_front() else {
                            break;
                        };
                        result.unblocked.push(head.id);
                    }
                    VerifyMasterResult::Abort => {
                        let Some(head) = queue.pop_front() else {
                            break;
                        };
                        result.should_abort.push(head.id);
                    }
                    VerifyMasterResult::Waiting => break,
                }
            }
        }
    }
}

impl RemasterManager for SimpleRemasterManager {
    fn verify_master(&mut self, id: HolderId, holder: &TransactionHolder) -> VerifyMasterResult {
        let keys = counter_keys(holder);
        if keys.is_empty() {
            return VerifyMasterResult::Valid;
        }
        let Some(home) = holder.txn().and_then(Transaction::lock_only_home) else {
            return VerifyMasterResult::Valid;
        };

        let queue = self.queues.entry(home).or_default();
        if !queue.is_empty() {
            // Order within a home's log is preserved by waiting behind the blocked head.
            queue.push_back(QueuedShard { id, keys });
            return VerifyMasterResult::Waiting;
        }
        match check_counters(self.storage.as_ref(), &keys) {
            VerifyMasterResult::Valid => VerifyMasterResult::Valid,
            VerifyMasterResult::Abort => VerifyMasterResult::Abort,
            VerifyMasterResult::Waiting => {
                debug!(holder = ?id, "transaction waiting on remaster");
                queue.push_back(QueuedShard { id, keys });
                VerifyMasterResult::Waiting
            }
        }
    }

    fn remaster_occurred(&mut self, _key: &str, _new_counter: u32) -> RemasterResult {
        let mut result = RemasterResult::default();
        self.advance_heads(&mut result);
        result
    }

    fn release_transaction(&mut self, txn_id: TxnId) -> RemasterResult {
        for queue in self.queues.values_mut() {
            queue.retain(|shard| shard.txn_id() != txn_id);
        }
        let mut result = RemasterResult::default();
        self.advance_heads(&mut result);
        result
    }
}

/// Strategy with one wait queue per key; a waiting transaction parks on its stalest key.
pub struct PerKeyRemasterManager {
    storage: Arc<dyn Storage>,
    queues: HotMap<Key, VecDeque<QueuedShard>>,
}

impl PerKeyRemasterManager {
    /// Creates the strategy over the shared storage engine.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            queues: HotMap::default(),
        }
    }

    fn stalest_key(&self, keys: &[(Key, u32)]) -> Option<Key> {
        keys.iter()
            .map(|(key, expected)| {
                let current = self
                    .storage
                    .read(key)
                    .map_or(0, |record| record.metadata.counter);
                (key.clone(), expected.saturating_sub(current))
            })
            .max_by_key(|(_, gap)| *gap)
            .map(|(key, _)| key)
    }
}

impl RemasterManager for PerKeyRemasterManager {
    fn verify_master(&mut self, id: HolderId, holder: &TransactionHolder) -> VerifyMasterResult {
        let keys = counter_keys(holder);
        if keys.is_empty() {
            return VerifyMasterResult::Valid;
        }
        match check_counters(self.storage.as_ref(), &keys) {
            VerifyMasterResult::Valid => VerifyMasterResult::Valid,
            VerifyMasterResult::Abort => VerifyMasterResult::Abort,
            VerifyMasterResult::Waiting => {
                let Some(stalest) = self.stalest_key(&keys) else {
                    return VerifyMasterResult::Valid;
                };
                debug!(holder = ?id, key = stalest.as_str(), "transaction waiting on remaster");
                self.queues
                    .entry(stalest)
                    .or_default()
                    .push_back(QueuedShard { id, keys });
                VerifyMasterResult::Waiting
            }
        }
    }

    fn remaster_occurred(&mut self, key: &str, _new_counter: u32) -> RemasterResult {
        let mut result = RemasterResult::default();
        let Some(mut queue) = self.queues.remove(key) else {
            return result;
        };
        let mut still_waiting = VecDeque::new();
        for shard in queue.drain(..) {
            match check_counters(self.storage.as_ref(), &shard.keys) {
                VerifyMasterResult::Valid => result.unblocked.push(shard.id),
                VerifyMasterResult::Abort => result.should_abort.push(shard.id),
                VerifyMasterResult::Waiting => still_waiting.push_back(shard),
            }
        }
        if !still_waiting.is_empty() {
            let _ = self.queues.insert(key.to_owned(), still_waiting);
        }
        result
    }

    fn release_transaction(&mut self, txn_id: TxnId) -> RemasterResult {
        self.queues
            .retain(|_, queue| {
                queue.retain(|shard| shard.txn_id() != txn_id);
                !queue.is_empty()
            });
        RemasterResult::default()
    }
}
