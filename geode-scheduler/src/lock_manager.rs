//! Deterministic strict-2PL lock table with per-key FIFO wait queues.

use std::collections::VecDeque;

use serde_json::json;
use tracing::{error, warn};

use geode_common::constants::LOCK_TABLE_SIZE_LIMIT;
use geode_common::ids::TxnId;
use geode_core::containers::HotMap;
use geode_core::txn::{Key, Procedure, TransactionStatus, TransactionType};

use crate::holder::{LockMode, TransactionHolder};

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireLocksResult {
    /// All parts of the transaction hold their locks; dispatch now.
    Acquired,
    /// At least one lock or shard is still outstanding.
    Waiting,
    /// A key's master counter can never match; abort before dispatch.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
}

/// FIFO queue of requests for one key; the granted set is the maximal compatible prefix.
#[derive(Debug, Default)]
struct LockQueue {
    requests: VecDeque<LockRequest>,
}

impl LockQueue {
    fn granted_count(&self) -> usize {
        match self.requests.front() {
            None => 0,
            Some(front) if front.mode == LockMode::Write => 1,
            Some(_) => self
                .requests
                .iter()
                .take_while(|request| request.mode == LockMode::Read)
                .count(),
        }
    }

    fn is_granted(&self, txn_id: TxnId) -> bool {
        let granted = self.granted_count();
        self.requests
            .iter()
            .take(granted)
            .any(|request| request.txn_id == txn_id)
    }

    fn granted_ids(&self) -> Vec<TxnId> {
        self.requests
            .iter()
            .take(self.granted_count())
            .map(|request| request.txn_id)
            .collect()
    }

    fn remove(&mut self, txn_id: TxnId) {
        self.requests.retain(|request| request.txn_id != txn_id);
    }
}

/// Progress of one logical transaction through acceptance and lock acquisition.
///
/// A single-home transaction is one shard (itself); a multi-home transaction is one shard per
/// involved region, each arriving as a lock-only transaction. The parent becomes ready only
/// when the expected shard count has arrived and every requested lock is granted.
#[derive(Debug, Default)]
struct TxnProgress {
    accepted: bool,
    expected_shards: Option<usize>,
    arrived_shards: usize,
    waiting_locks: usize,
    counter_blocked: usize,
}

impl TxnProgress {
    fn is_ready(&self) -> bool {
        self.accepted
            && self.expected_shards == Some(self.arrived_shards)
            && self.waiting_locks == 0
            && self.counter_blocked == 0
    }
}

/// Per-partition deterministic lock manager.
///
/// Deadlock freedom comes from the caller: transactions are fed in the global order produced
/// by the interleaver, and each holder requests its keys in one deterministic order.
#[derive(Debug, Default)]
pub struct LockManager {
    lock_table: HotMap<Key, LockQueue>,
    txn_progress: HotMap<TxnId, TxnProgress>,
    /// Per-key remaster counters, maintained only under the counterless protocol.
    key_counters: HotMap<Key, u32>,
    /// Acquirers whose counters run ahead of the local key counter, per key.
    counter_waiters: HotMap<Key, Vec<(TxnId, u32)>>,
    counter_checks_enabled: bool,
    size_limit_reported: bool,
}

impl LockManager {
    /// Creates a lock manager without counter validation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a lock manager that validates per-key master counters at acquisition.
    #[must_use]
    pub fn with_counter_checks() -> Self {
        Self {
            counter_checks_enabled: true,
            ..Self::default()
        }
    }

    /// Records expected participation of a single-home or multi-home transaction.
    ///
    /// Returns true only when a multi-home transaction has seen all its lock-only shards plus
    /// the parent itself, i.e. it is ready for dispatch.
    pub fn accept_transaction(&mut self, holder: &TransactionHolder) -> bool {
        let Some(txn) = holder.txn() else {
            error!("accept_transaction called on a holder without a body");
            return false;
        };
        let expected_shards = match txn.txn_type {
            TransactionType::SingleHome => 1,
            TransactionType::MultiHome => holder.involved_replicas().len(),
            TransactionType::LockOnly => {
                error!(
                    txn_id = txn.id,
                    "lock-only shards are not accepted directly"
                );
                return false;
            }
        };
        let progress = self.txn_progress.entry(txn.id).or_default();
        progress.accepted = true;
        progress.expected_shards = Some(expected_shards);
        progress.is_ready()
    }

    /// Attempts to grant every lock the holder requires on its local keys.
    ///
    /// Called for single-home transactions and for each lock-only shard of a multi-home
    /// transaction; lock-only shards acquire under the parent transaction id.
    pub fn acquire_locks(&mut self, txn_id: TxnId, holder: &TransactionHolder) -> AcquireLocksResult {
        if self.counter_checks_enabled
            && let Some(txn) = holder.txn()
        {
            for (key, _) in holder.keys_in_partition() {
                let Some(metadata) = txn.master_metadata.get(key) else {
                    continue;
                };
                let current = self.key_counters.get(key).copied().unwrap_or(0);
                if metadata.counter < current {
                    return AcquireLocksResult::Abort;
                }
            }
        }

        {
            let progress = self.txn_progress.entry(txn_id).or_default();
            progress.arrived_shards += 1;
        }

        let mut waiting_locks = 0_usize;
        let mut counter_blocked = 0_usize;
        for (key, mode) in holder.keys_in_partition() {
            if !self.lock_table.contains_key(key)
                && self.lock_table.len() >= LOCK_TABLE_SIZE_LIMIT
                && !self.size_limit_reported
            {
                warn!(
                    limit = LOCK_TABLE_SIZE_LIMIT,
                    "lock table exceeded its size limit"
                );
                self.size_limit_reported = true;
            }
            let queue = self.lock_table.entry(key.clone()).or_default();
            queue.requests.push_back(LockRequest {
                txn_id,
                mode: *mode,
            });
            if !queue.is_granted(txn_id) {
                waiting_locks += 1;
            }

            if self.counter_checks_enabled
                && let Some(txn) = holder.txn()
                && let Some(metadata) = txn.master_metadata.get(key)
            {
                let current = self.key_counters.get(key).copied().unwrap_or(0);
                if metadata.counter > current {
                    counter_blocked += 1;
                    self.counter_waiters
                        .entry(key.clone())
                        .or_default()
                        .push((txn_id, metadata.counter));
                }
            }
        }

        let progress = self.txn_progress.entry(txn_id).or_default();
        progress.waiting_locks += waiting_locks;
        progress.counter_blocked += counter_blocked;
        if progress.waiting_locks == 0 && progress.is_ready() {
            AcquireLocksResult::Acquired
        } else {
            AcquireLocksResult::Waiting
        }
    }

    /// Releases every lock held or requested by the transaction and walks the freed queues.
    ///
    /// Returns the transactions that transitioned from waiting to fully acquired, in grant
    /// order.
    pub fn release_locks(&mut self, holder: &TransactionHolder) -> Vec<TxnId> {
        let Some(txn) = holder.txn() else {
            error!("release_locks called on a holder without a body");
            return Vec::new();
        };
        let txn_id = txn.id;

        let mut unblocked = Vec::new();
        if self.counter_checks_enabled {
            self.advance_counters_for_remaster(holder, &mut unblocked);
        }

        for (key, _) in holder.keys_in_partition() {
            let mut should_remove_queue = false;
            if let Some(queue) = self.lock_table.get_mut(key) {
                let before = queue.granted_ids();
                queue.remove(txn_id);
                let after = queue.granted_ids();
                should_remove_queue = queue.requests.is_empty();

                for granted_id in after {
                    if before.contains(&granted_id) {
                        continue;
                    }
                    let Some(progress) = self.txn_progress.get_mut(&granted_id) else {
                        // Tombstone: the waiter was erased (aborted) after queueing.
                        continue;
                    };
                    progress.waiting_locks = progress.waiting_locks.saturating_sub(1);
                    if progress.is_ready() {
                        unblocked.push(granted_id);
                    }
                }
            }
            if should_remove_queue {
                let _ = self.lock_table.remove(key);
            }
        }

        let _ = self.txn_progress.remove(&txn_id);
        unblocked
    }

    /// Statistics document merged into the scheduler's stats reply.
    #[must_use]
    pub fn stats(&self, level: u32) -> serde_json::Value {
        let mut stats = json!({
            "num_keys_in_lock_table": self.lock_table.len(),
            "lock_table_size_limit": LOCK_TABLE_SIZE_LIMIT,
            "num_txns_waiting_for_lock": self
                .txn_progress
                .values()
                .filter(|progress| progress.waiting_locks > 0)
                .count(),
        });
        if level >= 1 {
            let mut waiting = self
                .txn_progress
                .iter()
                .filter(|(_, progress)| progress.waiting_locks > 0)
                .map(|(txn_id, _)| *txn_id)
                .collect::<Vec<_>>();
            waiting.sort_unstable();
            stats["txns_waiting_for_lock"] = json!(waiting);
        }
        stats
    }

    /// Bumps key counters when a committed remaster releases, waking matching waiters.
    fn advance_counters_for_remaster(
        &mut self,
        holder: &TransactionHolder,
        unblocked: &mut Vec<TxnId>,
    ) {
        let Some(txn) = holder.txn() else {
            return;
        };
        if !matches!(txn.procedure, Procedure::Remaster { .. })
            || txn.status != TransactionStatus::Committed
        {
            return;
        }
        for key in txn.write_set.keys() {
            let Some(metadata) = txn.master_metadata.get(key) else {
                continue;
            };
            let new_counter = metadata.counter + 1;
            let _ = self.key_counters.insert(key.clone(), new_counter);

            let Some(waiters) = self.counter_waiters.get_mut(key) else {
                continue;
            };
            let mut remaining = Vec::new();
            for (waiter_id, expected) in waiters.drain(..) {
                if expected == new_counter {
                    let Some(progress) = self.txn_progress.get_mut(&waiter_id) else {
                        continue;
                    };
                    progress.counter_blocked = progress.counter_blocked.saturating_sub(1);
                    if progress.is_ready() {
                        unblocked.push(waiter_id);
                    }
                } else if expected > new_counter {
                    remaining.push((waiter_id, expected));
                } else {
                    warn!(
                        txn_id = waiter_id,
                        key = key.as_str(),
                        "counter waiter fell behind the key counter"
                    );
                }
            }
            *waiters = remaining;
        }
    }
}
