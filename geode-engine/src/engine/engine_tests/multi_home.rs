use geode_common::config::RemasterProtocol;
use geode_common::ids::Channel;
use geode_core::message::Request;
use geode_core::txn::{TransactionStatus, TransactionType};
use geode_storage::Storage;
use googletest::prelude::*;
use rstest::rstest;

use super::testkit::{TestHarness, batch, batch_data, batch_order, lock_only_shard, write_txn};

#[rstest]
fn multi_home_txn_completes_after_both_lock_only_shards() {
    // Two regions, one partition; the harness plays region one's sequencer and the
    // multi-home orderer.
    let harness = TestHarness::start(2, 1, 1, RemasterProtocol::None);

    let mut parent = write_txn(100, &["a", "b"], 0);
    parent.txn_type = TransactionType::MultiHome;
    let Some(metadata) = parent.master_metadata.get_mut("b") else {
        panic!("metadata for key b must exist");
    };
    metadata.master = 1;
    let shard_home_zero = lock_only_shard(&parent, 0);
    let shard_home_one = lock_only_shard(&parent, 1);

    // The pre-ordered multi-home batch arrives first; it cannot dispatch yet.
    harness.send(
        1,
        0,
        Channel::Interleaver,
        batch_data(batch(100, TransactionType::MultiHome, vec![parent]), 0),
    );

    // Home zero's shard travels in the local region's single-home stream.
    harness.send(
        0,
        0,
        Channel::Interleaver,
        batch_data(
            batch(500, TransactionType::SingleHome, vec![shard_home_zero]),
            0,
        ),
    );
    harness.send(
        0,
        0,
        Channel::Interleaver,
        Request::LocalQueueOrder { slot: 0, queue_id: 0 },
    );

    // Home one's shard is replicated from region one with its own slot order.
    harness.send(
        1,
        0,
        Channel::Interleaver,
        batch_data(
            batch(600, TransactionType::SingleHome, vec![shard_home_one]),
            0,
        ),
    );
    harness.send(1, 0, Channel::Interleaver, batch_order(600, 0));

    let (txn, partition, involved) = harness.recv_completed_subtxn(0);
    assert_that!(txn.id, eq(100_u64));
    assert_that!(txn.status, eq(TransactionStatus::Committed));
    assert_that!(partition, eq(0_u32));
    assert_that!(involved, eq(&vec![0_u32]));

    // Both keys were written on the only partition, and no shard state lingers.
    for key in ["a", "b"] {
        let record = harness.storages[0]
            .read(key)
            .expect("multi-home write must be applied");
        assert_that!(record.value.as_str(), eq("value-100"));
    }
    harness.assert_no_tracked_txns(0);
}
