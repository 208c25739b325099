use geode_common::config::RemasterProtocol;
use geode_common::ids::Channel;
use geode_core::message::Request;
use geode_core::txn::{Procedure, TransactionStatus, TransactionType};
use geode_storage::Storage;
use googletest::prelude::*;
use rstest::rstest;

use super::testkit::{TestHarness, batch, batch_data, seed, write_txn};

#[rstest]
fn trivial_remaster_aborts_before_dispatch() {
    let harness = TestHarness::start(2, 1, 1, RemasterProtocol::PerKey);
    seed(&harness.storages[0], "k", "v", 1, 0);

    // The key is already mastered by region one; the directive changes nothing.
    let mut txn = write_txn(7, &["k"], 1);
    txn.procedure = Procedure::Remaster { new_master: 1 };
    harness.send(
        0,
        0,
        Channel::Interleaver,
        batch_data(batch(100, TransactionType::SingleHome, vec![txn]), 0),
    );
    harness.send(
        0,
        0,
        Channel::Interleaver,
        Request::LocalQueueOrder { slot: 0, queue_id: 0 },
    );

    let (completed, _, _) = harness.recv_completed_subtxn(0);
    assert_that!(completed.id, eq(7_u64));
    assert_that!(completed.status, eq(TransactionStatus::Aborted));

    // The record is untouched.
    let record = harness.storages[0].read("k").expect("key must remain");
    assert_that!(record.metadata.master, eq(1_u32));
    assert_that!(record.metadata.counter, eq(0_u32));
    harness.assert_no_tracked_txns(0);
}

#[rstest]
fn effective_remaster_commits_and_bumps_the_counter() {
    let harness = TestHarness::start(2, 1, 1, RemasterProtocol::PerKey);
    seed(&harness.storages[0], "k", "v", 0, 0);

    let mut txn = write_txn(8, &["k"], 0);
    txn.procedure = Procedure::Remaster { new_master: 1 };
    harness.send(
        0,
        0,
        Channel::Interleaver,
        batch_data(batch(100, TransactionType::SingleHome, vec![txn]), 0),
    );
    harness.send(
        0,
        0,
        Channel::Interleaver,
        Request::LocalQueueOrder { slot: 0, queue_id: 0 },
    );

    let (completed, _, _) = harness.recv_completed_subtxn(0);
    assert_that!(completed.status, eq(TransactionStatus::Committed));

    let record = harness.storages[0].read("k").expect("key must remain");
    assert_that!(record.metadata.master, eq(1_u32));
    assert_that!(record.metadata.counter, eq(1_u32));
    assert_that!(record.value.as_str(), eq("v"));
    harness.assert_no_tracked_txns(0);
}

#[rstest]
fn distributed_abort_finalizes_on_both_partitions() {
    // One region, two partitions; key "0" lives on partition 0, key "1" on partition 1.
    let harness = TestHarness::start(1, 2, 1, RemasterProtocol::PerKey);
    // Partition 0's copy of "0" has been remastered past the transaction's metadata.
    seed(&harness.storages[0], "0", "v", 0, 5);
    seed(&harness.storages[1], "1", "v", 0, 0);

    let txn = write_txn(77, &["0", "1"], 0);

    // Partition 0 sees the transaction first and aborts it at the remaster check.
    harness.send(
        0,
        0,
        Channel::Interleaver,
        batch_data(
            batch(700, TransactionType::SingleHome, vec![txn.clone()]),
            0,
        ),
    );
    harness.send(
        0,
        0,
        Channel::Interleaver,
        Request::LocalQueueOrder { slot: 0, queue_id: 0 },
    );

    let (completed, partition, _) = harness.recv_completed_subtxn(0);
    assert_that!(completed.id, eq(77_u64));
    assert_that!(completed.status, eq(TransactionStatus::Aborted));
    assert_that!(partition, eq(0_u32));

    // Partition 1 received the abort notice before the transaction; delivering the
    // transaction now runs the deferred abort to completion.
    harness.send(
        1,
        1,
        Channel::Interleaver,
        batch_data(batch(700, TransactionType::SingleHome, vec![txn]), 0),
    );
    harness.send(
        1,
        1,
        Channel::Interleaver,
        Request::LocalQueueOrder { slot: 0, queue_id: 0 },
    );

    let (completed, partition, _) = harness.recv_completed_subtxn(0);
    assert_that!(completed.id, eq(77_u64));
    assert_that!(completed.status, eq(TransactionStatus::Aborted));
    assert_that!(partition, eq(1_u32));

    // Neither partition keeps holder state once the aborts exchange their notices.
    harness.assert_no_tracked_txns(0);
    harness.assert_no_tracked_txns(1);
}
