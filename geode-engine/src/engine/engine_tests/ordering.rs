use geode_common::config::RemasterProtocol;
use geode_common::ids::Channel;
use geode_core::message::Request;
use geode_core::txn::{TransactionStatus, TransactionType};
use geode_storage::Storage;
use googletest::prelude::*;
use rstest::rstest;

use super::testkit::{TestHarness, batch, batch_data, write_txn};

#[rstest]
fn single_home_txns_complete_and_leave_no_state_behind() {
    let harness = TestHarness::start(1, 1, 2, RemasterProtocol::None);

    // Three independent transactions in three consecutive batches of the local queue.
    for (position, txn_id) in [10_u64, 20, 30].into_iter().enumerate() {
        let payload = batch(
            100 + position as u64,
            TransactionType::SingleHome,
            vec![write_txn(txn_id, &[txn_id.to_string().as_str()], 0)],
        );
        harness.send(
            0,
            0,
            Channel::Interleaver,
            batch_data(payload, position as u32),
        );
        harness.send(
            0,
            0,
            Channel::Interleaver,
            Request::LocalQueueOrder {
                slot: position as u64,
                queue_id: 0,
            },
        );
    }

    let mut completed = Vec::new();
    for _ in 0..3 {
        let (txn, partition, involved) = harness.recv_completed_subtxn(0);
        assert_that!(txn.status, eq(TransactionStatus::Committed));
        assert_that!(partition, eq(0_u32));
        assert_that!(involved, eq(&vec![0_u32]));
        completed.push(txn.id);
    }
    completed.sort_unstable();
    assert_that!(completed, eq(&vec![10_u64, 20, 30]));

    harness.assert_no_tracked_txns(0);
}

#[rstest]
fn out_of_order_batch_arrival_still_completes_in_slot_order() {
    let harness = TestHarness::start(1, 1, 1, RemasterProtocol::None);

    // All three transactions write the same key, so completion order mirrors log order.
    let payloads = [
        (0_u32, 100_u64, 10_u64),
        (1, 101, 20),
        (2, 102, 30),
    ];
    // Batch bodies arrive as positions 2, 0, 1.
    for index in [2_usize, 0, 1] {
        let (position, batch_id, txn_id) = payloads[index];
        harness.send(
            0,
            0,
            Channel::Interleaver,
            batch_data(
                batch(
                    batch_id,
                    TransactionType::SingleHome,
                    vec![write_txn(txn_id, &["0"], 0)],
                ),
                position,
            ),
        );
    }
    for slot in 0..3_u64 {
        harness.send(
            0,
            0,
            Channel::Interleaver,
            Request::LocalQueueOrder { slot, queue_id: 0 },
        );
    }

    for expected in [10_u64, 20, 30] {
        let (txn, _, _) = harness.recv_completed_subtxn(0);
        assert_that!(txn.id, eq(expected));
    }
    harness.assert_no_tracked_txns(0);
}

#[rstest]
fn conflicting_txns_cascade_through_lock_release() {
    let harness = TestHarness::start(1, 1, 2, RemasterProtocol::None);

    // T1, T2, T3 all request the write lock on key K; grants must cascade in order.
    for (position, txn_id) in [1_u64, 2, 3].into_iter().enumerate() {
        harness.send(
            0,
            0,
            Channel::Interleaver,
            batch_data(
                batch(
                    200 + position as u64,
                    TransactionType::SingleHome,
                    vec![write_txn(txn_id, &["0"], 0)],
                ),
                position as u32,
            ),
        );
        harness.send(
            0,
            0,
            Channel::Interleaver,
            Request::LocalQueueOrder {
                slot: position as u64,
                queue_id: 0,
            },
        );
    }

    for expected in [1_u64, 2, 3] {
        let (txn, _, _) = harness.recv_completed_subtxn(0);
        assert_that!(txn.id, eq(expected));
        assert_that!(txn.status, eq(TransactionStatus::Committed));
    }

    // The last writer's value wins in storage.
    let record = harness.storages[0]
        .read("0")
        .expect("key must exist after the cascade");
    assert_that!(record.value.as_str(), eq("value-3"));
    harness.assert_no_tracked_txns(0);
}

#[rstest]
fn duplicate_queue_orders_do_not_duplicate_completions() {
    let harness = TestHarness::start(1, 1, 1, RemasterProtocol::None);

    harness.send(
        0,
        0,
        Channel::Interleaver,
        batch_data(
            batch(
                300,
                TransactionType::SingleHome,
                vec![write_txn(5, &["0"], 0)],
            ),
            0,
        ),
    );
    for _ in 0..2 {
        harness.send(
            0,
            0,
            Channel::Interleaver,
            Request::LocalQueueOrder { slot: 0, queue_id: 0 },
        );
    }

    let (txn, _, _) = harness.recv_completed_subtxn(0);
    assert_that!(txn.id, eq(5_u64));
    harness.assert_no_tracked_txns(0);
}
