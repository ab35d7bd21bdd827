//! A follower pairs messages with their acknowledgements regardless of arrival order, and the
//! holding review drains the leftovers.

use std::collections::HashMap;

use fedchain_rs::types::data_types::{Address, ChainId, DbHeight, Minute, VmIndex};
use fedchain_rs::types::blocks::Entry;

mod common;

use crate::common::fixtures::{build_core, commit_chain_msg, LeaderSim};

#[test]
fn ack_then_msg_fills_the_slot() {
    let me = LeaderSim::new();
    let mut leader = LeaderSim::new();
    let mut tc = build_core(&me, &[&leader], &[], "LOCAL", HashMap::new());
    tc.seed_genesis();
    tc.boot();

    let entry = Entry::new(ChainId::new([3u8; 32]), b"first entry".to_vec());
    let commit = commit_chain_msg(&entry, 5, Address::new([9u8; 32]), tc.now);
    let ack = leader.ack(
        &commit,
        DbHeight::new(1),
        VmIndex::new(0),
        Minute::new(0),
        tc.now,
    );

    // The acknowledgement arrives first and waits for its payload.
    assert!(tc.deliver(&ack));
    assert!(tc
        .core
        .process_list(DbHeight::new(1))
        .unwrap()
        .get_slot(VmIndex::new(0), 0)
        .is_none());

    // The payload arrives and pairs immediately.
    assert!(tc.deliver(&commit));
    let slot = tc
        .core
        .process_list(DbHeight::new(1))
        .unwrap()
        .get_slot(VmIndex::new(0), 0)
        .cloned();
    let (paired_ack, paired_msg) = slot.expect("the slot should be filled");
    assert_eq!(paired_ack.message_hash, commit.msg_hash());
    assert_eq!(paired_msg.msg_hash(), commit.msg_hash());

    // The review prunes the now-sealed copy out of holding.
    tc.advance(400);
    tc.core.review_holding();
    assert!(tc.core.holding().is_empty());
}

#[test]
fn msg_then_ack_reorders_cleanly() {
    let me = LeaderSim::new();
    let mut leader = LeaderSim::new();
    let mut tc = build_core(&me, &[&leader], &[], "LOCAL", HashMap::new());
    tc.seed_genesis();
    tc.boot();

    let entry = Entry::new(ChainId::new([4u8; 32]), b"reordered entry".to_vec());
    let commit = commit_chain_msg(&entry, 5, Address::new([9u8; 32]), tc.now);

    // The payload arrives first and parks in holding.
    tc.deliver(&commit);
    assert!(tc.core.holding().contains(&commit.msg_hash()));
    assert!(tc
        .core
        .process_list(DbHeight::new(1))
        .unwrap()
        .get_slot(VmIndex::new(0), 0)
        .is_none());

    // The acknowledgement arrives and re-executes the held payload into its slot.
    let ack = leader.ack(
        &commit,
        DbHeight::new(1),
        VmIndex::new(0),
        Minute::new(0),
        tc.now,
    );
    tc.deliver(&ack);
    assert!(tc
        .core
        .process_list(DbHeight::new(1))
        .unwrap()
        .get_slot(VmIndex::new(0), 0)
        .is_some());

    tc.advance(400);
    tc.core.review_holding();
    assert!(tc.core.holding().is_empty());
}

#[test]
fn a_second_copy_of_a_paired_message_is_replay_rejected() {
    let me = LeaderSim::new();
    let mut leader = LeaderSim::new();
    let mut tc = build_core(&me, &[&leader], &[], "LOCAL", HashMap::new());
    tc.seed_genesis();
    tc.boot();

    let entry = Entry::new(ChainId::new([5u8; 32]), b"entry".to_vec());
    let commit = commit_chain_msg(&entry, 5, Address::new([9u8; 32]), tc.now);
    let ack = leader.ack(
        &commit,
        DbHeight::new(1),
        VmIndex::new(0),
        Minute::new(0),
        tc.now,
    );
    tc.deliver(&ack);
    assert!(tc.deliver(&commit));

    // The identical copy dies at the executor's replay gate.
    assert!(!tc.deliver(&commit));
}
