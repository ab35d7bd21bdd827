//! Commit→reveal pairing on the leader path: highest credits win, a reveal consumes its commit,
//! and a commit arriving after the reveal is rejected outright.

use std::collections::HashMap;

use fedchain_rs::messages::Payload;
use fedchain_rs::types::blocks::Entry;
use fedchain_rs::types::data_types::{Address, ChainId, DbHeight};

mod common;

use crate::common::fixtures::{build_core, commit_chain_msg, reveal_msg, LeaderSim};

/// A single-server network where this node is the one federated leader.
fn leader_core() -> (LeaderSim, common::fixtures::TestCore) {
    let me = LeaderSim::new();
    let tc = build_core(&me, &[&me], &[], "LOCAL", HashMap::new());
    (me, tc)
}

#[test]
fn reveal_consumes_the_commit_and_seals_the_window() {
    let (_me, mut tc) = leader_core();
    tc.seed_genesis();
    tc.boot();
    // The bootstrap DBSig wave must finish before the leader accepts work.
    tc.run_update(4);
    assert!(!tc.core.is_saving());

    let payer = Address::new([2u8; 32]);
    tc.core.put_ec_balance(false, payer, 100);

    let entry = Entry::new(ChainId::new([6u8; 32]), b"a chain head".to_vec());

    // C1 pays 10 credits for the entry.
    let c1 = commit_chain_msg(&entry, 10, payer, tc.now);
    assert!(tc.deliver(&c1));
    tc.run_update(3);
    assert!(tc.core.next_commit(&entry.hash()).is_some());
    assert_eq!(tc.core.ec_balance(false, &payer), 90);

    // The reveal pairs under C1 and consumes it.
    let reveal = reveal_msg(&entry, false, tc.now);
    assert!(tc.deliver(&reveal));
    assert!(tc.core.next_commit(&entry.hash()).is_none());
    tc.run_update(3);
    let pl = tc.core.process_list(DbHeight::new(1)).unwrap();
    assert_eq!(pl.new_eblocks.len(), 1);
    assert!(pl.new_entries.contains_key(&entry.hash()));

    // C2 arrives after the reveal was accepted: the pairing is spent, so it is rejected and its
    // invalidity broadcast exactly once.
    let c2 = commit_chain_msg(&entry, 20, payer, tc.now);
    assert!(!tc.deliver(&c2));
    assert!(tc.core.next_commit(&entry.hash()).is_none());
    assert!(tc.invalid_rx.try_recv().is_some());
    assert!(tc.invalid_rx.try_recv().is_none());
}

#[test]
fn without_a_reveal_the_highest_commit_wins() {
    let (_me, mut tc) = leader_core();
    tc.seed_genesis();
    tc.boot();
    tc.run_update(4);

    let payer = Address::new([2u8; 32]);
    tc.core.put_ec_balance(false, payer, 100);

    let entry = Entry::new(ChainId::new([7u8; 32]), b"never revealed".to_vec());

    let low = commit_chain_msg(&entry, 10, payer, tc.now);
    assert!(tc.deliver(&low));
    tc.run_update(3);

    let high = commit_chain_msg(&entry, 20, payer, tc.now);
    assert!(tc.deliver(&high));
    tc.run_update(3);

    let stored = tc.core.next_commit(&entry.hash()).expect("a commit is registered");
    match &stored.payload {
        Payload::CommitChain(cc) => assert_eq!(cc.credits.int(), 20),
        other => panic!("expected a chain commit, got {}", other.kind()),
    }
}

#[test]
fn an_unfunded_commit_stalls_its_virtual_server() {
    let (_me, mut tc) = leader_core();
    tc.seed_genesis();
    tc.boot();
    tc.run_update(4);

    // No entry credits anywhere: the commit acknowledges into the list but cannot process.
    let entry = Entry::new(ChainId::new([8u8; 32]), b"unfunded".to_vec());
    let commit = commit_chain_msg(&entry, 10, Address::new([3u8; 32]), tc.now);
    assert!(tc.deliver(&commit));
    tc.run_update(3);

    assert!(tc.core.next_commit(&entry.hash()).is_none());
    let pl = tc.core.process_list(DbHeight::new(1)).unwrap();
    let vm = &pl.vms[0];
    // Slot 0 is the block-opening DBSig; the commit occupies slot 1, unprocessed.
    assert_eq!(vm.list.len(), 2);
    assert_eq!(vm.height, 1);
}
