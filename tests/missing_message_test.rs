//! Gap-fill round trip: a node holding a slot replies to a missing-message request, and the
//! requester installs the response.

use std::collections::HashMap;

use fedchain_rs::messages::{DataObject, DataResponse, Message, MissingMsg, Payload};
use fedchain_rs::types::blocks::Entry;
use fedchain_rs::types::data_types::{Address, ChainId, DbHeight, ListHeight, Minute, VmIndex};

mod common;

use crate::common::fixtures::{build_core, commit_chain_msg, LeaderSim};

#[test]
fn a_held_slot_is_served_and_installed_remotely() {
    let asker = LeaderSim::new();
    let me = LeaderSim::new();
    let mut leader = LeaderSim::new();

    // Node A holds a filled slot.
    let mut a = build_core(&me, &[&leader], &[], "LOCAL", HashMap::new());
    a.seed_genesis();
    a.boot();

    let entry = Entry::new(ChainId::new([9u8; 32]), b"slot content".to_vec());
    let commit = commit_chain_msg(&entry, 5, Address::new([1u8; 32]), a.now);
    let ack = leader.ack(
        &commit,
        DbHeight::new(1),
        VmIndex::new(0),
        Minute::new(0),
        a.now,
    );
    a.deliver(&ack);
    a.deliver(&commit);

    // A peer asks for slot 0 of VM 0.
    let request = Message::new(
        Payload::MissingMsg(MissingMsg {
            asker: asker.id,
            db_height: DbHeight::new(1),
            vm_index: VmIndex::new(0),
            system_height: 0,
            process_list_heights: vec![ListHeight::new(0)],
        }),
        a.now,
    );
    a.deliver(&request);

    let sends = a.network.sends();
    assert_eq!(sends.len(), 1);
    let (recipient, response) = &sends[0];
    assert_eq!(*recipient, asker.id);
    assert!(response.is_peer_to_peer());
    let mmr = match &response.payload {
        Payload::MissingMsgResponse(mmr) => mmr.clone(),
        other => panic!("expected a missing-message response, got {}", other.kind()),
    };
    assert_eq!(
        mmr.ack_response.as_ref().unwrap().message_hash,
        commit.msg_hash()
    );

    // Node B, which saw neither component, installs both through its review queue.
    let other = LeaderSim::new();
    let mut b = build_core(&other, &[&leader], &[], "LOCAL", HashMap::new());
    b.seed_genesis();
    b.boot();

    b.deliver(response);
    assert_eq!(b.core.review_queue_len(), 2);
    b.core.process();
    assert!(b
        .core
        .process_list(DbHeight::new(1))
        .unwrap()
        .get_slot(VmIndex::new(0), 0)
        .is_some());
}

#[test]
fn requests_for_unknown_slots_are_counted_and_ignored() {
    let asker = LeaderSim::new();
    let me = LeaderSim::new();
    let leader = LeaderSim::new();
    let mut tc = build_core(&me, &[&leader], &[], "LOCAL", HashMap::new());
    tc.seed_genesis();
    tc.boot();

    let request = Message::new(
        Payload::MissingMsg(MissingMsg {
            asker: asker.id,
            db_height: DbHeight::new(1),
            vm_index: VmIndex::new(0),
            system_height: 0,
            process_list_heights: vec![ListHeight::new(4)],
        }),
        tc.now,
    );
    tc.deliver(&request);

    assert!(tc.network.sends().is_empty());
    assert_eq!(tc.core.counters.missing_request_ignore_cnt, 1);
}

#[test]
fn an_entry_data_response_flows_to_the_write_queue() {
    let me = LeaderSim::new();
    let leader = LeaderSim::new();
    let mut tc = build_core(&me, &[&leader], &[], "LOCAL", HashMap::new());
    tc.seed_genesis();
    tc.boot();

    let entry = Entry::new(ChainId::new([10u8; 32]), b"recovered entry".to_vec());
    let response = Message::new(
        Payload::DataResponse(DataResponse {
            data_object: DataObject::Entry(entry.clone()),
        }),
        tc.now,
    );
    tc.deliver(&response);

    let written = tc.entries_rx.try_recv().expect("the entry reaches the write queue");
    assert_eq!(written.hash(), entry.hash());
}
