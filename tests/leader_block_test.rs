//! A single-server leader drives a full block: ten local end-of-minute markers close it, and the
//! fresh block opens with this node's directory block signature.

use std::collections::HashMap;

use fedchain_rs::messages::{EndOfMinute, Message, Payload};
use fedchain_rs::types::data_types::{
    DbHeight, Minute, ServerId, SignatureBytes, Timestamp, VmIndex,
};

mod common;

use crate::common::fixtures::{build_core, LeaderSim};

/// A blank local marker; the leader path stamps every field before signing.
fn local_eom(now: Timestamp) -> Message {
    let mut msg = Message::new(
        Payload::EndOfMinute(EndOfMinute {
            db_height: DbHeight::new(0),
            vm_index: VmIndex::new(0),
            minute: Minute::new(0),
            server_id: ServerId::zero(),
            sys_height: 0,
            sys_hash: None,
            timestamp: now,
            signature: SignatureBytes::zero(),
        }),
        now,
    );
    msg.set_local(true);
    msg
}

#[test]
fn ten_minutes_close_the_block_and_open_the_next_with_a_dbsig() {
    let me = LeaderSim::new();
    let mut tc = build_core(&me, &[&me], &[], "LOCAL", HashMap::new());
    tc.seed_genesis();
    tc.boot();
    // Let the bootstrap signature wave finish.
    tc.run_update(4);
    assert!(!tc.core.is_saving());
    assert!(tc.core.is_leader());

    for _minute in 0u8..10 {
        tc.advance(60_000);
        let eom = local_eom(tc.now);
        tc.deliver(&eom);
        tc.run_update(8);
    }

    // The block closed and the next one opened under our signature; the signature wave for the
    // new block has already run to completion.
    assert_eq!(tc.core.current_minute(), 0);
    assert_eq!(tc.core.leader_height(), DbHeight::new(2));
    assert!(tc.core.dbsig_done());
    assert!(tc.core.db_state(DbHeight::new(1)).is_some());
    assert!(tc
        .core
        .process_list(DbHeight::new(2))
        .unwrap()
        .dbsig_already_sent);

    // The new block's signature was broadcast exactly once for height 2.
    let dbsigs_for_2: Vec<Message> = tc
        .network
        .broadcasts()
        .into_iter()
        .filter(|msg| match &msg.payload {
            Payload::DirectoryBlockSignature(dbs) => dbs.db_height == DbHeight::new(2),
            _ => false,
        })
        .collect();
    assert_eq!(dbsigs_for_2.len(), 1);
}
