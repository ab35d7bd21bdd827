//! Minute closure across three federated VMs, and block closure at minute ten, observed from a
//! follower.

use std::collections::HashMap;

use fedchain_rs::types::blocks::EcRecord;
use fedchain_rs::types::data_types::{DbHeight, Minute, VmIndex};

mod common;

use crate::common::fixtures::{build_core, LeaderSim, TestCore};

/// Deliver the end-of-minute marker of `fed` for `vm_index`, ack first.
fn deliver_eom(tc: &mut TestCore, fed: &mut LeaderSim, vm_index: u8, minute: u8) {
    let eom = fed.eom(
        DbHeight::new(1),
        VmIndex::new(vm_index),
        Minute::new(minute),
        tc.now,
    );
    let ack = fed.ack(
        &eom,
        DbHeight::new(1),
        VmIndex::new(vm_index),
        Minute::new(minute),
        tc.now,
    );
    tc.deliver(&ack);
    tc.deliver(&eom);
}

#[test]
fn a_minute_closes_only_when_every_vm_synced() {
    let me = LeaderSim::new();
    let mut feds = [LeaderSim::new(), LeaderSim::new(), LeaderSim::new()];
    let mut tc = {
        let fed_refs: Vec<&LeaderSim> = feds.iter().collect();
        build_core(&me, &fed_refs, &[], "LOCAL", HashMap::new())
    };
    tc.seed_genesis();
    tc.boot();

    // VM 0's marker opens the wave and counts itself; nothing closes yet.
    deliver_eom(&mut tc, &mut feds[0], 0, 0);
    tc.run_update(4);
    assert!(tc.core.eom_in_progress());
    assert_eq!(tc.core.eom_processed(), 1);
    assert!(!tc.core.eom_done());
    assert_eq!(tc.core.current_minute(), 0);

    // VM 1 joins; still two of three.
    deliver_eom(&mut tc, &mut feds[1], 1, 0);
    tc.run_update(4);
    assert_eq!(tc.core.eom_processed(), 2);
    assert_eq!(tc.core.current_minute(), 0);

    // VM 2 completes the wave: the minute closes and the markers unwind.
    deliver_eom(&mut tc, &mut feds[2], 2, 0);
    tc.run_update(8);
    assert_eq!(tc.core.current_minute(), 1);
    assert!(!tc.core.eom_in_progress());
    assert_eq!(tc.core.eom_processed(), 0);

    // The entry credit block gained the one-based minute marker.
    let pl = tc.core.process_list(DbHeight::new(1)).unwrap();
    assert!(pl
        .entry_credit_block
        .body
        .iter()
        .any(|record| matches!(record, EcRecord::MinuteNumber(1))));
}

#[test]
fn minute_ten_closes_the_block() {
    let me = LeaderSim::new();
    let mut feds = [LeaderSim::new(), LeaderSim::new(), LeaderSim::new()];
    let mut tc = {
        let fed_refs: Vec<&LeaderSim> = feds.iter().collect();
        build_core(&me, &fed_refs, &[], "LOCAL", HashMap::new())
    };
    tc.seed_genesis();
    tc.boot();

    for minute in 0u8..10 {
        for vm_index in 0u8..3 {
            deliver_eom(&mut tc, &mut feds[vm_index as usize], vm_index, minute);
        }
        tc.run_update(10);
        tc.advance(1_000);
    }

    // The block closed: minute counter wrapped, leader height advanced, and the finalized block
    // sits locked in the ledger awaiting its save.
    assert_eq!(tc.core.current_minute(), 0);
    assert_eq!(tc.core.leader_height(), DbHeight::new(2));
    let closed = tc.core.db_state(DbHeight::new(1)).expect("block 1 finalized");
    assert!(closed.locked);
    assert!(tc.core.is_saving());

    // All ten one-based minute markers made it into the entry credit block.
    let markers: Vec<u8> = closed
        .entry_credit_block
        .body
        .iter()
        .filter_map(|record| match record {
            EcRecord::MinuteNumber(m) => Some(*m),
            _ => None,
        })
        .collect();
    assert_eq!(markers, (1u8..=10).collect::<Vec<u8>>());
}
