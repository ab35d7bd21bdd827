//! Full-server-fault completion: enough federated signatures plus the audit pledge swap the
//! faulted leader for the nominated audit server.

use std::collections::HashMap;

use fedchain_rs::messages::{FaultSignature, FullServerFault, Message, Payload, ServerFault};
use fedchain_rs::types::authority::ServerClass;
use fedchain_rs::types::crypto_primitives::contexts;
use fedchain_rs::types::data_types::{
    DbHeight, ListHeight, SignatureBytes, Timestamp, VmIndex,
};

mod common;

use crate::common::fixtures::{build_core, LeaderSim, TestCore};

fn full_fault(
    faulted: &LeaderSim,
    nominated: &LeaderSim,
    signers: &[&LeaderSim],
    vm_index: u8,
    system_height: u32,
    clear_fault: bool,
    now: Timestamp,
) -> Message {
    let fault = ServerFault {
        server_id: faulted.id,
        audit_server_id: nominated.id,
        vm_index: VmIndex::new(vm_index),
        db_height: DbHeight::new(1),
        height: ListHeight::new(0),
        system_height,
        timestamp: now,
        signature: SignatureBytes::zero(),
    };
    let core_hash = fault.core_hash().bytes();
    let mut ff = FullServerFault::new(fault);
    ff.clear_fault = clear_fault;
    for signer in signers {
        ff.signature_list.push(FaultSignature {
            key: signer.keypair.public().to_bytes(),
            signature: signer.keypair.sign(contexts::SERVER_FAULT, &core_hash),
        });
    }
    Message::new(Payload::FullServerFault(ff), now)
}

fn three_fed_core() -> ([LeaderSim; 3], LeaderSim, LeaderSim, TestCore) {
    let me = LeaderSim::new();
    let feds = [LeaderSim::new(), LeaderSim::new(), LeaderSim::new()];
    let audit = LeaderSim::new();
    let mut tc = {
        let fed_refs: Vec<&LeaderSim> = feds.iter().collect();
        build_core(&me, &fed_refs, &[&audit], "LOCAL", HashMap::new())
    };
    tc.seed_genesis();
    tc.boot();
    (feds, audit, me, tc)
}

#[test]
fn a_complete_fault_swaps_fed_for_audit() {
    let (feds, audit, _me, mut tc) = three_fed_core();
    let faulted = &feds[1];

    // Votes from the two live federated servers, plus the nominated audit server's pledge.
    let fault_msg = full_fault(
        faulted,
        &audit,
        &[&feds[0], &feds[2], &audit],
        1,
        0,
        false,
        tc.now,
    );
    assert!(tc.deliver(&fault_msg));

    // First pass tallies the votes; second pass executes the swap.
    tc.run_update(3);

    let pl = tc.core.process_list(DbHeight::new(1)).unwrap();
    assert_eq!(pl.fed_servers[1].id, audit.id);
    assert!(pl.fed_servers[1].online);
    let demoted = pl
        .audit_servers
        .iter()
        .find(|s| s.id == faulted.id)
        .expect("the faulted server joins the audit pool");
    assert!(!demoted.online);
    assert!(!pl.audit_servers.iter().any(|s| s.id == audit.id));
    assert_eq!(pl.system.height, 1);

    // The authority classes follow the seats, and the action is stamped.
    assert_eq!(
        tc.core.authority_set().server_class(&audit.id),
        Some(ServerClass::Federated)
    );
    assert_eq!(
        tc.core.authority_set().server_class(&faulted.id),
        Some(ServerClass::Audit)
    );
    assert!(tc.core.last_fault_action() > 0);
}

#[test]
fn a_fault_without_the_audit_pledge_only_tallies() {
    let (feds, audit, _me, mut tc) = three_fed_core();
    let faulted = &feds[1];

    // Quorum of federated votes, but the nominated audit server never pledged.
    let fault_msg = full_fault(faulted, &audit, &[&feds[0], &feds[2]], 1, 0, false, tc.now);
    tc.deliver(&fault_msg);
    tc.run_update(4);

    let pl = tc.core.process_list(DbHeight::new(1)).unwrap();
    assert_eq!(pl.fed_servers[1].id, faulted.id);
    assert_eq!(pl.system.height, 0);
}

#[test]
fn a_clear_fault_is_processed_without_promotion() {
    let (feds, audit, _me, mut tc) = three_fed_core();
    let faulted = &feds[1];

    let fault_msg = full_fault(
        faulted,
        &audit,
        &[&feds[0], &feds[2], &audit],
        1,
        0,
        true,
        tc.now,
    );
    tc.deliver(&fault_msg);
    tc.run_update(3);

    // The fault is consumed, but nobody moved seats.
    let pl = tc.core.process_list(DbHeight::new(1)).unwrap();
    assert_eq!(pl.system.height, 1);
    assert_eq!(pl.fed_servers[1].id, faulted.id);
    assert!(pl.audit_servers.iter().any(|s| s.id == audit.id));
}
