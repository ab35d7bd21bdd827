//! A block contradicting a checkpoint is fatal on the main network.

use std::collections::HashMap;

use fedchain_rs::types::blocks::{AdminBlock, DirectoryBlock, EntryCreditBlock, FactoidBlock};
use fedchain_rs::types::data_types::{DbHeight, Timestamp};

mod common;

use crate::common::fixtures::{build_core, LeaderSim};

#[test]
#[should_panic(expected = "didn't match a checkpoint")]
fn a_checkpoint_mismatch_refuses_to_proceed() {
    let me = LeaderSim::new();
    let leader = LeaderSim::new();
    let mut checkpoints = HashMap::new();
    checkpoints.insert(10u32, "abcd".to_string());
    let mut tc = build_core(&me, &[&leader], &[], "MAIN", checkpoints);

    let height = DbHeight::new(10);
    tc.core.add_db_state(
        true,
        DirectoryBlock::new(height, Timestamp::new(1_000)),
        AdminBlock::new(height),
        FactoidBlock::new(height),
        EntryCreditBlock::new(height),
        vec![],
        vec![],
    );
}

#[test]
fn checkpoints_are_not_enforced_off_the_main_network() {
    let me = LeaderSim::new();
    let leader = LeaderSim::new();
    let mut checkpoints = HashMap::new();
    checkpoints.insert(10u32, "abcd".to_string());
    let mut tc = build_core(&me, &[&leader], &[], "LOCAL", checkpoints);

    let height = DbHeight::new(10);
    assert!(tc.core.add_db_state(
        true,
        DirectoryBlock::new(height, Timestamp::new(1_000)),
        AdminBlock::new(height),
        FactoidBlock::new(height),
        EntryCreditBlock::new(height),
        vec![],
        vec![],
    ));
}
