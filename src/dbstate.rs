/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The append-only ledger of completed block snapshots.
//!
//! A [`DBState`] is the immutable record of one finalized directory block and its component
//! blocks. Its flags advance strictly: `is_new → ready_to_save → locked → signed → saved`; the
//! minute machine reads them to decide when a block may be persisted and when the previous block
//! is settled enough to build on.
//!
//! The ledger also owns the checkpoint table. A block arriving at a checkpointed height with the
//! wrong key Merkle root is fatal: the node refuses to run on a fork of the canonical chain.

use std::collections::{BTreeMap, HashMap};

use crate::{
    messages::BlockSnapshot,
    types::{
        blocks::{AdminBlock, DirectoryBlock, EBlock, Entry, EntryCreditBlock, FactoidBlock},
        data_types::{Address, DbHeight},
    },
};

/// Snapshot of the mutable state a block's application changed, kept so a reorg can roll the
/// temporary state back before re-applying.
#[derive(Clone, Debug, Default)]
pub struct SaveState {
    pub factoid_balances: HashMap<Address, i64>,
    pub ec_balances: HashMap<Address, i64>,
}

/// One finalized block: the directory block, every component block it commits to, and the save
/// lifecycle flags.
pub struct DBState {
    pub directory_block: DirectoryBlock,
    pub admin_block: AdminBlock,
    pub factoid_block: FactoidBlock,
    pub entry_credit_block: EntryCreditBlock,
    pub eblocks: Vec<EBlock>,
    pub entries: Vec<Entry>,

    pub is_new: bool,
    pub ready_to_save: bool,
    pub locked: bool,
    pub signed: bool,
    pub saved: bool,

    pub save_state: Option<SaveState>,
}

impl DBState {
    pub fn db_height(&self) -> DbHeight {
        self.directory_block.db_height()
    }
}

/// Full hex encoding of a key Merkle root, the form checkpoints are written in.
pub fn key_mr_string(block: &DirectoryBlock) -> String {
    block
        .key_mr()
        .bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// The ledger: completed snapshots indexed by height, plus catch-up bookkeeping.
pub struct DBStateLedger {
    states: BTreeMap<DbHeight, DBState>,
    checkpoints: HashMap<u32, String>,
    /// Lowest height of the batch most recently requested from peers.
    pub last_begin: i64,
    /// Height just past the end of the most recent request.
    pub last_end: i64,
}

impl DBStateLedger {
    pub fn new(checkpoints: HashMap<u32, String>) -> Self {
        Self {
            states: BTreeMap::new(),
            checkpoints,
            last_begin: 0,
            last_end: 0,
        }
    }

    pub fn get(&self, db_height: DbHeight) -> Option<&DBState> {
        self.states.get(&db_height)
    }

    pub fn get_mut(&mut self, db_height: DbHeight) -> Option<&mut DBState> {
        self.states.get_mut(&db_height)
    }

    pub fn last(&self) -> Option<&DBState> {
        self.states.values().next_back()
    }

    /// The highest height whose snapshot is saved. Zero when nothing is saved yet.
    pub fn highest_saved(&self) -> DbHeight {
        self.states
            .iter()
            .rev()
            .find(|(_, s)| s.saved)
            .map(|(h, _)| *h)
            .unwrap_or(DbHeight::new(0))
    }

    /// The highest height whose snapshot is at least locked. Zero when there is none.
    pub fn highest_completed(&self) -> DbHeight {
        self.states
            .iter()
            .rev()
            .find(|(_, s)| s.saved || s.locked)
            .map(|(h, _)| *h)
            .unwrap_or(DbHeight::new(0))
    }

    /// Verify `key_mr` against the checkpoint table. An entry at this height with a different
    /// root is an error the caller treats as fatal.
    pub fn check_checkpoint(&self, db_height: DbHeight, key_mr: &str) -> Result<(), String> {
        if let Some(expected) = self.checkpoints.get(&db_height.int()) {
            if expected != key_mr {
                return Err(format!(
                    "Found block at height {} that didn't match a checkpoint. Got {}, expected {}",
                    db_height, key_mr, expected
                ));
            }
        }
        Ok(())
    }

    /// Record a new snapshot. Returns `None` if a snapshot already saved at this height would be
    /// displaced; an unsaved snapshot is replaced.
    #[allow(clippy::too_many_arguments)]
    pub fn new_db_state(
        &mut self,
        is_new: bool,
        directory_block: DirectoryBlock,
        admin_block: AdminBlock,
        factoid_block: FactoidBlock,
        entry_credit_block: EntryCreditBlock,
        eblocks: Vec<EBlock>,
        entries: Vec<Entry>,
    ) -> Option<&mut DBState> {
        let db_height = directory_block.db_height();
        if let Some(existing) = self.states.get(&db_height) {
            if existing.saved {
                return None;
            }
        }
        self.states.insert(
            db_height,
            DBState {
                directory_block,
                admin_block,
                factoid_block,
                entry_credit_block,
                eblocks,
                entries,
                is_new,
                ready_to_save: false,
                locked: false,
                signed: false,
                saved: false,
                save_state: None,
            },
        );
        self.states.get_mut(&db_height)
    }

    /// Whether the snapshot in `msg` is the valid successor of our ledger tail: `1` to apply now,
    /// `0` to buffer (the predecessor is not here yet), `-1` to reject (the chain does not link).
    pub fn valid_next(&self, msg: &BlockSnapshot) -> i32 {
        let db_height = msg.db_height();

        if db_height.int() == 0 {
            // Genesis carries no links to verify.
            return 1;
        }

        let saved = self.highest_saved();
        if saved.int() > 0 && db_height <= saved {
            return -1;
        }

        let prev = match self.states.get(&db_height.prev()) {
            Some(prev) => prev,
            None => return 0,
        };
        if !(prev.saved || prev.locked || !prev.is_new) {
            return 0;
        }

        let header = &msg.directory_block.header;
        if header.prev_key_mr == prev.directory_block.key_mr()
            && header.prev_full_hash == prev.directory_block.full_hash()
        {
            1
        } else {
            -1
        }
    }

    /// Chain the snapshot at `db_height` to its predecessor and commit its body digests.
    pub fn fixup_links(&mut self, db_height: DbHeight) {
        let prev_block = match self.states.get(&db_height.prev()) {
            Some(prev) if db_height.int() > 0 => prev.directory_block.clone(),
            _ => return,
        };
        if let Some(state) = self.states.get_mut(&db_height) {
            let component_digests = {
                let mut digests = vec![
                    state.admin_block.digest(),
                    state.entry_credit_block.digest(),
                    state.factoid_block.digest(),
                ];
                digests.extend(state.eblocks.iter().map(|eb| eb.key_mr()));
                digests
            };
            state.directory_block.set_body(&component_digests);
            state.directory_block.link_to(&prev_block);
        }
    }

    /// Drive the snapshot at `db_height` through its post-completion processing, locking it.
    pub fn process_blocks(&mut self, db_height: DbHeight) {
        if let Some(state) = self.states.get_mut(&db_height) {
            if !state.saved {
                state.locked = true;
            }
        }
    }

    /// The lowest height whose snapshot is ready to persist and whose predecessor is already
    /// saved.
    pub fn next_ready_to_save(&self) -> Option<DbHeight> {
        self.states
            .iter()
            .find(|(height, state)| {
                state.ready_to_save
                    && state.signed
                    && !state.saved
                    && (height.int() == 0
                        || self
                            .states
                            .get(&height.prev())
                            .map(|prev| prev.saved)
                            .unwrap_or(false))
            })
            .map(|(height, _)| *height)
    }

    /// Mark the snapshot at `db_height` saved, ending its lifecycle.
    pub fn mark_saved(&mut self, db_height: DbHeight) {
        if let Some(state) = self.states.get_mut(&db_height) {
            state.locked = true;
            state.signed = true;
            state.saved = true;
            state.is_new = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_types::Timestamp;

    fn components(h: u32) -> (DirectoryBlock, AdminBlock, FactoidBlock, EntryCreditBlock) {
        let height = DbHeight::new(h);
        (
            DirectoryBlock::new(height, Timestamp::new(h as u64 * 600_000)),
            AdminBlock::new(height),
            FactoidBlock::new(height),
            EntryCreditBlock::new(height),
        )
    }

    fn push_block(ledger: &mut DBStateLedger, h: u32) {
        let (db, ab, fb, ecb) = components(h);
        ledger
            .new_db_state(true, db, ab, fb, ecb, vec![], vec![])
            .unwrap();
        ledger.fixup_links(DbHeight::new(h));
        ledger.mark_saved(DbHeight::new(h));
    }

    fn snapshot_linked_to(ledger: &DBStateLedger, h: u32) -> BlockSnapshot {
        let (mut db, ab, fb, ecb) = components(h);
        if let Some(prev) = ledger.get(DbHeight::new(h - 1)) {
            db.link_to(&prev.directory_block);
        }
        BlockSnapshot {
            directory_block: db,
            admin_block: ab,
            factoid_block: fb,
            entry_credit_block: ecb,
            eblocks: vec![],
            entries: vec![],
            is_in_db: false,
        }
    }

    #[test]
    fn valid_next_requires_the_chain_to_link() {
        let mut ledger = DBStateLedger::new(HashMap::new());
        push_block(&mut ledger, 0);
        push_block(&mut ledger, 1);

        let good = snapshot_linked_to(&ledger, 2);
        assert_eq!(ledger.valid_next(&good), 1);

        let mut forged = snapshot_linked_to(&ledger, 2);
        forged.directory_block.header.prev_key_mr =
            crate::types::data_types::CryptoHash::of(b"forged");
        assert_eq!(ledger.valid_next(&forged), -1);

        // A snapshot whose predecessor has not arrived is pending, not invalid.
        let orphan = snapshot_linked_to(&ledger, 5);
        assert_eq!(ledger.valid_next(&orphan), 0);
    }

    #[test]
    fn snapshots_at_or_below_the_saved_head_are_rejected() {
        let mut ledger = DBStateLedger::new(HashMap::new());
        push_block(&mut ledger, 0);
        push_block(&mut ledger, 1);
        push_block(&mut ledger, 2);

        let stale = snapshot_linked_to(&ledger, 1);
        assert_eq!(ledger.valid_next(&stale), -1);
    }

    #[test]
    fn checkpoints_compare_full_key_mr_strings() {
        let (db, ..) = components(10);
        let good = key_mr_string(&db);

        let mut checkpoints = HashMap::new();
        checkpoints.insert(10, good.clone());
        let ledger = DBStateLedger::new(checkpoints);

        assert!(ledger.check_checkpoint(DbHeight::new(10), &good).is_ok());
        let err = ledger
            .check_checkpoint(DbHeight::new(10), "dead")
            .unwrap_err();
        assert!(err.contains("Found block at height 10 that didn't match a checkpoint"));
        // Heights without a checkpoint entry pass anything.
        assert!(ledger.check_checkpoint(DbHeight::new(11), "dead").is_ok());
    }

    #[test]
    fn saved_snapshots_are_never_displaced() {
        let mut ledger = DBStateLedger::new(HashMap::new());
        push_block(&mut ledger, 0);
        let (db, ab, fb, ecb) = components(0);
        assert!(ledger
            .new_db_state(true, db, ab, fb, ecb, vec![], vec![])
            .is_none());
    }

    #[test]
    fn highest_saved_tracks_the_saved_head() {
        let mut ledger = DBStateLedger::new(HashMap::new());
        assert_eq!(ledger.highest_saved(), DbHeight::new(0));
        push_block(&mut ledger, 0);
        push_block(&mut ledger, 1);
        assert_eq!(ledger.highest_saved(), DbHeight::new(1));

        // A locked-but-unsaved block counts as completed, not saved.
        let (db, ab, fb, ecb) = components(2);
        ledger
            .new_db_state(true, db, ab, fb, ecb, vec![], vec![])
            .unwrap();
        ledger.process_blocks(DbHeight::new(2));
        assert_eq!(ledger.highest_saved(), DbHeight::new(1));
        assert_eq!(ledger.highest_completed(), DbHeight::new(2));
    }
}
