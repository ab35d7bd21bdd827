/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-variant process functions, run when a process-list slot is consumed.
//!
//! By the time a message gets here it has already been acknowledged into a definite position of a
//! definite virtual server; these functions apply its *effect*: commits flow into the entry
//! credit block and the commit registry, reveals flow into entry blocks, and authority management
//! messages flow into the admin block. Each returns whether the slot was consumed; `false` leaves
//! the message at the head of its VM to be retried on the next tick.

use std::time::SystemTime;

use crate::{
    events::{Event, ProcessRevealEvent, StoreCommitEvent},
    messages::{admin, Message, Payload},
    networking::network::Network,
    replay::ReplayKind,
    storage::pluggables::BlockStore,
    types::{
        authority::ServerClass,
        blocks::{EBlock, EcRecord, Entry, EntryCreditBlock},
        data_types::{ChainId, CryptoHash, DbHeight, EntryCredits},
    },
};

use super::state::ConsensusCore;

impl<S: BlockStore, N: Network> ConsensusCore<S, N> {
    /// Returns the best unclaimed commit for `entry_hash`, without consuming it.
    pub fn next_commit(&self, entry_hash: &CryptoHash) -> Option<&Message> {
        self.commits.next_commit(entry_hash)
    }

    /// Whether `msg` pays more entry credits than any commit already registered for `entry_hash`.
    pub fn is_highest_commit(&self, entry_hash: &CryptoHash, msg: &Message) -> bool {
        self.commits.is_highest_commit(entry_hash, msg)
    }

    /// Register `msg` as the commit for `entry_hash` if it is the highest.
    pub fn put_commit(&mut self, entry_hash: CryptoHash, msg: Message) {
        if !self.commits.is_highest_commit(&entry_hash, &msg) {
            return;
        }
        let credits = match &msg.payload {
            Payload::CommitChain(cc) => cc.credits,
            Payload::CommitEntry(ce) => ce.credits,
            _ => EntryCredits::new(0),
        };
        let now = self.get_timestamp();
        self.commits.put(entry_hash, msg, now);
        Event::StoreCommit(StoreCommitEvent {
            timestamp: SystemTime::now(),
            entry_hash,
            credits,
        })
        .publish(&self.event_publisher);
    }

    /// The entry block being built for `chain_id` at `db_height`, if within reach of the saved
    /// head.
    pub fn get_new_eblocks(&self, db_height: DbHeight, chain_id: &ChainId) -> Option<&EBlock> {
        if db_height.int() > self.highest_saved_blk().int() + 2 {
            return None;
        }
        self.process_lists.get(db_height)?.new_eblock(chain_id)
    }

    /// Whether `chain_id` has, or is about to have, an entry block at `db_height`.
    pub fn is_new_or_pending_eblocks(&self, db_height: DbHeight, chain_id: &ChainId) -> bool {
        if db_height.int() > self.highest_saved_blk().int() + 2 {
            return false;
        }
        match self.process_lists.get(db_height) {
            Some(pl) => pl.new_eblock(chain_id).is_some() || pl.is_pending_chain_head(chain_id),
            None => false,
        }
    }

    pub fn put_new_eblocks(&mut self, db_height: DbHeight, chain_id: ChainId, eblock: EBlock) {
        if let Some(pl) = self.process_lists.get_mut(db_height) {
            pl.add_new_eblock(chain_id, eblock);
        }
    }

    pub fn put_new_entries(&mut self, db_height: DbHeight, entry_hash: CryptoHash, entry: Entry) {
        if let Some(pl) = self.process_lists.get_mut(db_height) {
            pl.add_new_entry(entry_hash, entry);
        }
    }

    pub(crate) fn process_commit_chain(&mut self, db_height: DbHeight, msg: &Message) -> bool {
        let cc = match &msg.payload {
            Payload::CommitChain(cc) => cc.clone(),
            _ => return true,
        };
        if let Some(pl) = self.process_lists.get_mut(db_height) {
            pl.entry_credit_block.add_entry(EcRecord::CommitChain {
                entry_hash: cc.entry_hash,
                credits: cc.credits,
                timestamp: cc.timestamp,
            });
        }
        if self
            .ledger
            .update_ec_transaction(cc.ec_address, cc.credits)
            .is_err()
        {
            return false;
        }
        // Save the commit to match against the reveal later.
        self.put_commit(cc.entry_hash, msg.clone());
        self.release_held_reveal(&cc.entry_hash);
        true
    }

    pub(crate) fn process_commit_entry(&mut self, db_height: DbHeight, msg: &Message) -> bool {
        let ce = match &msg.payload {
            Payload::CommitEntry(ce) => ce.clone(),
            _ => return true,
        };
        if let Some(pl) = self.process_lists.get_mut(db_height) {
            pl.entry_credit_block.add_entry(EcRecord::CommitEntry {
                entry_hash: ce.entry_hash,
                credits: ce.credits,
                timestamp: ce.timestamp,
            });
        }
        if self
            .ledger
            .update_ec_transaction(ce.ec_address, ce.credits)
            .is_err()
        {
            return false;
        }
        self.put_commit(ce.entry_hash, msg.clone());
        self.release_held_reveal(&ce.entry_hash);
        true
    }

    /// A reveal held under a just-processed commit leaves holding for the review queue.
    fn release_held_reveal(&mut self, entry_hash: &CryptoHash) {
        if let Some(reveal) = self.holding.remove(entry_hash) {
            self.counters.holding_outputs += 1;
            self.counters.x_review_inputs += 1;
            self.sender.send_out(&reveal);
            self.x_review.push(reveal);
        }
    }

    pub(crate) fn process_reveal_entry(&mut self, db_height: DbHeight, msg: &Message) -> bool {
        let reveal = match &msg.payload {
            Payload::RevealEntry(re) => re.clone(),
            _ => return true,
        };
        let entry_hash = reveal.entry_hash();
        let chain_id = reveal.entry.chain_id;

        self.counters.commits_outputs += 1;
        self.commits.delete(&entry_hash);

        let eb = self.get_new_eblocks(db_height, &chain_id).cloned();
        let eb_db = match self.get_new_eblocks(db_height.prev(), &chain_id).cloned() {
            Some(eb_db) => Some(eb_db),
            None => self.store.fetch_eblock_head(&chain_id),
        };

        // An entry chain create: must be built with a chain commit, and the chain must not exist
        // in this block or the previous one.
        if !reveal.is_entry && eb.is_none() && eb_db.is_none() {
            let mut eblock = EBlock::new(chain_id, db_height);
            eblock.add_entry(entry_hash);
            self.put_new_eblocks(db_height, chain_id, eblock);
            self.put_new_entries(db_height, entry_hash, reveal.entry.clone());
            Event::ProcessReveal(ProcessRevealEvent {
                timestamp: SystemTime::now(),
                entry_hash,
                chain_id,
            })
            .publish(&self.event_publisher);
            return true;
        }

        // An entry (even if they paid with a chain commit): there must be a chain somewhere.
        let mut eblock = match eb {
            Some(eblock) => eblock,
            None => match eb_db {
                None => return false,
                Some(head) => EBlock::new_from_prev(&head, db_height),
            },
        };
        eblock.add_entry(entry_hash);
        self.put_new_eblocks(db_height, chain_id, eblock);
        self.put_new_entries(db_height, entry_hash, reveal.entry.clone());

        // Monitor key changes for federated and audit server identities.
        self.load_identity_by_entry(&reveal.entry);

        Event::ProcessReveal(ProcessRevealEvent {
            timestamp: SystemTime::now(),
            entry_hash,
            chain_id,
        })
        .publish(&self.event_publisher);
        true
    }

    /// Inspect an entry written to an authority's identity chain; a 32-byte payload registers a
    /// new signing key for that identity.
    fn load_identity_by_entry(&mut self, entry: &Entry) {
        let server_id = crate::types::data_types::ServerId::new(entry.chain_id.bytes());
        if !self.authorities.is_authority(&server_id) {
            return;
        }
        if entry.content.len() >= 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&entry.content[..32]);
            self.authorities.set_signing_key(&server_id, key);
        }
    }

    pub(crate) fn process_add_server(&mut self, db_height: DbHeight, msg: &Message) -> bool {
        let add = match &msg.payload {
            Payload::AddServer(add) => add.clone(),
            _ => return true,
        };
        if !self.authorities.is_authority(&add.server_id) {
            return false;
        }
        self.authorities.set_class(&add.server_id, add.server_class);
        if let Some(pl) = self.process_lists.get_mut(db_height) {
            match add.server_class {
                ServerClass::Federated => pl.admin_block.add_federated_server(add.server_id),
                ServerClass::Audit => pl.admin_block.add_audit_server(add.server_id),
            }
        }
        true
    }

    pub(crate) fn process_remove_server(&mut self, db_height: DbHeight, msg: &Message) -> bool {
        let remove = match &msg.payload {
            Payload::RemoveServer(remove) => remove.clone(),
            _ => return true,
        };
        if !self.authorities.is_authority(&remove.server_id) {
            return true;
        }
        if self.authorities.server_class(&remove.server_id) != Some(remove.server_class) {
            return true;
        }
        // Never remove the last two federated servers; the network cannot shrink below a pair.
        let fed_count = self
            .process_lists
            .get(db_height)
            .map(|pl| pl.fed_server_count())
            .unwrap_or(0);
        if fed_count < 2 && remove.server_class == ServerClass::Federated {
            return true;
        }
        if let Some(pl) = self.process_lists.get_mut(db_height) {
            pl.admin_block.remove_federated_server(remove.server_id);
        }
        true
    }

    pub(crate) fn process_change_server_key(&mut self, db_height: DbHeight, msg: &Message) -> bool {
        let change = match &msg.payload {
            Payload::ChangeServerKey(change) => change.clone(),
            _ => return true,
        };
        if !self.authorities.is_authority(&change.identity_chain_id) {
            return true;
        }
        let pl = match self.process_lists.get_mut(db_height) {
            Some(pl) => pl,
            None => return false,
        };
        match change.admin_block_change {
            admin::TYPE_ADD_BTC_ANCHOR_KEY => {
                let mut btc_key = [0u8; 20];
                btc_key.copy_from_slice(&change.key.bytes()[..20]);
                pl.admin_block.add_federated_server_bitcoin_anchor_key(
                    change.identity_chain_id,
                    change.key_priority,
                    change.key_type,
                    btc_key,
                );
                self.authorities
                    .set_btc_anchor_key(&change.identity_chain_id, btc_key);
            }
            admin::TYPE_ADD_FED_SERVER_KEY => {
                let key = change.key.bytes();
                pl.admin_block
                    .add_federated_server_signing_key(change.identity_chain_id, key);
                self.authorities
                    .set_signing_key(&change.identity_chain_id, key);
            }
            admin::TYPE_ADD_MATRYOSHKA => {
                pl.admin_block
                    .add_matryoshka_hash(change.identity_chain_id, change.key);
                self.authorities
                    .set_matryoshka_hash(&change.identity_chain_id, change.key);
            }
            _ => {}
        }
        true
    }

    /// Absorb the commits recorded in an applied entry credit block, so reveals that arrive after
    /// the snapshot still find their commits.
    pub(crate) fn update_ecs(&mut self, ec_block: &EntryCreditBlock) {
        let now = self.get_timestamp();
        for record in ec_block.body.clone() {
            let (entry_hash, credits, timestamp, is_entry) = match record {
                EcRecord::CommitChain {
                    entry_hash,
                    credits,
                    timestamp,
                } => (entry_hash, credits, timestamp, false),
                EcRecord::CommitEntry {
                    entry_hash,
                    credits,
                    timestamp,
                } => (entry_hash, credits, timestamp, true),
                EcRecord::MinuteNumber(_) => continue,
            };
            let record_hash = CryptoHash::combine(&entry_hash, &CryptoHash::of(&[credits.int()]));
            if !self
                .replay
                .is_ts_valid(ReplayKind::Internal, &record_hash, timestamp, now)
            {
                continue;
            }
            if self.store.entry_exists(&entry_hash) {
                continue;
            }
            let payload = if is_entry {
                Payload::CommitEntry(crate::messages::CommitEntry {
                    entry_hash,
                    credits,
                    ec_address: crate::types::data_types::Address::new([0u8; 32]),
                    timestamp,
                    signature: crate::types::data_types::SignatureBytes::zero(),
                })
            } else {
                Payload::CommitChain(crate::messages::CommitChain {
                    entry_hash,
                    chain_id_hash: CryptoHash::zero(),
                    credits,
                    ec_address: crate::types::data_types::Address::new([0u8; 32]),
                    timestamp,
                    signature: crate::types::data_types::SignatureBytes::zero(),
                })
            };
            let commit_msg = Message::new(payload, timestamp);
            self.put_commit(entry_hash, commit_msg);
        }
    }
}
