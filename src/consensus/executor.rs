/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The message executor: classification and dispatch of every message the process loop hands the
//! core.
//!
//! [`execute_msg`](ConsensusCore::execute_msg) is the single entry point. It gates on the replay
//! filter, assigns the message to a virtual server, validates it, and routes it down the leader
//! path (build an ack, stamp the message, append to a process list) or the follower path (pair
//! against a cached ack, or park in holding). Per-variant leader and follower handlers below
//! collapse the original double dispatch into one exhaustive match per role.

use std::time::SystemTime;

use crate::{
    consensus::state::{ConsensusCore, IGNORE_MISSING_SECS},
    events::{Event, HoldMessageEvent, InvalidMessageEvent, PairSlotEvent},
    messages::{Ack, Message, MissingMsgResponse, Payload},
    networking::network::Network,
    networking::queues::{INMSGQUEUE_HIGH, INMSGQUEUE_LOW},
    replay::ReplayKind,
    storage::pluggables::BlockStore,
    types::data_types::Minute,
};

/// Result of validating a message against current state: process now, park for later, or reject
/// forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Validity {
    Valid,
    NotYet,
    Invalid,
}

impl<S: BlockStore, N: Network> ConsensusCore<S, N> {
    /// Dispatch one message through `replay gate → VM assignment → validate → leader/follower
    /// execute`. Returns whether the message made progress.
    pub fn execute_msg(&mut self, msg: &mut Message) -> bool {
        let now = self.get_timestamp();
        if !self
            .replay
            .valid(ReplayKind::Internal, &msg.repeat_hash(), msg.timestamp(), now)
        {
            return false;
        }

        self.compute_vm_index(msg);

        // During the boot window, old traffic is noise: the network has moved on without us.
        if self.ignore_missing && msg.timestamp().secs_until(now) > IGNORE_MISSING_SECS {
            return false;
        }

        match self.validate(msg) {
            Validity::Valid => {
                if self.leader_ready_for(msg) {
                    if self.leader_vm_is_empty() {
                        // The first message of a block must sit behind this height's DBSig.
                        self.send_dbsig(self.lleader_height, self.leader_vm_index);
                        self.counters.x_review_inputs += 1;
                        self.x_review.push(msg.clone());
                    } else {
                        self.leader_execute(msg);
                    }
                } else {
                    self.follower_execute(msg);
                }
                true
            }
            Validity::NotYet => {
                self.counters.holding_inputs += 1;
                self.holding.put(msg.clone(), now);
                Event::HoldMessage(HoldMessageEvent {
                    timestamp: SystemTime::now(),
                    msg_hash: msg.msg_hash(),
                    kind: msg.kind(),
                })
                .publish(&self.event_publisher);
                false
            }
            Validity::Invalid => {
                self.counters.holding_inputs += 1;
                self.holding.put(msg.clone(), now);
                if !msg.sent_invalid() {
                    msg.mark_sent_invalid();
                    let _ = self.network_invalid.try_send(msg.clone());
                    Event::InvalidMessage(InvalidMessageEvent {
                        timestamp: SystemTime::now(),
                        msg_hash: msg.msg_hash(),
                        kind: msg.kind(),
                    })
                    .publish(&self.event_publisher);
                }
                false
            }
        }
    }

    /// Whether this node should take the leader path for `msg` right now.
    fn leader_ready_for(&self, msg: &Message) -> bool {
        if !(self.run_leader && self.leader && !self.saving) {
            return false;
        }
        let vm_at_tail = self
            .process_lists
            .get(self.lleader_height)
            .and_then(|pl| pl.vms.get(self.leader_vm_index.index()))
            .map(|vm| vm.is_at_tail())
            .unwrap_or(false);
        vm_at_tail
            && (!self.syncing || !self.leader_vm_synced())
            && (msg.is_local() || msg.vm_index() == self.leader_vm_index)
            && (self.lleader_height + 1).int() >= self.highest_known_block().int()
    }

    fn leader_vm_synced(&self) -> bool {
        self.process_lists
            .get(self.lleader_height)
            .and_then(|pl| pl.vms.get(self.leader_vm_index.index()))
            .map(|vm| vm.synced)
            .unwrap_or(false)
    }

    pub(crate) fn leader_vm_is_empty(&self) -> bool {
        self.process_lists
            .get(self.lleader_height)
            .and_then(|pl| pl.vms.get(self.leader_vm_index.index()))
            .map(|vm| vm.list.is_empty())
            .unwrap_or(true)
    }

    /// Total depth of the inbound queues, the measure the backpressure rules read.
    pub(crate) fn in_msg_depth(&self) -> usize {
        self.ack_queue.len() + self.msg_queue.len()
    }

    /// Assign `msg` to a virtual server: by consistent hashing for chain-bound messages, by the
    /// explicit index it carries for acks and synchronization markers.
    fn compute_vm_index(&self, msg: &mut Message) {
        if let Some(binding) = msg.chain_binding() {
            if let Some(pl) = self.process_lists.get(self.lleader_height) {
                msg.set_vm_index(pl.vm_index_for(&binding));
            }
            return;
        }
        let explicit = match &msg.payload {
            Payload::Ack(a) => Some(a.vm_index),
            Payload::EndOfMinute(e) => Some(e.vm_index),
            Payload::DirectoryBlockSignature(d) => Some(d.vm_index),
            _ => None,
        };
        if let Some(vm_index) = explicit {
            msg.set_vm_index(vm_index);
        }
    }

    /// Validate `msg` against current state.
    pub(crate) fn validate(&self, msg: &Message) -> Validity {
        let now = self.get_timestamp();
        let saved = self.highest_saved_blk();
        match &msg.payload {
            Payload::Ack(a) => {
                if saved.int() > 0 && a.db_height <= saved {
                    return Validity::Invalid;
                }
                match self.authorities.get(&a.leader_chain_id) {
                    Some(authority) => match authority.verifying_key() {
                        Some(key) if a.is_correct(&key) => Validity::Valid,
                        _ => Validity::Invalid,
                    },
                    None => Validity::NotYet,
                }
            }
            Payload::EndOfMinute(e) => {
                if msg.is_local() {
                    return Validity::Valid;
                }
                if saved.int() > 0 && e.db_height <= saved {
                    return Validity::Invalid;
                }
                if e.db_height > self.lleader_height {
                    return Validity::NotYet;
                }
                match self.authorities.get(&e.server_id) {
                    Some(authority) => match authority.verifying_key() {
                        Some(key) if e.is_correct(&key) => Validity::Valid,
                        _ => Validity::Invalid,
                    },
                    None => Validity::NotYet,
                }
            }
            Payload::DirectoryBlockSignature(d) => {
                if saved.int() > 0 && d.db_height <= saved {
                    return Validity::Invalid;
                }
                if d.db_height > self.lleader_height {
                    return Validity::NotYet;
                }
                Validity::Valid
            }
            Payload::CommitChain(cc) => {
                // A commit for an entry already revealed in this window is a double spend.
                if cc.credits.int() == 0
                    || !self
                        .replay
                        .valid(ReplayKind::Reveal, &cc.entry_hash, msg.timestamp(), now)
                {
                    Validity::Invalid
                } else {
                    Validity::Valid
                }
            }
            Payload::CommitEntry(ce) => {
                if ce.credits.int() == 0
                    || !self
                        .replay
                        .valid(ReplayKind::Reveal, &ce.entry_hash, msg.timestamp(), now)
                {
                    Validity::Invalid
                } else {
                    Validity::Valid
                }
            }
            Payload::RevealEntry(re) => {
                let entry_hash = re.entry_hash();
                if !self
                    .replay
                    .valid(ReplayKind::Reveal, &entry_hash, msg.timestamp(), now)
                {
                    return Validity::Invalid;
                }
                if self.commits.next_commit(&entry_hash).is_some() {
                    Validity::Valid
                } else {
                    Validity::NotYet
                }
            }
            Payload::ServerFault(sf) => {
                if sf.db_height < saved {
                    Validity::Invalid
                } else {
                    Validity::NotYet
                }
            }
            Payload::FullServerFault(ff) => {
                if ff.db_height() < saved {
                    Validity::Invalid
                } else {
                    Validity::Valid
                }
            }
            Payload::BlockSnapshot(_)
            | Payload::MissingMsg(_)
            | Payload::MissingMsgResponse(_)
            | Payload::DataResponse(_)
            | Payload::Heartbeat(_)
            | Payload::AddServer(_)
            | Payload::RemoveServer(_)
            | Payload::ChangeServerKey(_) => Validity::Valid,
        }
    }

    /// Insert an `(ack, msg)` pair into the process list the ack names. On success the internal
    /// replay space is sealed (a later copy of the message dies at the executor's gate) and the
    /// cached ack, if any, is consumed.
    pub(crate) fn record_in_pl(&mut self, ack: Ack, msg: Message) -> bool {
        let now = self.get_timestamp();
        let db_height = ack.db_height;
        let vm_index = ack.vm_index;
        let height = ack.height;
        let msg_hash = msg.msg_hash();
        let repeat_hash = msg.repeat_hash();
        let timestamp = msg.timestamp();

        let seed = self.pl_seed();
        let added = match self.process_lists.get_or_create(db_height, &seed, now) {
            Some(pl) => pl.add_to_process_list(ack, msg),
            None => false,
        };
        if added {
            self.replay
                .is_ts_valid(ReplayKind::Internal, &repeat_hash, timestamp, now);
            self.acks.remove(&msg_hash);
            Event::PairSlot(PairSlotEvent {
                timestamp: SystemTime::now(),
                db_height,
                vm_index,
                height,
                msg_hash,
            })
            .publish(&self.event_publisher);
        }
        added
    }

    /* ↓↓↓ Leader paths ↓↓↓ */

    pub(crate) fn leader_execute(&mut self, msg: &mut Message) {
        match &msg.payload {
            Payload::EndOfMinute(_) => self.leader_execute_eom(msg),
            Payload::DirectoryBlockSignature(_) => self.leader_execute_dbsig(msg),
            Payload::CommitChain(_) => self.leader_execute_commit_chain(msg),
            Payload::CommitEntry(_) => self.leader_execute_commit_entry(msg),
            Payload::RevealEntry(_) => self.leader_execute_reveal_entry(msg),
            Payload::AddServer(_) | Payload::RemoveServer(_) | Payload::ChangeServerKey(_) => {
                self.leader_execute_generic(msg)
            }
            // Everything else has no leader-specific path.
            _ => self.follower_execute(msg),
        }
    }

    /// The generic leader path: re-check replay, build an ack, stamp the message, append.
    fn leader_execute_generic(&mut self, msg: &mut Message) {
        let now = self.get_timestamp();
        if !self
            .replay
            .valid(ReplayKind::Internal, &msg.repeat_hash(), msg.timestamp(), now)
        {
            self.counters.holding_outputs += 1;
            self.holding.remove(&msg.msg_hash());
            return;
        }
        let ack = self.new_ack(msg, None);
        msg.set_leader_chain_id(ack.leader_chain_id);
        msg.set_minute(ack.minute);
        self.record_in_pl(ack, msg.clone());
    }

    fn leader_execute_eom(&mut self, msg: &mut Message) {
        if !msg.is_local() {
            self.follower_execute_eom(msg);
            return;
        }

        // Stamp the system height and the serial hash of the newest fault into the marker.
        let (sys_height, sys_hash) = match self.process_lists.get(self.lleader_height) {
            Some(pl) => {
                let height = pl.system.height as u32;
                let hash = if pl.system.height > 1 {
                    match pl.system.list.get(pl.system.height - 1) {
                        Some(Some(fault_msg)) => match &fault_msg.payload {
                            Payload::FullServerFault(ff) => Some(ff.serial_hash()),
                            _ => None,
                        },
                        _ => None,
                    }
                } else {
                    None
                };
                (height, hash)
            }
            None => return,
        };

        let vm_synced = self.leader_vm_synced();
        if self.syncing && vm_synced {
            return;
        } else if !self.syncing {
            self.syncing = true;
            self.eom = true;
            self.eom_syncing = true;
            self.eom_processed = 0;
            self.eom_limit = self
                .process_lists
                .get(self.lleader_height)
                .map(|pl| pl.fed_server_count())
                .unwrap_or(0);
            self.eom_minute = self.current_minute;
            if let Some(pl) = self.process_lists.get_mut(self.lleader_height) {
                for vm in &mut pl.vms {
                    vm.synced = false;
                }
            }
        }

        let current_minute = self.current_minute;
        let leader_vm = self.leader_vm_index;
        {
            let pl = match self.process_lists.get_mut(self.lleader_height) {
                Some(pl) => pl,
                None => return,
            };
            let vm = match pl.vms.get_mut(leader_vm.index()) {
                Some(vm) => vm,
                None => return,
            };
            if vm.eom_minute_issued >= current_minute + 1 {
                return;
            }
            vm.eom_minute_issued = current_minute + 1;
        }

        if let Payload::EndOfMinute(eom) = &mut msg.payload {
            eom.db_height = self.lleader_height;
            eom.vm_index = leader_vm;
            eom.minute = Minute::new(current_minute);
            eom.server_id = self.config.identity_chain_id;
            eom.sys_height = sys_height;
            eom.sys_hash = sys_hash;
            eom.sign(&self.config.keypair);
        }
        msg.set_vm_index(leader_vm);

        let ack = self.new_ack(msg, None);
        self.counters.acks_inputs += 1;
        self.acks.insert(msg.msg_hash(), ack);
        msg.set_local(false);
        self.follower_execute_eom(msg);
        self.update_state();
        self.acks.remove(&msg.msg_hash());
        self.counters.holding_outputs += 1;
        self.holding.remove(&msg.msg_hash());
    }

    fn leader_execute_dbsig(&mut self, msg: &mut Message) {
        let (db_height, vm_index) = match &msg.payload {
            Payload::DirectoryBlockSignature(d) => (d.db_height, d.vm_index),
            _ => return,
        };

        if db_height != self.lleader_height {
            self.follower_execute(msg);
            return;
        }
        let vm_occupied = self
            .process_lists
            .get(db_height)
            .and_then(|pl| pl.vms.get(vm_index.index()))
            .map(|vm| !vm.list.is_empty())
            .unwrap_or(false);
        if vm_occupied {
            return;
        }

        let (sys_height, sys_hash) = match self.process_lists.get(db_height) {
            Some(pl) => {
                let height = pl.system.height as u32;
                let hash = if pl.system.height > 1 {
                    match pl.system.list.get(pl.system.height - 1) {
                        Some(Some(fault_msg)) => match &fault_msg.payload {
                            Payload::FullServerFault(ff) => Some(ff.serial_hash()),
                            _ => None,
                        },
                        _ => None,
                    }
                } else {
                    None
                };
                (height, hash)
            }
            None => return,
        };
        if let Payload::DirectoryBlockSignature(dbs) = &mut msg.payload {
            dbs.sys_height = sys_height;
            dbs.sys_hash = sys_hash;
        }

        let now = self.get_timestamp();
        if !self
            .replay
            .valid(ReplayKind::Internal, &msg.repeat_hash(), msg.timestamp(), now)
        {
            self.counters.holding_outputs += 1;
            self.holding.remove(&msg.msg_hash());
            return;
        }

        let balance_hash = Some(self.ledger.balance_hash());
        let ack = self.new_ack(msg, balance_hash);
        msg.set_leader_chain_id(ack.leader_chain_id);
        msg.set_minute(ack.minute);
        self.record_in_pl(ack, msg.clone());
    }

    fn leader_execute_commit_chain(&mut self, msg: &mut Message) {
        let entry_hash = match &msg.payload {
            Payload::CommitChain(cc) => cc.entry_hash,
            _ => return,
        };
        // A commit paying no more than one we already have is a potential double spend; drop it.
        if !self.commits.is_highest_commit(&entry_hash, msg) {
            return;
        }
        self.leader_execute_generic(msg);
        self.promote_held_reveal(&entry_hash);
    }

    fn leader_execute_commit_entry(&mut self, msg: &mut Message) {
        let entry_hash = match &msg.payload {
            Payload::CommitEntry(ce) => ce.entry_hash,
            _ => return,
        };
        if !self.commits.is_highest_commit(&entry_hash, msg) {
            return;
        }
        self.leader_execute_generic(msg);
        self.promote_held_reveal(&entry_hash);
    }

    /// A reveal held under `entry_hash` becomes executable the moment its commit lands.
    pub(crate) fn promote_held_reveal(&mut self, entry_hash: &crate::types::data_types::CryptoHash) {
        if let Some(reveal) = self.holding.get(entry_hash).cloned() {
            self.counters.x_review_inputs += 1;
            self.sender.send_out(&reveal);
            self.x_review.push(reveal);
        }
    }

    fn leader_execute_reveal_entry(&mut self, msg: &mut Message) {
        let entry_hash = match &msg.payload {
            Payload::RevealEntry(re) => re.entry_hash(),
            _ => return,
        };

        match self.validate(msg) {
            Validity::NotYet => {
                self.follower_execute(msg);
                return;
            }
            Validity::Invalid => return,
            Validity::Valid => {}
        }

        let commit = self.commits.next_commit(&entry_hash).cloned();
        let now = self.get_timestamp();

        // If a reveal with this hash was already recorded in this period, just ignore.
        if !self
            .replay
            .valid(ReplayKind::Reveal, &entry_hash, self.leader_timestamp, now)
        {
            return;
        }

        let ack = self.new_ack(msg, None);
        msg.set_leader_chain_id(ack.leader_chain_id);
        msg.set_minute(ack.minute);

        // Park the ack so we can tell whether the insertion consumed it.
        self.counters.acks_inputs += 1;
        self.acks.insert(msg.msg_hash(), ack.clone());
        self.record_in_pl(ack, msg.clone());
        if self.acks.contains_key(&msg.msg_hash()) {
            // Not installed: put the commit back for a later attempt and take the follower path.
            if let Some(commit) = commit {
                let commit_ts = commit.timestamp();
                self.commits.put(entry_hash, commit, commit_ts);
            }
            self.follower_execute(msg);
        } else {
            // Installed: the reveal is recorded, so the hash can never be revealed again in this
            // window, and the commit is spent.
            self.replay
                .is_ts_valid(ReplayKind::Reveal, &entry_hash, msg.timestamp(), now);
            self.counters.commits_outputs += 1;
            self.commits.delete(&entry_hash);
        }
    }

    /* ↓↓↓ Follower paths ↓↓↓ */

    pub(crate) fn follower_execute(&mut self, msg: &mut Message) {
        match &msg.payload {
            Payload::Ack(_) => self.follower_execute_ack(msg),
            Payload::EndOfMinute(_) => self.follower_execute_eom(msg),
            Payload::RevealEntry(_) => self.follower_execute_reveal_entry(msg),
            Payload::CommitChain(_) => self.follower_execute_commit_chain(msg),
            Payload::CommitEntry(_) => self.follower_execute_commit_entry(msg),
            Payload::BlockSnapshot(_) => self.follower_execute_dbstate(msg),
            Payload::MissingMsgResponse(_) => self.follower_execute_mmr(msg),
            Payload::MissingMsg(_) => self.follower_execute_missing_msg(msg),
            Payload::DataResponse(_) => self.follower_execute_data_response(msg),
            Payload::FullServerFault(_) => self.follower_execute_full_fault(msg),
            Payload::Heartbeat(_) => self.follower_execute_heartbeat(msg),
            Payload::ServerFault(_)
            | Payload::AddServer(_)
            | Payload::RemoveServer(_)
            | Payload::ChangeServerKey(_)
            | Payload::DirectoryBlockSignature(_) => self.follower_execute_msg(msg),
        }
    }

    /// Messages that go into a process list must match an acknowledgement. The code is the same
    /// for all such messages, so it lives here.
    pub(crate) fn follower_execute_msg(&mut self, msg: &Message) {
        let now = self.get_timestamp();
        self.counters.holding_inputs += 1;
        self.holding.put(msg.clone(), now);

        if let Some(ack) = self.acks.get(&msg.msg_hash()).cloned() {
            let mut stamped = msg.clone();
            stamped.set_leader_chain_id(ack.leader_chain_id);
            stamped.set_minute(ack.minute);
            self.record_in_pl(ack, stamped);
        }
    }

    fn follower_execute_eom(&mut self, msg: &Message) {
        if msg.is_local() {
            // An internal marker; we are not a leader, so ignore.
            return;
        }
        let now = self.get_timestamp();
        self.counters.holding_inputs += 1;
        self.holding.put(msg.clone(), now);

        if let Some(ack) = self.acks.get(&msg.msg_hash()).cloned() {
            self.record_in_pl(ack, msg.clone());
        }
    }

    /// Acks always match some message in a process list; this is where the match happens.
    fn follower_execute_ack(&mut self, msg: &Message) {
        let ack = match &msg.payload {
            Payload::Ack(a) => a.clone(),
            _ => return,
        };

        if ack.db_height > self.highest_known {
            self.highest_known = ack.db_height;
        }
        self.set_highest_ack(ack.db_height);

        let now = self.get_timestamp();
        let seed = self.pl_seed();
        let slot_filled = match self.process_lists.get_or_create(ack.db_height, &seed, now) {
            Some(pl) => pl
                .get_slot(ack.vm_index, ack.height.index())
                .is_some(),
            None => return,
        };
        if slot_filled {
            return;
        }

        self.counters.acks_inputs += 1;
        self.acks.insert(ack.message_hash, ack.clone());
        if let Some(held) = self.holding.get(&ack.message_hash).cloned() {
            let mut held = held;
            self.follower_execute(&mut held);
        }
    }

    fn follower_execute_commit_chain(&mut self, msg: &Message) {
        self.follower_execute_msg(msg);
        if let Payload::CommitChain(cc) = &msg.payload {
            self.promote_held_reveal(&cc.entry_hash);
        }
    }

    fn follower_execute_commit_entry(&mut self, msg: &Message) {
        self.follower_execute_msg(msg);
        if let Payload::CommitEntry(ce) = &msg.payload {
            self.promote_held_reveal(&ce.entry_hash);
        }
    }

    fn follower_execute_reveal_entry(&mut self, msg: &Message) {
        let now = self.get_timestamp();
        self.counters.holding_inputs += 1;
        self.holding.put(msg.clone(), now);

        let ack = match self.acks.get(&msg.msg_hash()).cloned() {
            Some(ack) => ack,
            None => return,
        };

        let (entry_hash, chain_id) = match &msg.payload {
            Payload::RevealEntry(re) => (re.entry_hash(), re.entry.chain_id),
            _ => return,
        };

        let mut stamped = msg.clone();
        self.sender.send_out(&stamped);
        stamped.set_leader_chain_id(ack.leader_chain_id);
        stamped.set_minute(ack.minute);
        self.record_in_pl(ack, stamped);

        self.counters.commits_outputs += 1;
        self.commits.delete(&entry_hash);

        // Record the pending chain head before sealing the reveal window, so API readers never
        // observe a sealed reveal without its pending head.
        if let Some(pl) = self.process_lists.get_mut(self.lleader_height) {
            pl.put_pending_chain_head(chain_id);
        }
        self.replay
            .is_ts_valid(ReplayKind::Reveal, &entry_hash, msg.timestamp(), now);
    }

    fn follower_execute_full_fault(&mut self, msg: &Message) {
        let (db_height, system_height) = match &msg.payload {
            Payload::FullServerFault(ff) => (ff.db_height(), ff.fault.system_height),
            _ => return,
        };
        let now = self.get_timestamp();
        let seed = self.pl_seed();
        if let Some(pl) = self.process_lists.get_or_create(db_height, &seed, now) {
            pl.add_to_system_list(system_height, msg.clone());
        }
    }

    fn follower_execute_heartbeat(&mut self, msg: &Message) {
        if let Payload::Heartbeat(hb) = &msg.payload {
            if let Some(pl) = self.process_lists.get_mut(hb.db_height) {
                if let Some(audit) = pl
                    .audit_servers
                    .iter_mut()
                    .find(|s| s.id == hb.identity_chain_id)
                {
                    audit.online = true;
                }
            }
        }
    }

    /// Handle a missing-message response: either a full fault for the system list, or an
    /// `(ack, msg)` pair for a VM slot.
    fn follower_execute_mmr(&mut self, msg: &Message) {
        // Just ignore missing messages for a period after going offline or starting up, and when
        // drowning.
        if self.ignore_missing || self.in_msg_depth() > INMSGQUEUE_HIGH {
            return;
        }

        let mmr = match &msg.payload {
            Payload::MissingMsgResponse(mmr) => mmr.clone(),
            _ => return,
        };
        let now = self.get_timestamp();

        if let Some(inner) = &mmr.msg_response {
            if let Payload::FullServerFault(ff) = &inner.payload {
                if self.validate(inner) == Validity::Valid {
                    let fed_count = self
                        .process_lists
                        .get(ff.db_height())
                        .map(|pl| pl.fed_server_count());
                    match fed_count {
                        Some(fed_count)
                            if ff.has_enough_sigs(fed_count) && self.pledged_by_audit(ff) =>
                        {
                            let fresh = self.replay.valid(
                                ReplayKind::Internal,
                                &inner.repeat_hash(),
                                inner.timestamp(),
                                now,
                            );
                            if fresh {
                                self.counters.x_review_inputs += 1;
                                self.x_review.push((**inner).clone());
                            } else if let Some(pl) = self.process_lists.get_mut(ff.db_height()) {
                                pl.add_to_system_list(ff.fault.system_height, (**inner).clone());
                            }
                            self.counters.missing_response_applied_cnt += 1;
                        }
                        Some(_) => {
                            let past_system_height = self
                                .process_lists
                                .get(ff.db_height())
                                .map(|pl| ff.fault.height.index() >= pl.system.height)
                                .unwrap_or(false);
                            if past_system_height {
                                self.counters.x_review_inputs += 1;
                                self.x_review.push((**inner).clone());
                                self.counters.missing_response_applied_cnt += 1;
                            }
                        }
                        None => {}
                    }
                }
                return;
            }
        }

        let ack = match &mmr.ack_response {
            Some(ack) => ack.clone(),
            None => return,
        };
        let ack_msg = Message::new(Payload::Ack(ack.clone()), ack.timestamp);
        if self.validate(&ack_msg) == Validity::Invalid {
            return;
        }
        let inner = match &mmr.msg_response {
            Some(inner) => (**inner).clone(),
            None => return,
        };

        if self.process_lists.get(ack.db_height).is_none() {
            return;
        }
        let ack_unseen = self.replay.valid(
            ReplayKind::Internal,
            &ack_msg.repeat_hash(),
            ack_msg.timestamp(),
            now,
        );
        let msg_unseen =
            self.replay
                .valid(ReplayKind::Internal, &inner.repeat_hash(), inner.timestamp(), now);

        self.counters.acks_inputs += 1;
        self.acks.insert(ack.message_hash, ack.clone());

        // Put the components we have not seen yet back into the review queue to process; if both
        // were already seen, place the pair directly.
        if ack_unseen {
            self.counters.x_review_inputs += 1;
            self.x_review.push(ack_msg);
        }
        if msg_unseen {
            self.counters.x_review_inputs += 1;
            self.x_review.push(inner.clone());
        }
        if !ack_unseen && !msg_unseen {
            self.record_in_pl(ack, inner);
        }

        self.counters.missing_response_applied_cnt += 1;
    }

    fn follower_execute_data_response(&mut self, msg: &Message) {
        let response = match &msg.payload {
            Payload::DataResponse(r) => r,
            _ => return,
        };
        match response.data_type() {
            1 => {
                // Data is an entry block.
                let eblock = match &response.data_object {
                    crate::messages::DataObject::EBlock(eb) => eb.clone(),
                    _ => return,
                };
                let key_mr = eblock.key_mr();
                let position = match self
                    .missing_entry_blocks
                    .iter()
                    .position(|missing| missing.eb_key_mr == key_mr)
                {
                    Some(position) => position,
                    None => return,
                };
                if self
                    .store
                    .fetch_dblock_by_height(eblock.header.db_height)
                    .is_none()
                {
                    return;
                }
                self.missing_entry_blocks.remove(position);
                if let Err(err) = self.store.process_eblock_batch(&eblock, true) {
                    log::error!("failed to persist a recovered entry block: {}", err);
                }
            }
            0 => {
                // Data is an entry.
                if let crate::messages::DataObject::Entry(entry) = &response.data_object {
                    let _ = self.write_entry.try_send(entry.clone());
                }
            }
            _ => {}
        }
    }

    /// Reply to a peer's request for process-list slots, if we hold them and are not busy.
    fn follower_execute_missing_msg(&mut self, msg: &Message) {
        // Don't respond to missing messages if we are behind.
        if self.in_msg_depth() > INMSGQUEUE_LOW {
            return;
        }
        let request = match &msg.payload {
            Payload::MissingMsg(m) => m.clone(),
            _ => return,
        };
        let now = self.get_timestamp();

        let mut responses: Vec<MissingMsgResponse> = Vec::new();
        {
            let pl = match self.process_lists.get(request.db_height) {
                Some(pl) => pl,
                None => {
                    self.counters.missing_request_ignore_cnt += 1;
                    return;
                }
            };
            if let Some(Some(fault)) = pl.system.list.get(request.system_height as usize) {
                responses.push(MissingMsgResponse {
                    ack_response: None,
                    msg_response: Some(Box::new(fault.clone())),
                });
            }
            for height in &request.process_list_heights {
                if let Some((ack, slot_msg)) = pl.get_slot(request.vm_index, height.index()) {
                    responses.push(MissingMsgResponse {
                        ack_response: Some(ack.clone()),
                        msg_response: Some(Box::new(slot_msg.clone())),
                    });
                }
            }
        }

        if responses.is_empty() {
            self.counters.missing_request_ignore_cnt += 1;
            return;
        }
        for response in responses {
            let mut out = Message::new(Payload::MissingMsgResponse(response), now);
            out.envelope.is_peer_to_peer = true;
            self.sender.send(request.asker, out);
            self.counters.missing_request_reply_cnt += 1;
        }
    }
}

/* ↓↓↓ Block snapshot application ↓↓↓ */

impl<S: BlockStore, N: Network> ConsensusCore<S, N> {
    /// Opportunistically ingest the entries of a snapshot that fell below the received-window
    /// base: the block itself is settled, but its entries may still be missing locally.
    pub(crate) fn execute_entries_in_dbstate(&mut self, snapshot: &crate::messages::BlockSnapshot) {
        let height = snapshot.db_height();
        if self.entry_db_height_complete > height {
            return;
        }
        if snapshot.eblocks.is_empty() {
            return;
        }

        // Every snapshot that got here is valid, so checking the directory block digest works.
        let dblock = match self.store.fetch_dblock_by_height(height) {
            Some(dblock) => dblock,
            None => {
                log::warn!("dblock fetched at height {} is nil", height);
                return;
            }
        };
        if snapshot.directory_block.key_mr() != dblock.key_mr() {
            log::error!("bad snapshot at height {}: dblock does not match", height);
            return;
        }

        self.store.start_multi_batch();
        for entry in &snapshot.entries {
            if !self.store.entry_exists(&entry.hash()) {
                let _ = self.store.insert_entry_multi_batch(entry);
            }
        }
        if let Err(err) = self.store.execute_multi_batch() {
            log::error!("was unable to execute multibatch at height {}: {}", height, err);
        }
    }

    /// Apply a received block snapshot: buffer it while its predecessor is missing, reject it if
    /// it does not link, otherwise roll temp state back, append it to the ledger, scan its
    /// factoid transactions for double spends, and reset the minute machine.
    pub(crate) fn follower_execute_dbstate(&mut self, msg: &Message) {
        let snapshot = match &msg.payload {
            Payload::BlockSnapshot(snapshot) => snapshot.clone(),
            _ => return,
        };
        let db_height = snapshot.db_height();
        let is_in_db = snapshot.is_in_db;

        // Ignore if too old: under the saved head and under the entry-complete height.
        if db_height.int() > 0
            && db_height <= self.highest_saved_blk()
            && db_height < self.entry_db_height_complete
        {
            return;
        }

        match self.db_states.valid_next(&snapshot) {
            0 => {
                // Might be valid later. Rebase the received window against the saved head, then
                // buffer; don't add duplicate snapshots.
                let saved = self.highest_saved_blk().int() as i64;
                if self.snapshots_received_base < saved {
                    let cut = (saved - self.snapshots_received_base) as usize;
                    if self.snapshots_received.len() > cut {
                        self.snapshots_received.drain(..cut);
                    } else {
                        self.snapshots_received.clear();
                    }
                    self.snapshots_received_base += cut as i64;
                }
                let ix = db_height.int() as i64 - self.snapshots_received_base;
                if ix < 0 {
                    // If we are missing entries at this snapshot, we can apply the entries only.
                    self.execute_entries_in_dbstate(&snapshot);
                    return;
                }
                let ix = ix as usize;
                while self.snapshots_received.len() <= ix {
                    self.snapshots_received.push(None);
                }
                self.snapshots_received[ix] = Some(msg.clone());
                return;
            }
            -1 => {
                // Local-DB snapshots never count as ignored.
                if !is_in_db {
                    self.counters.dbstate_ignore_cnt += 1;
                }
                Event::IgnoreSnapshot(crate::events::IgnoreSnapshotEvent {
                    timestamp: SystemTime::now(),
                    db_height,
                })
                .publish(&self.event_publisher);
                return;
            }
            _ => {}
        }

        // Reset to the previous block's recorded state before applying.
        if db_height.int() > 1 && db_height >= self.process_lists.db_height_base() {
            let save_state = self
                .db_states
                .get(db_height.prev())
                .and_then(|prev| prev.save_state.clone());
            if let Some(save_state) = save_state {
                self.trim_back(save_state);
            }
        }

        let added = self.add_db_state(
            false,
            snapshot.directory_block.clone(),
            snapshot.admin_block.clone(),
            snapshot.factoid_block.clone(),
            snapshot.entry_credit_block.clone(),
            snapshot.eblocks.clone(),
            snapshot.entries.clone(),
        );
        if !added {
            if !is_in_db {
                self.counters.dbstate_ignore_cnt += 1;
            }
            return;
        }

        // Check all the transaction IDs against the block replay space. Only check; don't seal.
        let block_timestamp = snapshot.directory_block.header.timestamp;
        for (i, tx) in snapshot.factoid_block.transactions.iter().enumerate() {
            let fresh =
                self.replay
                    .valid(ReplayKind::Block, &tx.sig_hash, tx.timestamp, block_timestamp);
            // Skip the coinbase. The scan runs over the first 2000 blocks, so we can unit test,
            // then after 100K for the running system.
            if i > 0
                && ((db_height.int() > 0 && db_height.int() < 2000) || db_height.int() > 100_000)
                && !fresh
            {
                // Totally ignore the block if it has a double spend.
                return;
            }
        }
        // Only seal once we know the whole block is valid.
        for tx in &snapshot.factoid_block.transactions {
            self.replay
                .is_ts_valid(ReplayKind::Block, &tx.sig_hash, tx.timestamp, block_timestamp);
        }

        if !is_in_db {
            if let Some(state) = self.db_states.get_mut(db_height) {
                state.ready_to_save = true;
                state.locked = false;
                state.signed = true;
            }
            self.counters.dbstate_applied_cnt += 1;
            self.db_states_update_state();
        } else {
            if let Some(state) = self.db_states.get_mut(db_height) {
                state.saved = true;
                state.is_new = false;
                state.locked = false;
            }
        }

        // Late reveals still need their commits: absorb the ones this block paid for.
        self.update_ecs(&snapshot.entry_credit_block);

        self.eom = false;
        self.eom_done = false;
        self.eom_sys = false;
        self.dbsig = false;
        self.dbsig_done = false;
        self.dbsig_sys = false;
        self.saving = true;
        self.syncing = false;

        // Hurry up our next ask: when we have the data we asked for, ask for the next batch.
        if self.db_states.last_end < db_height.int() as i64 {
            self.db_states.last_end = db_height.int() as i64 + 1;
        }
        if self.db_states.last_begin < db_height.int() as i64 + 1 {
            self.db_states.last_begin = db_height.int() as i64;
        }

        Event::ApplySnapshot(crate::events::ApplySnapshotEvent {
            timestamp: SystemTime::now(),
            db_height,
            from_network: !is_in_db,
        })
        .publish(&self.event_publisher);
    }

    /// Restore the permanent balance maps from a recorded save point.
    fn trim_back(&mut self, save_state: crate::dbstate::SaveState) {
        *self.ledger.factoid_balances.lock().unwrap() = save_state.factoid_balances;
        *self.ledger.ec_balances.lock().unwrap() = save_state.ec_balances;
    }
}
