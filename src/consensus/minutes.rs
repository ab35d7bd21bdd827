/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The minute and block advance state machine.
//!
//! Two synchronization waves alternate over a block's life. End-of-minute markers close each of
//! the ten minutes: the first marker of a minute opens the wave, each federated VM contributes
//! exactly one marker, and the wave completes when every VM is synced and the system list has
//! caught up to the highest claimed fault height. Directory block signatures open each block the
//! same way. [`process_eom`](ConsensusCore::process_eom) and
//! [`process_dbsig`](ConsensusCore::process_dbsig) are called from process-list consumption and
//! return `true` only when their message is permanently disposed of; returning `false` leaves the
//! message at the head of its VM to be offered again on the next tick.

use std::time::SystemTime;

use crate::{
    dbstate::{key_mr_string, SaveState},
    events::{
        CompleteBlockEvent, CompleteMinuteEvent, Event, GenerateDbSigEvent, SendHeartbeatEvent,
        StartMinuteSyncEvent,
    },
    messages::{DirectoryBlockSignature, Heartbeat, Message, Payload},
    networking::network::Network,
    storage::pluggables::BlockStore,
    types::{
        blocks::{new_minute_number, AdminBlock, DirectoryBlock, EntryCreditBlock},
        blocks::{EBlock, Entry, FactoidBlock},
        crypto_primitives::contexts,
        data_types::{DbHeight, Minute, ServerId, SignatureBytes, VmIndex},
    },
};

use super::state::ConsensusCore;

impl<S: BlockStore, N: Network> ConsensusCore<S, N> {
    /// Process one end-of-minute marker. See the module documentation for the wave structure.
    pub(crate) fn process_eom(&mut self, db_height: DbHeight, msg: &Message) -> bool {
        let eom = match &msg.payload {
            Payload::EndOfMinute(eom) => eom.clone(),
            _ => return false,
        };

        // Don't process an EOM while a DBSig wave is open.
        if self.syncing && !self.eom {
            return false;
        }
        // Out-of-order minutes wait their turn.
        if self.eom && eom.minute.int() > self.eom_minute {
            return false;
        }

        let system_caught_up = match self.process_lists.get(db_height) {
            Some(pl) => pl.system.height as u32 >= eom.sys_height,
            None => return false,
        };
        if system_caught_up {
            self.eom_sys = true;
        }

        // Once everything is done for all EOMs for all VMs, and only then, let processing
        // continue past the marker.
        if self.eom_done && self.eom_sys {
            match self.db_states.get(db_height.prev()) {
                None => return false,
                Some(prev) if !prev.saved => return false,
                _ => {}
            }
            self.eom_processed -= 1;
            if self.eom_processed <= 0 {
                self.eom = false;
                self.eom_done = false;
                self.syncing = false;
                self.eom_processed = 0;
                self.temp_balance_hash = self.ledger.balance_hash();
            }
            self.send_heartbeat();
            return true;
        }

        // What happens once for all VMs at the start of a minute's wave.
        if !self.eom {
            self.eom_sys = false;
            self.syncing = true;
            self.eom = true;
            self.eom_syncing = true;
            self.eom_processed = 0;
            self.eom_limit = self
                .process_lists
                .get(self.lleader_height)
                .map(|pl| pl.fed_server_count())
                .unwrap_or(0);
            self.eom_minute = eom.minute.int();
            if let Some(pl) = self.process_lists.get_mut(db_height) {
                for vm in &mut pl.vms {
                    vm.synced = false;
                }
            }
            Event::StartMinuteSync(StartMinuteSyncEvent {
                timestamp: SystemTime::now(),
                db_height,
                minute: eom.minute,
            })
            .publish(&self.event_publisher);
            return false;
        }

        // What happens for each VM's marker.
        let vm_synced = self
            .process_lists
            .get(db_height)
            .and_then(|pl| pl.vms.get(eom.vm_index.index()))
            .map(|vm| vm.synced)
            .unwrap_or(true);
        if !vm_synced {
            if let Some(pl) = self.process_lists.get_mut(db_height) {
                if let Some(vm) = pl.vms.get_mut(eom.vm_index.index()) {
                    vm.leader_minute = vm.leader_minute.next();
                    vm.synced = true;
                }
                pl.mark_no_fault(eom.vm_index);
                if (pl.sys_highest as u32) < eom.sys_height {
                    pl.sys_highest = eom.sys_height as usize;
                }
            }
            self.eom_processed += 1;
            return false;
        }

        let allfaults = self
            .process_lists
            .get(self.lleader_height)
            .map(|pl| pl.system.height >= pl.sys_highest)
            .unwrap_or(false);

        // After every VM's marker is in, claim the minute and unwind.
        if allfaults && self.eom_processed == self.eom_limit as i32 && !self.eom_done {
            self.eom_done = true;
            let now = self.get_timestamp();

            if let Some(pl) = self.process_lists.get_mut(db_height) {
                for eblock in pl.new_eblocks.values_mut() {
                    eblock.add_end_of_minute_marker(eom.minute.marker());
                }
                pl.entry_credit_block
                    .add_entry(new_minute_number(eom.minute.marker()));
            }
            self.ledger.end_of_period(eom.minute.int());

            if !self.leader {
                self.current_minute = eom.minute.int();
            }
            self.current_minute += 1;
            self.current_minute_start = now;

            Event::CompleteMinute(CompleteMinuteEvent {
                timestamp: SystemTime::now(),
                db_height,
                minute: eom.minute,
            })
            .publish(&self.event_publisher);

            if self.current_minute < 10 {
                if self.current_minute == 1 {
                    if let Some(prev) = self.db_states.get_mut(db_height.prev()) {
                        if !prev.saved {
                            prev.ready_to_save = true;
                        }
                    }
                }
                let identity = self.config.identity_chain_id;
                if let Some(pl) = self.process_lists.get(self.lleader_height) {
                    let (leader, vm_index) =
                        pl.get_virtual_servers(Minute::new(self.current_minute), &identity);
                    self.leader = leader;
                    self.leader_vm_index = vm_index;
                }
            } else {
                self.close_block(db_height);
            }

            let expired = self.commits.remove_expired(now);
            self.counters.commits_outputs += expired as u64;
            let lleader_height = self.lleader_height;
            self.acks.retain(|_, ack| ack.db_height >= lleader_height);
        }

        false
    }

    /// Minute 10: finalize the block under construction, open the next one, and (as leader) sign
    /// the freshly closed block.
    fn close_block(&mut self, db_height: DbHeight) {
        let now = self.get_timestamp();

        let (directory_block, admin_block, entry_credit_block, eblocks, entries) =
            match self.process_lists.get(db_height) {
                Some(pl) => (
                    pl.directory_block.clone(),
                    pl.admin_block.clone(),
                    pl.entry_credit_block.clone(),
                    pl.new_eblocks.values().cloned().collect::<Vec<EBlock>>(),
                    pl.new_entries.values().cloned().collect::<Vec<Entry>>(),
                ),
                None => return,
            };
        let factoid_block = self.ledger.take_current_block(db_height + 1);

        self.add_db_state(
            true,
            directory_block,
            admin_block,
            factoid_block,
            entry_credit_block,
            eblocks,
            entries,
        );
        self.db_states.fixup_links(db_height);
        self.db_states.process_blocks(db_height);

        self.current_minute = 0;
        self.lleader_height += 1;

        self.get_ack_change();
        self.check_for_id_change();

        let identity = self.config.identity_chain_id;
        let seed = self.pl_seed();
        if let Some(pl) = self
            .process_lists
            .get_or_create(self.lleader_height, &seed, now)
        {
            let (leader, vm_index) = pl.get_virtual_servers(Minute::new(0), &identity);
            self.leader = leader;
            self.leader_vm_index = vm_index;
        }

        self.dbsig_processed = 0;

        // If we processed the previous minutes we generate the DBSig for the next block here. If
        // we started from scratch instead, no DBSig exists yet; the first message of the new
        // block notices the unsigned VM and triggers send_dbsig.
        let already_sent = self
            .process_lists
            .get(self.lleader_height)
            .map(|pl| pl.dbsig_already_sent)
            .unwrap_or(true);
        if self.leader && !already_sent {
            let header = match self.db_states.get(db_height) {
                Some(state) => state.directory_block.header.clone(),
                None => return,
            };
            let mut dbs = DirectoryBlockSignature {
                db_height: self.lleader_height,
                vm_index: self.leader_vm_index,
                directory_block_header: header,
                server_identity_chain_id: identity,
                sys_height: 0,
                sys_hash: None,
                timestamp: now,
                signature: SignatureBytes::zero(),
                matches: false,
            };
            dbs.sign(&self.config.keypair);
            let mut dbs_msg = Message::new(Payload::DirectoryBlockSignature(dbs), now);
            dbs_msg.set_local(true);
            dbs_msg.set_vm_index(self.leader_vm_index);
            if let Some(pl) = self.process_lists.get_mut(self.lleader_height) {
                pl.dbsig_already_sent = true;
            }
            Event::GenerateDbSig(GenerateDbSigEvent {
                timestamp: SystemTime::now(),
                db_height: self.lleader_height,
                vm_index: self.leader_vm_index,
            })
            .publish(&self.event_publisher);
            self.leader_execute(&mut dbs_msg);
            self.sender.send_out(&dbs_msg);
        }
        self.saving = true;

        Event::CompleteBlock(CompleteBlockEvent {
            timestamp: SystemTime::now(),
            db_height,
        })
        .publish(&self.event_publisher);
    }

    /// Process one directory block signature. Mirrors the end-of-minute wave; completing it is
    /// what lets a new block's process lists start consuming entries.
    pub(crate) fn process_dbsig(&mut self, db_height: DbHeight, msg: &Message) -> bool {
        let dbs = match &msg.payload {
            Payload::DirectoryBlockSignature(dbs) => dbs.clone(),
            _ => return false,
        };

        // Don't process a DBSig while an EOM wave is open.
        if self.syncing && !self.dbsig {
            return false;
        }

        let system_caught_up = match self.process_lists.get(db_height) {
            Some(pl) => pl.system.height as u32 >= dbs.sys_height,
            None => return false,
        };
        if system_caught_up {
            self.dbsig_sys = true;
        }

        // Once we are done with DBSigs and this message is processed, we are done. Let
        // everything go.
        if self.dbsig_sys && self.dbsig && self.dbsig_done {
            self.dbsig_processed -= 1;
            if self.dbsig_processed <= 0 {
                self.eom_done = false;
                self.eom_sys = false;
                self.eom = false;
                self.dbsig = false;
                self.syncing = false;
            }
            if let Some(pl) = self.process_lists.get_mut(db_height) {
                if let Some(vm) = pl.vms.get_mut(dbs.vm_index.index()) {
                    vm.signed = true;
                }
            }
            return true;
        }

        // What happens once at the start of the signature wave.
        if !self.dbsig {
            self.dbsig_limit = self
                .process_lists
                .get(db_height)
                .map(|pl| pl.fed_server_count())
                .unwrap_or(0);
            self.dbsig_processed = 0;
            self.dbsig = true;
            self.syncing = true;
            self.dbsig_done = false;
            if let Some(pl) = self.process_lists.get_mut(db_height) {
                for vm in &mut pl.vms {
                    vm.synced = false;
                }
                pl.reset_diff_sig_tally();
            }
        }

        // What happens per signature.
        let vm_synced = self
            .process_lists
            .get(db_height)
            .and_then(|pl| pl.vms.get(dbs.vm_index.index()))
            .map(|vm| vm.synced)
            .unwrap_or(true);
        if !vm_synced {
            // The predecessor must be settled, either in our ledger or retrievable.
            if self.lleader_height.int() > 0
                && (self.highest_completed_blk() + 1) < self.lleader_height
            {
                let prev_complete = self
                    .process_lists
                    .get(dbs.db_height.prev())
                    .map(|pl| pl.complete())
                    .unwrap_or(false);
                if !prev_complete {
                    let prev_settled = self
                        .db_states
                        .get(dbs.db_height.prev())
                        .map(|state| state.locked || state.saved)
                        .unwrap_or(false);
                    if !prev_settled
                        && self
                            .store
                            .fetch_dblock_by_height(dbs.db_height.prev())
                            .is_none()
                    {
                        return false;
                    }
                }
            }

            // VM 0's signature carries the leader's clock for the block.
            if dbs.vm_index.int() == 0 {
                self.leader_timestamp = dbs.timestamp;
            }

            let prev_dblock = match self.store.fetch_dblock_by_height(db_height.prev()) {
                Some(dblock) => dblock,
                None => match self.db_states.get(db_height.prev()) {
                    Some(state) if !state.is_new || state.locked || state.saved => {
                        state.directory_block.clone()
                    }
                    _ => return false,
                },
            };

            if dbs.directory_block_header.body_mr != prev_dblock.header.body_mr {
                if let Some(pl) = self.process_lists.get_mut(db_height) {
                    pl.increment_diff_sig_tally();
                }
                log::error!(
                    "ProcessDBSig failed. DBlocks do not match. Expected-Body-Mr {}, got {}",
                    prev_dblock.header.body_mr,
                    dbs.directory_block_header.body_mr
                );
                return false;
            }

            // The signature must verify under the claimed authority's current key.
            let data = dbs.directory_block_header.marshal_binary();
            match self.authorities.get(&dbs.server_identity_chain_id) {
                Some(authority)
                    if authority.verify_signature(
                        contexts::DIRECTORY_BLOCK_SIGNATURE,
                        &data,
                        &dbs.signature,
                    ) => {}
                _ => {
                    log::error!(
                        "ProcessDBSig failed. Invalid authority signature from {}",
                        dbs.server_identity_chain_id
                    );
                    return false;
                }
            }

            self.add_db_sig(db_height, dbs.server_identity_chain_id, dbs.signature);
            self.dbsig_processed += 1;
            if let Some(pl) = self.process_lists.get_mut(db_height) {
                if let Some(vm) = pl.vms.get_mut(dbs.vm_index.index()) {
                    vm.synced = true;
                    // Stamp the stored copy so the completion re-scan can see it verified.
                    let position = vm.height;
                    if let Some(Some((_, stored))) = vm.list.get_mut(position) {
                        if let Payload::DirectoryBlockSignature(stored_dbs) = &mut stored.payload {
                            stored_dbs.matches = true;
                        }
                    }
                }
            }
        }

        let allfaults = self
            .process_lists
            .get(self.lleader_height)
            .map(|pl| pl.system.height >= pl.sys_highest)
            .unwrap_or(false);

        // What happens once after the whole set of signatures is in.
        if allfaults && !self.dbsig_done && self.dbsig_processed >= self.dbsig_limit as i32 {
            // Re-scan slot 0 of every VM: any signature that never verified voids the wave.
            let fed_count = self
                .process_lists
                .get(db_height)
                .map(|pl| pl.fed_server_count())
                .unwrap_or(0);
            for i in 0..fed_count {
                let matches = self
                    .process_lists
                    .get(db_height)
                    .and_then(|pl| pl.vms.get(i))
                    .and_then(|vm| vm.list.first())
                    .and_then(|slot| slot.as_ref())
                    .map(|(_, stored)| match &stored.payload {
                        Payload::DirectoryBlockSignature(stored_dbs) => stored_dbs.matches,
                        _ => false,
                    });
                if matches == Some(false) {
                    self.dbsig_processed -= 1;
                    return false;
                }
            }

            // If a majority of the signatures disagree with ours, our block is the wrong one:
            // drop it and fetch a fresh snapshot from peers instead of building on a fork.
            if !self.config.keep_mismatch {
                let tally_ok = self
                    .process_lists
                    .get(db_height)
                    .map(|pl| pl.check_diff_sig_tally())
                    .unwrap_or(true);
                if !tally_ok {
                    return false;
                }
            }

            self.review_holding();
            self.saving = false;
            self.dbsig_done = true;
        }
        false
    }

    /// Generate and issue this node's directory block signature for `db_height`, if the DBSig is
    /// this node's responsibility and it has not been produced yet.
    pub(crate) fn send_dbsig(&mut self, db_height: DbHeight, vm_index: VmIndex) {
        let saved = self.highest_saved_blk();
        if db_height <= saved || self.eom {
            return;
        }
        let identity = self.config.identity_chain_id;
        let (vm_started, vm_signed, leader_minute, already_sent) =
            match self.process_lists.get(db_height) {
                Some(pl) => match pl.vms.get(vm_index.index()) {
                    Some(vm) => (
                        vm.height > 0,
                        vm.signed,
                        vm.leader_minute,
                        pl.dbsig_already_sent,
                    ),
                    None => return,
                },
                None => return,
            };
        if vm_started || vm_signed {
            return;
        }
        let (leader, leader_vm) = match self.process_lists.get(db_height) {
            Some(pl) => pl.get_virtual_servers(leader_minute, &identity),
            None => return,
        };
        if !leader || leader_vm != vm_index {
            return;
        }

        let header = match self.db_states.get(db_height.prev()) {
            Some(state) => state.directory_block.header.clone(),
            None => {
                if db_height.int() > 0 {
                    self.send_dbsig(db_height.prev(), vm_index);
                }
                return;
            }
        };

        if already_sent {
            // We already signed; whatever is stalling the VM is someone else's slot. Ask for it.
            let request = self
                .process_lists
                .get(db_height)
                .and_then(|pl| pl.ask(identity, vm_index, 0, 0));
            if let Some(request) = request {
                let now = self.get_timestamp();
                let out = Message::new(Payload::MissingMsg(request), now);
                self.sender.broadcast(out);
            }
            return;
        }

        let now = self.get_timestamp();
        let mut dbs = DirectoryBlockSignature {
            db_height,
            vm_index,
            directory_block_header: header,
            server_identity_chain_id: identity,
            sys_height: 0,
            sys_hash: None,
            timestamp: now,
            signature: SignatureBytes::zero(),
            matches: false,
        };
        dbs.sign(&self.config.keypair);
        let mut dbs_msg = Message::new(Payload::DirectoryBlockSignature(dbs), now);
        dbs_msg.set_local(true);
        dbs_msg.set_vm_index(vm_index);

        if let Some(pl) = self.process_lists.get_mut(db_height) {
            if let Some(vm) = pl.vms.get_mut(vm_index.index()) {
                vm.signed = true;
            }
            pl.dbsig_already_sent = true;
        }
        Event::GenerateDbSig(GenerateDbSigEvent {
            timestamp: SystemTime::now(),
            db_height,
            vm_index,
        })
        .publish(&self.event_publisher);
        self.leader_execute(&mut dbs_msg);
        self.sender.send_out(&dbs_msg);
    }

    /// Record a verified directory block signature into the admin block under construction.
    pub(crate) fn add_db_sig(
        &mut self,
        db_height: DbHeight,
        server_id: ServerId,
        signature: SignatureBytes,
    ) {
        if let Some(pl) = self.process_lists.get_mut(db_height) {
            pl.admin_block.add_db_signature(server_id, signature);
        }
    }

    /// Add a block to the ledger, whether built locally at minute 10, pulled from the local
    /// database, or received from peers. Returns whether the ledger accepted it.
    ///
    /// Panics when the block contradicts a checkpoint: running past a checkpoint mismatch would
    /// mean building on a fork of the canonical chain.
    pub fn add_db_state(
        &mut self,
        is_new: bool,
        directory_block: DirectoryBlock,
        admin_block: AdminBlock,
        factoid_block: FactoidBlock,
        entry_credit_block: EntryCreditBlock,
        eblocks: Vec<EBlock>,
        entries: Vec<Entry>,
    ) -> bool {
        let db_height = directory_block.db_height();
        let key_mr = key_mr_string(&directory_block);

        let inserted = self
            .db_states
            .new_db_state(
                is_new,
                directory_block,
                admin_block,
                factoid_block,
                entry_credit_block,
                eblocks,
                entries,
            )
            .is_some();
        if !inserted {
            return false;
        }

        if self.config.network_name.eq_ignore_ascii_case("main") {
            if let Err(err) = self.db_states.check_checkpoint(db_height, &key_mr) {
                panic!("{}", err);
            }
        }

        if db_height > self.lleader_height {
            let now = self.get_timestamp();
            self.syncing = false;
            self.eom = false;
            self.dbsig = false;
            self.lleader_height = db_height;
            self.current_minute = 0;
            self.eom_processed = 0;
            self.dbsig_processed = 0;
            self.start_delay = now.millis() as i64;
            self.run_leader = false;

            let seed = self.pl_seed();
            self.process_lists.get_or_create(db_height + 1, &seed, now);
            let identity = self.config.identity_chain_id;
            if let Some(pl) = self.process_lists.get_or_create(db_height, &seed, now) {
                // A fresh ledger head invalidates whatever the temp balances said.
                pl.factoid_balances_t.lock().unwrap().clear();
                pl.ec_balances_t.lock().unwrap().clear();
                let (leader, vm_index) = pl.get_virtual_servers(Minute::new(0), &identity);
                self.leader = leader;
                self.leader_vm_index = vm_index;
            }
            while self.update_state() {}
        }
        if db_height.int() == 0 && self.lleader_height.int() < 1 {
            self.lleader_height = DbHeight::new(1);
            let now = self.get_timestamp();
            let seed = self.pl_seed();
            self.process_lists.get_or_create(self.lleader_height, &seed, now);
        }

        true
    }

    /// Persist every snapshot that is ready, in order, and slide the process list window behind
    /// the saved head.
    pub(crate) fn db_states_update_state(&mut self) {
        while let Some(db_height) = self.db_states.next_ready_to_save() {
            {
                let state = match self.db_states.get(db_height) {
                    Some(state) => state,
                    None => return,
                };
                if let Err(err) = self.store.save_block(
                    &state.directory_block,
                    &state.admin_block,
                    &state.factoid_block,
                    &state.entry_credit_block,
                    &state.eblocks,
                    &state.entries,
                ) {
                    // A node that cannot persist the canonical chain cannot safely continue.
                    panic!("failed to save block at height {}: {}", db_height, err);
                }
            }
            let save_state = SaveState {
                factoid_balances: self.ledger.factoid_balances.lock().unwrap().clone(),
                ec_balances: self.ledger.ec_balances.lock().unwrap().clone(),
            };
            if let Some(state) = self.db_states.get_mut(db_height) {
                state.save_state = Some(save_state);
            }
            self.db_states.mark_saved(db_height);

            let saved = self.highest_saved_blk();
            if saved.int() >= 1 && saved < self.lleader_height {
                self.process_lists.trim_to(saved.prev());
            }
        }
    }

    /// Refresh the ack-change height from configuration.
    pub(crate) fn get_ack_change(&mut self) {
        if let Some(source) = &self.config_source {
            self.config.ack_change = source.ack_change();
        }
    }

    /// On reaching the ack-change height, re-read this node's identity from configuration.
    pub(crate) fn check_for_id_change(&mut self) {
        let reload =
            self.config.ack_change > 0 && self.lleader_height.int() >= self.config.ack_change;
        if !reload {
            return;
        }
        if let Some(source) = &self.config_source {
            if let Some(identity) = source.identity() {
                self.config.identity_chain_id = identity.identity_chain_id;
                self.config.keypair = identity.keypair;
            }
        }
    }

    /// Emit a signed liveness beacon if this node serves as an audit server.
    pub(crate) fn send_heartbeat(&mut self) {
        let dblock_hash = match self.db_states.get(self.lleader_height.prev()) {
            Some(state) => state.directory_block.full_hash(),
            None => return,
        };
        if !self.is_audit_server(self.lleader_height) {
            return;
        }
        let now = self.get_timestamp();
        let mut heartbeat = Heartbeat {
            db_height: self.lleader_height,
            secret_number: self.get_salt(now),
            dblock_hash,
            identity_chain_id: self.config.identity_chain_id,
            signature: SignatureBytes::zero(),
        };
        heartbeat.sign(&self.config.keypair);
        let msg = Message::new(Payload::Heartbeat(heartbeat), now);
        self.sender.send_out(&msg);
        Event::SendHeartbeat(SendHeartbeatEvent {
            timestamp: SystemTime::now(),
            db_height: self.lleader_height,
        })
        .publish(&self.event_publisher);
    }
}
