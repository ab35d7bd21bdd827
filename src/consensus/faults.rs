/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The full-server-fault protocol: swapping a stalled federated server for a pledged audit
//! server.
//!
//! A complete fault carries signatures from a quorum of federated servers plus a pledge from the
//! nominated audit server itself. Processing one either executes the swap (when the accused VM
//! has caught up to the faulted height), tallies more votes (when incomplete), or clears the
//! fault (when the accused leader came back). The fault message accumulates state while it sits
//! in the system list, so the caller writes the mutated payload back into its slot.

use std::time::SystemTime;

use crate::{
    events::{ClearFaultEvent, Event, SwapServerEvent},
    messages::{FullServerFault, Message, Payload, ServerFault},
    networking::network::Network,
    storage::pluggables::BlockStore,
    types::{
        authority::ServerClass, crypto_primitives::contexts, data_types::Minute,
        data_types::VmIndex,
    },
};

use super::state::ConsensusCore;

impl<S: BlockStore, N: Network> ConsensusCore<S, N> {
    /// Process a full fault from the system list. Returns whether the fault is permanently
    /// disposed of; `msg` is updated in place with the accumulated tally state.
    pub(crate) fn process_full_server_fault(&mut self, msg: &mut Message) -> bool {
        let mut ff = match &msg.payload {
            Payload::FullServerFault(ff) => ff.clone(),
            _ => return false,
        };
        let consumed = self.process_full_fault_inner(&mut ff);
        msg.payload = Payload::FullServerFault(ff);
        consumed
    }

    fn process_full_fault_inner(&mut self, ff: &mut FullServerFault) -> bool {
        if ff.already_processed {
            return false;
        }
        let db_height = ff.db_height();
        let vm_index = ff.fault.vm_index;

        let (system_height, vm_height, vm_count, when_faulted, fed_count) =
            match self.process_lists.get(db_height) {
                Some(pl) => (
                    pl.system.height,
                    pl.vms.get(vm_index.index()).map(|vm| vm.height),
                    pl.vms.len(),
                    pl.vms.get(vm_index.index()).map(|vm| vm.when_faulted),
                    pl.fed_server_count(),
                ),
                None => return false,
            };

        // We must be caught up in our system list before the fault is processable.
        if system_height < ff.fault.system_height as usize {
            return false;
        }
        // Do not process the fault until the VM height has caught up to it.
        match vm_height {
            Some(vm_height) if ff.fault.height.index() <= vm_height => {}
            _ => return false,
        }
        if ff.fault.system_height as usize != system_height {
            return false;
        }

        // The leader came back online: forget the fault without promoting or demoting anyone.
        if ff.clear_fault && vm_index.index() < vm_count && when_faulted == Some(0) {
            ff.already_processed = true;
            Event::ClearFault(ClearFaultEvent {
                timestamp: SystemTime::now(),
                db_height,
                server_id: ff.fault.server_id,
            })
            .publish(&self.event_publisher);
            log::warn!("fault cleared for {} at height {}", ff.fault.server_id, db_height);
            return true;
        }

        // Locate the nominated audit server. Already a fed server means nothing to do; no audit
        // candidate at all means the fault is useless to us.
        let replacement = {
            let pl = self.process_lists.get(db_height).unwrap();
            match pl
                .audit_servers
                .iter()
                .find(|s| s.id == ff.fault.audit_server_id)
                .cloned()
            {
                Some(replacement) => replacement,
                None => return false,
            }
        };

        if ff.has_enough_sigs(fed_count) && self.pledged_by_audit(ff) {
            // The fault is complete; execute it by replacing the faulted leader with the
            // nominated audit server.
            let faulted_height = ff.fault.height.index();
            let vm_height = vm_height.unwrap();
            if vm_height > faulted_height {
                // We ran ahead of the agreed height; rewind the VM and retry on a later tick.
                if let Some(pl) = self.process_lists.get_mut(db_height) {
                    if let Some(vm) = pl.vms.get_mut(vm_index.index()) {
                        vm.height = faulted_height;
                    }
                }
                return false;
            } else if vm_height < faulted_height {
                return false;
            }

            let swapped = {
                let pl = self.process_lists.get_mut(db_height).unwrap();
                match pl.fed_server_index(&ff.fault.server_id) {
                    Some(list_index) => {
                        let demoted = pl.fed_servers[list_index].clone();
                        pl.fed_servers[list_index] = replacement.clone();
                        pl.fed_servers[list_index].online = true;
                        let audit_index = pl.add_audit_server(demoted.id);
                        pl.audit_servers[audit_index].online = false;
                        pl.remove_audit_server(&replacement.id);

                        pl.mark_no_fault(vm_index);
                        let next_index =
                            VmIndex::new(((vm_index.index() + 1) % pl.fed_server_count()) as u8);
                        let next_flagged = pl
                            .vms
                            .get(next_index.index())
                            .map(|vm| vm.fault_flag > 0)
                            .unwrap_or(false);
                        if next_flagged {
                            pl.mark_no_fault(next_index);
                        }
                        true
                    }
                    None => false,
                }
            };
            if !swapped {
                return false;
            }

            self.authorities
                .set_class(&replacement.id, ServerClass::Federated);
            self.authorities
                .set_class(&ff.fault.server_id, ServerClass::Audit);

            // The swap may have moved our own seat; recompute leadership.
            let identity = self.config.identity_chain_id;
            let minute = Minute::new(self.current_minute.min(9));
            if let Some(pl) = self.process_lists.get(self.lleader_height) {
                let (leader, leader_vm) = pl.get_virtual_servers(minute, &identity);
                self.leader = leader;
                self.leader_vm_index = leader_vm;
            }

            self.last_fault_action = self.get_timestamp().secs() as i64;
            log::warn!(
                "full fault processed: dbht {} sysht {} server {} replaced by audit {}",
                db_height,
                ff.fault.system_height,
                ff.fault.server_id,
                ff.fault.audit_server_id
            );
            Event::SwapServer(SwapServerEvent {
                timestamp: SystemTime::now(),
                db_height,
                demoted: ff.fault.server_id,
                promoted: ff.fault.audit_server_id,
            })
            .publish(&self.event_publisher);

            ff.already_processed = true;
            return true;
        }

        // The fault is incomplete: verify and tally the signatures it carries, and contribute our
        // own vote if we agree and have not been counted.
        let core_hash = ff.core_hash().bytes();
        for sig in ff.signature_list.clone() {
            let mut issuer = [0u8; 32];
            issuer.copy_from_slice(&sig.key);

            if let Some(audit_authority) = self.authorities.get(&ff.fault.audit_server_id) {
                if audit_authority.verify_signature(contexts::SERVER_FAULT, &core_hash, &sig.signature)
                {
                    ff.pledge_done = true;
                }
            }

            let sf_signed = self.authorities.fast_verify_authority_signature(
                contexts::SERVER_FAULT,
                &core_hash,
                &sig.key,
                &sig.signature,
            );
            if sf_signed > 0 || (sf_signed == 0 && ff.pledge_done) {
                ff.add_fault_vote(issuer);
            }

            if (self.leader || self.config.identity_chain_id == ff.fault.audit_server_id)
                && !ff.my_vote_tallied
            {
                if let Some(me) = self.authorities.get(&self.config.identity_chain_id) {
                    if me.verify_signature(contexts::SERVER_FAULT, &core_hash, &sig.signature) {
                        ff.my_vote_tallied = true;
                    }
                }
            }
        }

        if (self.leader || self.config.identity_chain_id == ff.fault.audit_server_id)
            && !ff.my_vote_tallied
        {
            let now_secs = self.get_timestamp().secs() as i64;
            let cooldown = self.config.fault_timeout_secs / 2;
            if now_secs - ff.last_match_secs > 5 && now_secs - self.last_tiebreak > cooldown {
                if ff.sig_tally() >= fed_count.saturating_sub(1) {
                    self.last_tiebreak = now_secs;
                }
                let fault = ServerFault {
                    server_id: ff.fault.server_id,
                    audit_server_id: ff.fault.audit_server_id,
                    vm_index: ff.fault.vm_index,
                    db_height: ff.fault.db_height,
                    height: ff.fault.height,
                    system_height: ff.fault.system_height,
                    timestamp: ff.fault.timestamp,
                    signature: crate::types::data_types::SignatureBytes::zero(),
                };
                self.match_fault(fault);
                ff.last_match_secs = now_secs;
            }
        }

        false
    }

    /// Whether the nominated audit server's pledge is among the fault's signatures.
    pub(crate) fn pledged_by_audit(&self, ff: &FullServerFault) -> bool {
        if ff.pledge_done {
            return true;
        }
        let audit_authority = match self.authorities.get(&ff.fault.audit_server_id) {
            Some(authority) => authority,
            None => return false,
        };
        let core_hash = ff.core_hash().bytes();
        ff.signature_list.iter().any(|sig| {
            audit_authority.verify_signature(contexts::SERVER_FAULT, &core_hash, &sig.signature)
        })
    }

    /// Sign and issue a fault of our own that matches one we agree with.
    fn match_fault(&mut self, mut fault: ServerFault) {
        fault.sign(&self.config.keypair);
        let msg = Message::new(Payload::ServerFault(fault), self.get_timestamp());
        self.sender.send_out(&msg);
    }
}
