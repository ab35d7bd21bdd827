/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-block working set: one ordered message stream per federated server, the system-level
//! fault stream, and the tentative blocks being assembled for the current directory block.
//!
//! ## Virtual servers
//!
//! A process list at height `h` owns `N` [virtual servers](Vm), one per federated server. Each VM
//! is a densely indexed list of `(Ack, Message)` pairs; the ack at position `p` carries a serial
//! hash chaining every acknowledged message up to `p`, which is what
//! [`add_to_process_list`](ProcessList::add_to_process_list) verifies before accepting a slot.
//! `Vm::height` counts the prefix of the list that has been *processed* (fed through the
//! per-variant process functions); it trails `list.len()` whenever prerequisites are missing.
//!
//! ## The system list
//!
//! Full server faults are not bound to any single VM, so they run through a separate ordered
//! [`SystemList`] whose height gates minute closure: an end-of-minute marker stamped with a higher
//! system height than ours means we are missing a fault and must not close the minute yet.

pub mod window;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::{
    messages::{Ack, Message, MissingMsg},
    types::{
        authority::Server,
        blocks::{AdminBlock, DirectoryBlock, EBlock, Entry, EntryCreditBlock},
        data_types::{
            Address, ChainId, CryptoHash, DbHeight, ListHeight, Minute, ServerId, Timestamp,
            VmIndex,
        },
    },
};

/// One federated server's ordered message stream within a block.
pub struct Vm {
    /// Slots indexed by ack height. A `None` is a gap: an ack arrived for a later slot before
    /// this one was filled.
    pub list: Vec<Option<(Ack, Message)>>,
    /// Number of slots processed so far. Always `<= list.len()`.
    pub height: usize,
    /// The minute this VM's leader is currently stamping into acks.
    pub leader_minute: Minute,
    pub synced: bool,
    pub signed: bool,
    /// Highest minute for which this VM has issued its own end-of-minute marker, one-based.
    pub eom_minute_issued: u8,
    pub when_faulted: i64,
    pub fault_flag: i32,
}

impl Vm {
    fn new() -> Self {
        Self {
            list: Vec::new(),
            height: 0,
            leader_minute: Minute::new(0),
            synced: false,
            signed: false,
            eom_minute_issued: 0,
            when_faulted: 0,
            fault_flag: 0,
        }
    }

    /// Whether everything acknowledged into this VM has also been processed.
    pub fn is_at_tail(&self) -> bool {
        self.height == self.list.len()
    }

    /// The ack of the last filled slot, if the tail slot is filled.
    pub fn last_ack(&self) -> Option<&Ack> {
        self.list.last().and_then(|slot| slot.as_ref()).map(|(ack, _)| ack)
    }
}

/// The per-process-list ordered stream of faults and other system-level messages.
pub struct SystemList {
    pub list: Vec<Option<Message>>,
    /// Number of system slots processed.
    pub height: usize,
}

impl SystemList {
    fn new() -> Self {
        Self {
            list: Vec::new(),
            height: 0,
        }
    }
}

/// The per-block working set. See the module documentation.
pub struct ProcessList {
    pub db_height: DbHeight,
    pub fed_servers: Vec<Server>,
    pub audit_servers: Vec<Server>,
    pub vms: Vec<Vm>,
    pub system: SystemList,
    /// The highest system height any end-of-minute marker has claimed for this block.
    pub sys_highest: usize,

    pub admin_block: AdminBlock,
    pub entry_credit_block: EntryCreditBlock,
    pub directory_block: DirectoryBlock,

    pub new_eblocks: HashMap<ChainId, EBlock>,
    pub new_entries: HashMap<CryptoHash, Entry>,
    /// Chains whose head is about to change because a reveal was recorded but not yet built into
    /// an entry block.
    pub pending_chain_heads: HashSet<ChainId>,

    pub factoid_balances_t: Mutex<HashMap<Address, i64>>,
    pub ec_balances_t: Mutex<HashMap<Address, i64>>,

    pub dbsig_already_sent: bool,
    diff_sig_tally: usize,
}

impl ProcessList {
    pub fn new(
        db_height: DbHeight,
        fed_servers: Vec<Server>,
        audit_servers: Vec<Server>,
        timestamp: Timestamp,
    ) -> Self {
        let vms = (0..fed_servers.len()).map(|_| Vm::new()).collect();
        Self {
            db_height,
            fed_servers,
            audit_servers,
            vms,
            system: SystemList::new(),
            sys_highest: 0,
            admin_block: AdminBlock::new(db_height),
            entry_credit_block: EntryCreditBlock::new(db_height),
            directory_block: DirectoryBlock::new(db_height, timestamp),
            new_eblocks: HashMap::new(),
            new_entries: HashMap::new(),
            pending_chain_heads: HashSet::new(),
            factoid_balances_t: Mutex::new(HashMap::new()),
            ec_balances_t: Mutex::new(HashMap::new()),
            dbsig_already_sent: false,
            diff_sig_tally: 0,
        }
    }

    pub fn fed_server_count(&self) -> usize {
        self.fed_servers.len()
    }

    /// Position of `server_id` among the federated servers, if it holds a seat.
    pub fn fed_server_index(&self, server_id: &ServerId) -> Option<usize> {
        self.fed_servers.iter().position(|s| &s.id == server_id)
    }

    /// The VM a chain-bound message hashing to `hash` belongs to.
    pub fn vm_index_for(&self, hash: &CryptoHash) -> VmIndex {
        let n = self.fed_servers.len().max(1) as u64;
        VmIndex::new((hash.to_u64() % n) as u8)
    }

    /// Leadership for `server_id` at `minute`: whether it holds a federated seat, and which VM it
    /// leads. VM responsibility rotates by one seat per minute so that every federated server
    /// signs every VM over the course of a block.
    pub fn get_virtual_servers(&self, minute: Minute, server_id: &ServerId) -> (bool, VmIndex) {
        match self.fed_server_index(server_id) {
            Some(index) => {
                let n = self.fed_servers.len();
                let vm = (index + minute.int() as usize) % n;
                (true, VmIndex::new(vm as u8))
            }
            None => (false, VmIndex::new(0)),
        }
    }

    /// Insert an `(ack, msg)` pair at the slot the ack stamps. Returns false without mutating if
    /// the slot is occupied, the VM index is out of range, or the ack's serial hash does not chain
    /// from the previous slot.
    pub fn add_to_process_list(&mut self, ack: Ack, msg: Message) -> bool {
        let vm = match self.vms.get_mut(ack.vm_index.index()) {
            Some(vm) => vm,
            None => return false,
        };
        let position = ack.height.index();

        if vm.list.len() > position && vm.list[position].is_some() {
            return false;
        }

        if position == 0 {
            if ack.serial_hash != ack.message_hash {
                return false;
            }
        } else if let Some(Some((prev_ack, _))) = vm.list.get(position - 1) {
            if prev_ack.next_serial_hash(&ack.message_hash) != ack.serial_hash {
                return false;
            }
        }

        while vm.list.len() <= position {
            vm.list.push(None);
        }
        vm.list[position] = Some((ack, msg));
        true
    }

    /// Insert a full fault at the system slot it claims.
    pub fn add_to_system_list(&mut self, system_height: u32, msg: Message) -> bool {
        let position = system_height as usize;
        if self.system.list.len() > position && self.system.list[position].is_some() {
            return false;
        }
        while self.system.list.len() <= position {
            self.system.list.push(None);
        }
        self.system.list[position] = Some(msg);
        true
    }

    pub fn get_ack_at(&self, vm_index: VmIndex, position: usize) -> Option<&Ack> {
        self.vms
            .get(vm_index.index())?
            .list
            .get(position)?
            .as_ref()
            .map(|(ack, _)| ack)
    }

    /// The `(ack, msg)` pair at a slot, if that slot is filled.
    pub fn get_slot(&self, vm_index: VmIndex, position: usize) -> Option<&(Ack, Message)> {
        self.vms.get(vm_index.index())?.list.get(position)?.as_ref()
    }

    /// Append `server_id` to the audit pool if absent; either way return its position.
    pub fn add_audit_server(&mut self, server_id: ServerId) -> usize {
        if let Some(index) = self.audit_servers.iter().position(|s| s.id == server_id) {
            return index;
        }
        self.audit_servers.push(Server::new(server_id));
        self.audit_servers.len() - 1
    }

    pub fn remove_audit_server(&mut self, server_id: &ServerId) {
        self.audit_servers.retain(|s| &s.id != server_id);
    }

    pub fn new_eblock(&self, chain_id: &ChainId) -> Option<&EBlock> {
        self.new_eblocks.get(chain_id)
    }

    pub fn add_new_eblock(&mut self, chain_id: ChainId, eblock: EBlock) {
        self.new_eblocks.insert(chain_id, eblock);
        // Once the entry block exists, the chain head is no longer merely pending.
        self.pending_chain_heads.remove(&chain_id);
    }

    pub fn add_new_entry(&mut self, entry_hash: CryptoHash, entry: Entry) {
        self.new_entries.insert(entry_hash, entry);
    }

    pub fn is_pending_chain_head(&self, chain_id: &ChainId) -> bool {
        self.pending_chain_heads.contains(chain_id)
    }

    pub fn put_pending_chain_head(&mut self, chain_id: ChainId) {
        self.pending_chain_heads.insert(chain_id);
    }

    pub fn reset_diff_sig_tally(&mut self) {
        self.diff_sig_tally = 0;
    }

    pub fn increment_diff_sig_tally(&mut self) {
        self.diff_sig_tally += 1;
    }

    /// Whether the directory block signatures that disagree with ours stay short of a majority.
    pub fn check_diff_sig_tally(&self) -> bool {
        self.diff_sig_tally < self.fed_servers.len() / 2 + 1
    }

    /// Whether every VM has processed a non-empty list to its tail.
    pub fn complete(&self) -> bool {
        !self.vms.is_empty()
            && self
                .vms
                .iter()
                .all(|vm| !vm.list.is_empty() && vm.is_at_tail())
    }

    /// Build a request for the slots of `vm_index` in `[from, to]` that this node never received.
    pub fn ask(&self, asker: ServerId, vm_index: VmIndex, from: u32, to: u32) -> Option<MissingMsg> {
        let vm = self.vms.get(vm_index.index())?;
        let mut wanted = Vec::new();
        for position in from..=to {
            match vm.list.get(position as usize) {
                Some(Some(_)) => {}
                _ => wanted.push(ListHeight::new(position)),
            }
        }
        if wanted.is_empty() {
            return None;
        }
        Some(MissingMsg {
            asker,
            db_height: self.db_height,
            vm_index,
            system_height: self.system.height as u32,
            process_list_heights: wanted,
        })
    }

    /// Clear the fault bookkeeping of one VM.
    pub fn mark_no_fault(&mut self, vm_index: VmIndex) {
        if let Some(vm) = self.vms.get_mut(vm_index.index()) {
            vm.when_faulted = 0;
            vm.fault_flag = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MissingMsg as MissingMsgPayload, Payload};
    use crate::types::data_types::{SaltNumber, SignatureBytes};

    fn server(seed: u8) -> Server {
        Server::new(ServerId::new([seed; 32]))
    }

    fn test_pl(n: u8) -> ProcessList {
        let feds = (0..n).map(server).collect();
        ProcessList::new(DbHeight::new(5), feds, Vec::new(), Timestamp::new(1_000))
    }

    fn test_msg(seed: u32) -> Message {
        Message::new(
            Payload::MissingMsg(MissingMsgPayload {
                asker: ServerId::zero(),
                db_height: DbHeight::new(seed),
                vm_index: VmIndex::new(0),
                system_height: 0,
                process_list_heights: vec![],
            }),
            Timestamp::new(1_000),
        )
    }

    fn ack_for(msg: &Message, height: u32, prev: Option<&Ack>) -> Ack {
        let message_hash = msg.msg_hash();
        let serial_hash = match prev {
            Some(prev) => prev.next_serial_hash(&message_hash),
            None => message_hash,
        };
        Ack {
            db_height: DbHeight::new(5),
            vm_index: VmIndex::new(0),
            height: ListHeight::new(height),
            minute: Minute::new(0),
            timestamp: Timestamp::new(1_000),
            salt: [0u8; 8],
            salt_number: SaltNumber::new(0),
            message_hash,
            serial_hash,
            leader_chain_id: ServerId::zero(),
            balance_hash: None,
            signature: SignatureBytes::zero(),
        }
    }

    #[test]
    fn slots_fill_densely_and_chain_serial_hashes() {
        let mut pl = test_pl(1);
        let first = test_msg(1);
        let second = test_msg(2);

        let first_ack = ack_for(&first, 0, None);
        assert!(pl.add_to_process_list(first_ack.clone(), first));
        let second_ack = ack_for(&second, 1, Some(&first_ack));
        assert!(pl.add_to_process_list(second_ack, second));

        let vm = &pl.vms[0];
        assert_eq!(vm.list.len(), 2);
        assert!(vm.list.iter().all(|slot| slot.is_some()));
    }

    #[test]
    fn a_broken_serial_hash_is_rejected() {
        let mut pl = test_pl(1);
        let first = test_msg(1);
        let first_ack = ack_for(&first, 0, None);
        assert!(pl.add_to_process_list(first_ack, first));

        let second = test_msg(2);
        let mut bad_ack = ack_for(&second, 1, None);
        // Serial hash claims a fresh chain rather than chaining from slot 0.
        bad_ack.serial_hash = bad_ack.message_hash;
        assert!(!pl.add_to_process_list(bad_ack, second));
    }

    #[test]
    fn occupied_slots_are_never_overwritten() {
        let mut pl = test_pl(1);
        let msg = test_msg(1);
        let ack = ack_for(&msg, 0, None);
        assert!(pl.add_to_process_list(ack.clone(), msg.clone()));
        assert!(!pl.add_to_process_list(ack, msg));
    }

    #[test]
    fn leadership_rotates_by_minute() {
        let pl = test_pl(3);
        let id = pl.fed_servers[1].id;
        let (leader, vm0) = pl.get_virtual_servers(Minute::new(0), &id);
        let (_, vm1) = pl.get_virtual_servers(Minute::new(1), &id);
        assert!(leader);
        assert_eq!(vm0, VmIndex::new(1));
        assert_eq!(vm1, VmIndex::new(2));

        let stranger = ServerId::new([99u8; 32]);
        let (leader, _) = pl.get_virtual_servers(Minute::new(0), &stranger);
        assert!(!leader);
    }

    #[test]
    fn ask_lists_only_the_gaps() {
        let mut pl = test_pl(1);
        let first = test_msg(1);
        let first_ack = ack_for(&first, 0, None);
        pl.add_to_process_list(first_ack, first);

        let asker = ServerId::new([8u8; 32]);
        let request = pl.ask(asker, VmIndex::new(0), 0, 2).unwrap();
        assert_eq!(
            request.process_list_heights,
            vec![ListHeight::new(1), ListHeight::new(2)]
        );
        assert!(pl.ask(asker, VmIndex::new(0), 0, 0).is_none());
    }
}
