/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages passed between nodes and through the consensus core.
//!
//! ## Message = Envelope + Payload
//!
//! Every message the core routes is a [`Message`]: a [`Payload`] (the tagged variant that decides
//! which execution path the message takes) wrapped in an [`Envelope`] (the routing fields that are
//! common to every variant: timestamp, VM assignment, minute stamp, locality and the one-shot
//! invalid-broadcast flag).
//!
//! ## Identity hashes
//!
//! A message has two identities:
//! 1. Its [`msg_hash`](Message::msg_hash): the digest of its canonical payload. This is the key of
//!    the holding map and the hash acknowledged by an [`Ack`].
//! 2. Its [`repeat_hash`](Message::repeat_hash): the digest of payload plus timestamp. This is the
//!    key sealed into the replay filter, so a re-issued copy of the same logical message (new
//!    timestamp) is not confused with a replayed one.
//!
//! Processing flags that mutate while a message sits in a process list (a directory block
//! signature's `matches` flag, a full fault's vote tally) are excluded from both digests by
//! [`Payload::canonical`].

pub mod ack;

pub mod admin;

pub mod entry;

pub mod fault;

pub mod minute;

pub mod sync;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{CryptoHash, Minute, ServerId, Timestamp, VmIndex};

pub use ack::Ack;
pub use admin::{AddServer, ChangeServerKey, RemoveServer};
pub use entry::{CommitChain, CommitEntry, RevealEntry};
pub use fault::{FaultSignature, FullServerFault, ServerFault};
pub use minute::{DirectoryBlockSignature, EndOfMinute};
pub use sync::{BlockSnapshot, DataObject, DataResponse, Heartbeat, MissingMsg, MissingMsgResponse};

/// Routing fields common to every message variant.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Envelope {
    pub timestamp: Timestamp,
    pub vm_index: VmIndex,
    pub minute: Minute,
    pub leader_chain_id: ServerId,
    pub is_local: bool,
    pub is_peer_to_peer: bool,
    pub sent_invalid: bool,
}

impl Envelope {
    pub fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            vm_index: VmIndex::new(0),
            minute: Minute::new(0),
            leader_chain_id: ServerId::zero(),
            is_local: false,
            is_peer_to_peer: false,
            sent_invalid: false,
        }
    }
}

/// The tagged message variant.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum Payload {
    Ack(Ack),
    EndOfMinute(EndOfMinute),
    DirectoryBlockSignature(DirectoryBlockSignature),
    CommitChain(CommitChain),
    CommitEntry(CommitEntry),
    RevealEntry(RevealEntry),
    BlockSnapshot(BlockSnapshot),
    MissingMsg(MissingMsg),
    MissingMsgResponse(MissingMsgResponse),
    DataResponse(DataResponse),
    ServerFault(ServerFault),
    FullServerFault(FullServerFault),
    AddServer(AddServer),
    RemoveServer(RemoveServer),
    ChangeServerKey(ChangeServerKey),
    Heartbeat(Heartbeat),
}

impl Payload {
    /// The payload with all processing flags reset, so that digests are stable across the
    /// message's lifetime inside a process list.
    fn canonical(&self) -> Payload {
        match self {
            Payload::DirectoryBlockSignature(dbs) => {
                let mut canonical = dbs.clone();
                canonical.matches = false;
                Payload::DirectoryBlockSignature(canonical)
            }
            Payload::FullServerFault(ff) => {
                let mut canonical = ff.clone();
                canonical.already_processed = false;
                canonical.my_vote_tallied = false;
                canonical.pledge_done = false;
                canonical.last_match_secs = 0;
                canonical.fault_votes.clear();
                Payload::FullServerFault(canonical)
            }
            other => other.clone(),
        }
    }

    /// Short PascalCase name of the variant, used by the CSV logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Ack(_) => "Ack",
            Payload::EndOfMinute(_) => "EndOfMinute",
            Payload::DirectoryBlockSignature(_) => "DirectoryBlockSignature",
            Payload::CommitChain(_) => "CommitChain",
            Payload::CommitEntry(_) => "CommitEntry",
            Payload::RevealEntry(_) => "RevealEntry",
            Payload::BlockSnapshot(_) => "BlockSnapshot",
            Payload::MissingMsg(_) => "MissingMsg",
            Payload::MissingMsgResponse(_) => "MissingMsgResponse",
            Payload::DataResponse(_) => "DataResponse",
            Payload::ServerFault(_) => "ServerFault",
            Payload::FullServerFault(_) => "FullServerFault",
            Payload::AddServer(_) => "AddServer",
            Payload::RemoveServer(_) => "RemoveServer",
            Payload::ChangeServerKey(_) => "ChangeServerKey",
            Payload::Heartbeat(_) => "Heartbeat",
        }
    }
}

/// A payload plus its envelope: the unit that queues, the holding map and process lists deal in.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Message {
    pub envelope: Envelope,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload, timestamp: Timestamp) -> Self {
        Self {
            envelope: Envelope::at(timestamp),
            payload,
        }
    }

    /// The digest of the canonical payload. Two copies of the same logical message have the same
    /// `msg_hash` even if their envelopes differ.
    ///
    /// A reveal's message hash is its entry hash: acknowledgements, the holding store and the
    /// commit registry all pair reveals by the hash of the revealed entry.
    pub fn msg_hash(&self) -> CryptoHash {
        if let Payload::RevealEntry(re) = &self.payload {
            return re.entry_hash();
        }
        let bytes = borsh::to_vec(&self.payload.canonical())
            .expect("borsh serialization of a payload cannot fail");
        CryptoHash::of(&bytes)
    }

    /// The digest sealed into the replay filter: payload plus timestamp, so that a deliberately
    /// re-issued message is distinguishable from a replayed one.
    pub fn repeat_hash(&self) -> CryptoHash {
        let mut bytes = borsh::to_vec(&self.payload.canonical())
            .expect("borsh serialization of a payload cannot fail");
        bytes.extend_from_slice(&self.envelope.timestamp.millis().to_le_bytes());
        CryptoHash::of(&bytes)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.envelope.timestamp
    }

    pub fn vm_index(&self) -> VmIndex {
        self.envelope.vm_index
    }

    pub fn set_vm_index(&mut self, vm_index: VmIndex) {
        self.envelope.vm_index = vm_index;
    }

    pub fn minute(&self) -> Minute {
        self.envelope.minute
    }

    pub fn set_minute(&mut self, minute: Minute) {
        self.envelope.minute = minute;
    }

    pub fn leader_chain_id(&self) -> ServerId {
        self.envelope.leader_chain_id
    }

    pub fn set_leader_chain_id(&mut self, id: ServerId) {
        self.envelope.leader_chain_id = id;
    }

    pub fn is_local(&self) -> bool {
        self.envelope.is_local
    }

    pub fn set_local(&mut self, local: bool) {
        self.envelope.is_local = local;
    }

    pub fn is_peer_to_peer(&self) -> bool {
        self.envelope.is_peer_to_peer
    }

    pub fn sent_invalid(&self) -> bool {
        self.envelope.sent_invalid
    }

    pub fn mark_sent_invalid(&mut self) {
        self.envelope.sent_invalid = true;
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// The content hash that binds this message to a virtual server, for the variants that are
    /// assigned by consistent hashing rather than carrying an explicit VM index.
    pub fn chain_binding(&self) -> Option<CryptoHash> {
        match &self.payload {
            Payload::CommitChain(cc) => Some(cc.entry_hash),
            Payload::CommitEntry(ce) => Some(ce.entry_hash),
            Payload::RevealEntry(re) => Some(re.entry.chain_id.as_hash()),
            Payload::AddServer(add) => Some(CryptoHash::new(add.server_id.bytes())),
            Payload::RemoveServer(rm) => Some(CryptoHash::new(rm.server_id.bytes())),
            Payload::ChangeServerKey(ck) => Some(CryptoHash::new(ck.identity_chain_id.bytes())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_types::DbHeight;

    #[test]
    fn msg_hash_ignores_the_envelope() {
        let payload = Payload::MissingMsg(MissingMsg {
            asker: ServerId::zero(),
            db_height: DbHeight::new(4),
            vm_index: VmIndex::new(1),
            system_height: 0,
            process_list_heights: vec![],
        });
        let a = Message::new(payload.clone(), Timestamp::new(1_000));
        let mut b = Message::new(payload, Timestamp::new(2_000));
        b.set_vm_index(VmIndex::new(3));
        assert_eq!(a.msg_hash(), b.msg_hash());
        assert_ne!(a.repeat_hash(), b.repeat_hash());
    }

    #[test]
    fn processing_flags_do_not_change_digests() {
        let ff = FullServerFault {
            fault: ServerFault {
                server_id: ServerId::zero(),
                audit_server_id: ServerId::zero(),
                vm_index: VmIndex::new(0),
                db_height: DbHeight::new(9),
                height: crate::types::data_types::ListHeight::new(2),
                system_height: 0,
                timestamp: Timestamp::new(5),
                signature: crate::types::data_types::SignatureBytes::zero(),
            },
            clear_fault: false,
            signature_list: vec![],
            already_processed: false,
            my_vote_tallied: false,
            pledge_done: false,
            last_match_secs: 0,
            fault_votes: vec![],
        };
        let msg = Message::new(Payload::FullServerFault(ff), Timestamp::new(5));
        let before = msg.msg_hash();
        let mut mutated = msg.clone();
        if let Payload::FullServerFault(ff) = &mut mutated.payload {
            ff.already_processed = true;
            ff.fault_votes.push([1u8; 32]);
        }
        assert_eq!(before, mutated.msg_hash());
    }
}
