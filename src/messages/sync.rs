/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Catch-up and gap-fill messages: completed block snapshots, missing-message requests and their
//! responses, raw data responses, and audit heartbeats.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{Ack, Message};
use crate::types::{
    blocks::{AdminBlock, DirectoryBlock, EBlock, Entry, EntryCreditBlock, FactoidBlock},
    crypto_primitives::{contexts, Keypair},
    data_types::{CryptoHash, DbHeight, ListHeight, SaltNumber, ServerId, SignatureBytes, VmIndex},
};

/// A complete, finalized block: the directory block and every component block it commits to.
/// Applied to the ledger as one unit.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BlockSnapshot {
    pub directory_block: DirectoryBlock,
    pub admin_block: AdminBlock,
    pub factoid_block: FactoidBlock,
    pub entry_credit_block: EntryCreditBlock,
    pub eblocks: Vec<EBlock>,
    pub entries: Vec<Entry>,
    /// True when this snapshot was loaded back out of the local database rather than received
    /// from the network.
    pub is_in_db: bool,
}

impl BlockSnapshot {
    pub fn db_height(&self) -> DbHeight {
        self.directory_block.db_height()
    }
}

/// Request for process-list slots this node never received. Responses go back to `asker` alone.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MissingMsg {
    pub asker: ServerId,
    pub db_height: DbHeight,
    pub vm_index: VmIndex,
    pub system_height: u32,
    pub process_list_heights: Vec<ListHeight>,
}

/// Response to a [`MissingMsg`]: either an `(ack, message)` pair filling a VM slot, or a full
/// fault filling a system-list slot.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MissingMsgResponse {
    pub ack_response: Option<Ack>,
    pub msg_response: Option<Box<Message>>,
}

/// The object carried by a [`DataResponse`].
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum DataObject {
    Entry(Entry),
    EBlock(EBlock),
}

/// Raw data delivered in response to an out-of-band data request.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DataResponse {
    pub data_object: DataObject,
}

impl DataResponse {
    /// Wire type code of the carried object: `0` for an entry, `1` for an entry block. The codes
    /// are fixed by the wire format.
    pub fn data_type(&self) -> u8 {
        match &self.data_object {
            DataObject::Entry(_) => 0,
            DataObject::EBlock(_) => 1,
        }
    }
}

/// Signed liveness beacon an audit server emits at each minute completion.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Heartbeat {
    pub db_height: DbHeight,
    pub secret_number: SaltNumber,
    pub dblock_hash: CryptoHash,
    pub identity_chain_id: ServerId,
    pub signature: SignatureBytes,
}

impl Heartbeat {
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = SignatureBytes::zero();
        borsh::to_vec(&unsigned)
            .expect("borsh serialization of a heartbeat cannot fail")
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign(contexts::HEARTBEAT, &self.signed_bytes());
    }
}
