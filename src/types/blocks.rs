/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Typed block objects assembled by the consensus core.
//!
//! The core treats blocks as *structured values with stable digests*: it appends entries, minute
//! markers and admin records, links a block to its predecessor, and reads `key_mr`/`body_mr`
//! digests back out. The exact binary layout a production network would hash is a storage concern;
//! here every digest is the SHA-256 of the value's borsh encoding, which keeps digests stable,
//! collision-resistant and cheap to recompute.

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{
    Address, ChainId, CryptoHash, DbHeight, EntryCredits, ServerId, SignatureBytes, Timestamp,
};

/// Header of a directory block. `body_mr` commits to the admin, entry credit, factoid and entry
/// blocks referenced by the body; `prev_key_mr`/`prev_full_hash` chain blocks together.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DirectoryBlockHeader {
    pub db_height: DbHeight,
    pub timestamp: Timestamp,
    pub body_mr: CryptoHash,
    pub prev_key_mr: CryptoHash,
    pub prev_full_hash: CryptoHash,
}

impl DirectoryBlockHeader {
    pub fn marshal_binary(&self) -> Vec<u8> {
        borsh::to_vec(self)
            .expect("borsh serialization of a directory block header cannot fail")
    }
}

/// A directory block: the per-ten-minutes root object that the whole protocol exists to agree on.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DirectoryBlock {
    pub header: DirectoryBlockHeader,
}

impl DirectoryBlock {
    /// Start an empty directory block at `db_height`. Links and the body Merkle root are filled in
    /// when the block closes.
    pub fn new(db_height: DbHeight, timestamp: Timestamp) -> Self {
        Self {
            header: DirectoryBlockHeader {
                db_height,
                timestamp,
                body_mr: CryptoHash::zero(),
                prev_key_mr: CryptoHash::zero(),
                prev_full_hash: CryptoHash::zero(),
            },
        }
    }

    pub fn db_height(&self) -> DbHeight {
        self.header.db_height
    }

    /// The key Merkle root: digest of the header, which in turn commits to the body.
    pub fn key_mr(&self) -> CryptoHash {
        CryptoHash::of(&self.header.marshal_binary())
    }

    /// The full hash covers the complete block value, links included.
    pub fn full_hash(&self) -> CryptoHash {
        let bytes = borsh::to_vec(self)
            .expect("borsh serialization of a directory block cannot fail");
        CryptoHash::of(&bytes)
    }

    /// Commit the body to the header given the digests of the component blocks.
    pub fn set_body(&mut self, component_digests: &[CryptoHash]) {
        let mut bytes = Vec::with_capacity(component_digests.len() * 32);
        for digest in component_digests {
            bytes.extend_from_slice(&digest.bytes());
        }
        self.header.body_mr = CryptoHash::of(&bytes);
    }

    /// Chain this block to its predecessor.
    pub fn link_to(&mut self, prev: &DirectoryBlock) {
        self.header.prev_key_mr = prev.key_mr();
        self.header.prev_full_hash = prev.full_hash();
    }
}

/// One record in an admin block.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum AdminRecord {
    /// A federated server's signature over the previous directory block header.
    DirectoryBlockSignature {
        server_id: ServerId,
        signature: SignatureBytes,
    },
    AddFederatedServer {
        server_id: ServerId,
    },
    AddAuditServer {
        server_id: ServerId,
    },
    RemoveFederatedServer {
        server_id: ServerId,
    },
    AddFederatedServerSigningKey {
        server_id: ServerId,
        key: [u8; 32],
    },
    AddFederatedServerBitcoinAnchorKey {
        server_id: ServerId,
        key_priority: u8,
        key_type: u8,
        key: [u8; 20],
    },
    AddMatryoshkaHash {
        server_id: ServerId,
        hash: CryptoHash,
    },
}

/// The admin block records authority-set changes and the directory block signatures collected for
/// the previous block.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct AdminBlock {
    pub db_height: DbHeight,
    pub records: Vec<AdminRecord>,
}

impl AdminBlock {
    pub fn new(db_height: DbHeight) -> Self {
        Self {
            db_height,
            records: Vec::new(),
        }
    }

    pub fn add_db_signature(&mut self, server_id: ServerId, signature: SignatureBytes) {
        self.records.push(AdminRecord::DirectoryBlockSignature {
            server_id,
            signature,
        });
    }

    pub fn add_federated_server(&mut self, server_id: ServerId) {
        self.records.push(AdminRecord::AddFederatedServer { server_id });
    }

    pub fn add_audit_server(&mut self, server_id: ServerId) {
        self.records.push(AdminRecord::AddAuditServer { server_id });
    }

    pub fn remove_federated_server(&mut self, server_id: ServerId) {
        self.records
            .push(AdminRecord::RemoveFederatedServer { server_id });
    }

    pub fn add_federated_server_signing_key(&mut self, server_id: ServerId, key: [u8; 32]) {
        self.records
            .push(AdminRecord::AddFederatedServerSigningKey { server_id, key });
    }

    pub fn add_federated_server_bitcoin_anchor_key(
        &mut self,
        server_id: ServerId,
        key_priority: u8,
        key_type: u8,
        key: [u8; 20],
    ) {
        self.records
            .push(AdminRecord::AddFederatedServerBitcoinAnchorKey {
                server_id,
                key_priority,
                key_type,
                key,
            });
    }

    pub fn add_matryoshka_hash(&mut self, server_id: ServerId, hash: CryptoHash) {
        self.records
            .push(AdminRecord::AddMatryoshkaHash { server_id, hash });
    }

    pub fn digest(&self) -> CryptoHash {
        let bytes = borsh::to_vec(self)
            .expect("borsh serialization of an admin block cannot fail");
        CryptoHash::of(&bytes)
    }
}

/// A factoid transaction, reduced to what the consensus core inspects: its signature hash (the
/// replay key), its timestamp, and its flows for balance updates.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct FactoidTransaction {
    pub sig_hash: CryptoHash,
    pub timestamp: Timestamp,
    pub inputs: Vec<(Address, u64)>,
    pub outputs: Vec<(Address, u64)>,
}

/// A factoid block. The first transaction is the coinbase and is exempt from replay scanning.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct FactoidBlock {
    pub db_height: DbHeight,
    pub transactions: Vec<FactoidTransaction>,
}

impl FactoidBlock {
    pub fn new(db_height: DbHeight) -> Self {
        Self {
            db_height,
            transactions: Vec::new(),
        }
    }

    pub fn digest(&self) -> CryptoHash {
        let bytes = borsh::to_vec(self)
            .expect("borsh serialization of a factoid block cannot fail");
        CryptoHash::of(&bytes)
    }
}

/// One element of the entry credit block body.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum EcRecord {
    CommitChain {
        entry_hash: CryptoHash,
        credits: EntryCredits,
        timestamp: Timestamp,
    },
    CommitEntry {
        entry_hash: CryptoHash,
        credits: EntryCredits,
        timestamp: Timestamp,
    },
    /// Placed at the close of each minute. One-based.
    MinuteNumber(u8),
}

/// The entry credit block interleaves the commits paid during a block with the minute markers that
/// delimit them.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct EntryCreditBlock {
    pub db_height: DbHeight,
    pub body: Vec<EcRecord>,
}

impl EntryCreditBlock {
    pub fn new(db_height: DbHeight) -> Self {
        Self {
            db_height,
            body: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, record: EcRecord) {
        self.body.push(record);
    }

    pub fn digest(&self) -> CryptoHash {
        let bytes = borsh::to_vec(self)
            .expect("borsh serialization of an entry credit block cannot fail");
        CryptoHash::of(&bytes)
    }
}

/// Constructor mirroring the block factory the core consumes for minute markers.
pub fn new_minute_number(marker: u8) -> EcRecord {
    EcRecord::MinuteNumber(marker)
}

/// Header of an entry block.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct EBlockHeader {
    pub chain_id: ChainId,
    pub db_height: DbHeight,
    pub eb_sequence: u32,
    pub prev_key_mr: CryptoHash,
    pub prev_full_hash: CryptoHash,
}

/// One element of an entry block body: an entry hash, or the marker that closes a minute.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum EBlockElement {
    EntryHash(CryptoHash),
    EndOfMinute(u8),
}

/// An entry block: the per-chain, per-directory-block list of entry hashes.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct EBlock {
    pub header: EBlockHeader,
    pub body: Vec<EBlockElement>,
}

impl EBlock {
    /// Start the first entry block of a brand new chain.
    pub fn new(chain_id: ChainId, db_height: DbHeight) -> Self {
        Self {
            header: EBlockHeader {
                chain_id,
                db_height,
                eb_sequence: 0,
                prev_key_mr: CryptoHash::zero(),
                prev_full_hash: CryptoHash::zero(),
            },
            body: Vec::new(),
        }
    }

    /// Start the successor of `prev` for the same chain at `db_height`.
    pub fn new_from_prev(prev: &EBlock, db_height: DbHeight) -> Self {
        Self {
            header: EBlockHeader {
                chain_id: prev.header.chain_id,
                db_height,
                eb_sequence: prev.header.eb_sequence + 1,
                prev_key_mr: prev.key_mr(),
                prev_full_hash: prev.full_hash(),
            },
            body: Vec::new(),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.header.chain_id
    }

    pub fn add_entry(&mut self, entry_hash: CryptoHash) {
        self.body.push(EBlockElement::EntryHash(entry_hash));
    }

    pub fn add_end_of_minute_marker(&mut self, marker: u8) {
        self.body.push(EBlockElement::EndOfMinute(marker));
    }

    pub fn key_mr(&self) -> CryptoHash {
        let bytes = borsh::to_vec(self)
            .expect("borsh serialization of an entry block cannot fail");
        CryptoHash::of(&bytes)
    }

    pub fn full_hash(&self) -> CryptoHash {
        CryptoHash::combine(&self.key_mr(), &self.header.prev_full_hash)
    }
}

/// An entry revealed into a chain.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Entry {
    pub chain_id: ChainId,
    pub content: Vec<u8>,
}

impl Entry {
    pub fn new(chain_id: ChainId, content: Vec<u8>) -> Self {
        Self { chain_id, content }
    }

    pub fn hash(&self) -> CryptoHash {
        let bytes = borsh::to_vec(self)
            .expect("borsh serialization of an entry cannot fail");
        CryptoHash::of(&bytes)
    }
}
