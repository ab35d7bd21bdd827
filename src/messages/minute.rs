/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The two synchronization markers that drive the minute and block advance state machine.
//!
//! An [`EndOfMinute`] closes one minute of one virtual server's stream; a minute completes only
//! when every federated VM has contributed its marker. A [`DirectoryBlockSignature`] opens a block:
//! it is each federated server's signature over the *previous* directory block's header, and the
//! new block's process lists only start filling once the signatures synchronize the same way the
//! minute markers do.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use crate::types::{
    blocks::DirectoryBlockHeader,
    crypto_primitives::{contexts, verify_signature, Keypair},
    data_types::{CryptoHash, DbHeight, Minute, ServerId, SignatureBytes, Timestamp, VmIndex},
};

/// The end-of-minute marker, one per VM per minute.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct EndOfMinute {
    pub db_height: DbHeight,
    pub vm_index: VmIndex,
    pub minute: Minute,
    /// Identity of the issuing federated server.
    pub server_id: ServerId,
    /// Height of the issuer's system (fault) list when the marker was issued. Followers refuse to
    /// close the minute until their own system list has caught up.
    pub sys_height: u32,
    /// Serial hash of the last system-list fault at issue time, if any.
    pub sys_hash: Option<CryptoHash>,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}

impl EndOfMinute {
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = SignatureBytes::zero();
        borsh::to_vec(&unsigned)
            .expect("borsh serialization of an end-of-minute marker cannot fail")
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign(contexts::END_OF_MINUTE, &self.signed_bytes());
    }

    pub fn is_correct(&self, verifying_key: &VerifyingKey) -> bool {
        verify_signature(
            verifying_key,
            contexts::END_OF_MINUTE,
            &self.signed_bytes(),
            &self.signature,
        )
    }
}

/// A federated server's signature over the previous directory block's header, one per VM per
/// block.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DirectoryBlockSignature {
    pub db_height: DbHeight,
    pub vm_index: VmIndex,
    /// Header of the directory block being signed, i.e. the block at `db_height - 1`.
    pub directory_block_header: DirectoryBlockHeader,
    pub server_identity_chain_id: ServerId,
    pub sys_height: u32,
    pub sys_hash: Option<CryptoHash>,
    pub timestamp: Timestamp,
    /// Signature over `directory_block_header.marshal_binary()`.
    pub signature: SignatureBytes,
    /// Set while processing, once the signed header has been checked against the ledger tail.
    /// Excluded from digests.
    pub matches: bool,
}

impl DirectoryBlockSignature {
    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign(
            contexts::DIRECTORY_BLOCK_SIGNATURE,
            &self.directory_block_header.marshal_binary(),
        );
    }

    pub fn is_correct(&self, verifying_key: &VerifyingKey) -> bool {
        verify_signature(
            verifying_key,
            contexts::DIRECTORY_BLOCK_SIGNATURE,
            &self.directory_block_header.marshal_binary(),
            &self.signature,
        )
    }
}
