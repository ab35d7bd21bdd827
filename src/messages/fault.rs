/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fault messages: accusations that a federated server has stalled, and the aggregated form that
//! swaps it for an audit server.
//!
//! A [`ServerFault`] is a single server's vote to replace `server_id` with `audit_server_id`. A
//! [`FullServerFault`] aggregates those votes into one message carrying the whole signature list;
//! it executes once it holds signatures from a quorum of federated servers *and* a pledge from the
//! nominated audit server itself. The pledge requirement keeps the protocol from promoting a
//! server that is just as dead as the one being demoted.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use crate::types::{
    crypto_primitives::{contexts, verify_signature, Keypair},
    data_types::{CryptoHash, DbHeight, ListHeight, ServerId, SignatureBytes, Timestamp, VmIndex},
};

/// One server's vote to replace a faulted federated server with a nominated audit server.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ServerFault {
    /// The federated server being accused.
    pub server_id: ServerId,
    /// The audit server nominated to take its place.
    pub audit_server_id: ServerId,
    pub vm_index: VmIndex,
    pub db_height: DbHeight,
    /// The VM list height at which the accused server stalled.
    pub height: ListHeight,
    pub system_height: u32,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}

impl ServerFault {
    /// The digest every voter signs: the fault's identifying fields, with neither timestamp nor
    /// signature. Two servers accusing the same stall produce the same core hash.
    pub fn core_hash(&self) -> CryptoHash {
        let core = (
            self.server_id,
            self.audit_server_id,
            self.vm_index,
            self.db_height,
            self.height,
            self.system_height,
        );
        let bytes = borsh::to_vec(&core)
            .expect("borsh serialization of a fault core cannot fail");
        CryptoHash::of(&bytes)
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign(contexts::SERVER_FAULT, &self.core_hash().bytes());
    }

    pub fn is_correct(&self, verifying_key: &VerifyingKey) -> bool {
        verify_signature(
            verifying_key,
            contexts::SERVER_FAULT,
            &self.core_hash().bytes(),
            &self.signature,
        )
    }
}

/// A signature over a fault's core hash, tagged with the raw key bytes of its issuer.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct FaultSignature {
    pub key: [u8; 32],
    pub signature: SignatureBytes,
}

/// The aggregated fault: a [`ServerFault`] plus the signature list collected for it.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct FullServerFault {
    pub fault: ServerFault,
    /// When set, the accused leader came back online: tallies are abandoned and the fault is
    /// considered processed without any promotion.
    pub clear_fault: bool,
    pub signature_list: Vec<FaultSignature>,

    // Processing flags, excluded from digests.
    pub already_processed: bool,
    pub my_vote_tallied: bool,
    pub pledge_done: bool,
    pub last_match_secs: i64,
    /// Issuer IDs whose signatures have been verified and tallied.
    pub fault_votes: Vec<[u8; 32]>,
}

impl FullServerFault {
    pub fn new(fault: ServerFault) -> Self {
        Self {
            fault,
            clear_fault: false,
            signature_list: Vec::new(),
            already_processed: false,
            my_vote_tallied: false,
            pledge_done: false,
            last_match_secs: 0,
            fault_votes: Vec::new(),
        }
    }

    pub fn core_hash(&self) -> CryptoHash {
        self.fault.core_hash()
    }

    pub fn db_height(&self) -> DbHeight {
        self.fault.db_height
    }

    /// Serial digest over the signature list, stamped into end-of-minute markers as `sys_hash`.
    pub fn serial_hash(&self) -> CryptoHash {
        let mut serial = self.core_hash();
        for sig in &self.signature_list {
            serial = CryptoHash::combine(&serial, &CryptoHash::of(&sig.signature.bytes()));
        }
        serial
    }

    /// Record a verified vote. Voting is idempotent per issuer.
    pub fn add_fault_vote(&mut self, issuer: [u8; 32]) {
        if !self.fault_votes.contains(&issuer) {
            self.fault_votes.push(issuer);
        }
    }

    pub fn sig_tally(&self) -> usize {
        self.fault_votes.len()
    }

    /// Whether the tallied votes reach the promotion quorum `⌈2N/3⌉` for `fed_count` federated
    /// servers.
    pub fn has_enough_sigs(&self, fed_count: usize) -> bool {
        fed_count > 0 && self.sig_tally() >= (2 * fed_count + 2) / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fault() -> ServerFault {
        ServerFault {
            server_id: ServerId::new([1u8; 32]),
            audit_server_id: ServerId::new([2u8; 32]),
            vm_index: VmIndex::new(1),
            db_height: DbHeight::new(12),
            height: ListHeight::new(4),
            system_height: 0,
            timestamp: Timestamp::new(77),
            signature: SignatureBytes::zero(),
        }
    }

    #[test]
    fn core_hash_ignores_timestamp_and_signature() {
        let a = test_fault();
        let mut b = test_fault();
        b.timestamp = Timestamp::new(9_999);
        b.signature = SignatureBytes::new([3u8; 64]);
        assert_eq!(a.core_hash(), b.core_hash());

        let mut c = test_fault();
        c.height = ListHeight::new(5);
        assert_ne!(a.core_hash(), c.core_hash());
    }

    #[test]
    fn quorum_is_two_thirds_rounded_up() {
        let mut ff = FullServerFault::new(test_fault());
        for i in 0..2u8 {
            ff.add_fault_vote([i; 32]);
        }
        assert!(ff.has_enough_sigs(3)); // ⌈2·3/3⌉ = 2
        assert!(!ff.has_enough_sigs(4)); // ⌈2·4/3⌉ = 3

        ff.add_fault_vote([9; 32]);
        assert!(ff.has_enough_sigs(4));
    }

    #[test]
    fn votes_are_idempotent_per_issuer() {
        let mut ff = FullServerFault::new(test_fault());
        ff.add_fault_vote([5; 32]);
        ff.add_fault_vote([5; 32]);
        assert_eq!(ff.sig_tally(), 1);
    }
}
