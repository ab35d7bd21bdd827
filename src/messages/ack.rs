/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The acknowledgement: a leader's signed receipt that stamps a message into a slot of a virtual
//! server's list.
//!
//! An [`Ack`] fixes four things about the message it acknowledges: which process list it belongs to
//! (`db_height`), which virtual server stream it is in (`vm_index`), its position in that stream
//! (`height`), and the running [`serial_hash`](Ack::serial_hash) that commits to every
//! acknowledged message before it. The serial hash makes a VM list tamper-evident: a follower that
//! holds slot `h-1` can verify slot `h` with one digest.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use crate::types::{
    crypto_primitives::{contexts, verify_signature, Keypair},
    data_types::{
        CryptoHash, DbHeight, ListHeight, Minute, SaltNumber, ServerId, SignatureBytes, Timestamp,
        VmIndex,
    },
};

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Ack {
    pub db_height: DbHeight,
    pub vm_index: VmIndex,
    pub height: ListHeight,
    pub minute: Minute,
    pub timestamp: Timestamp,
    pub salt: [u8; 8],
    pub salt_number: SaltNumber,
    pub message_hash: CryptoHash,
    pub serial_hash: CryptoHash,
    pub leader_chain_id: ServerId,
    pub balance_hash: Option<CryptoHash>,
    pub signature: SignatureBytes,
}

impl Ack {
    /// The bytes covered by the leader's signature: every field except the signature itself.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = SignatureBytes::zero();
        borsh::to_vec(&unsigned)
            .expect("borsh serialization of an ack cannot fail")
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign(contexts::ACK, &self.signed_bytes());
    }

    pub fn is_correct(&self, verifying_key: &VerifyingKey) -> bool {
        verify_signature(
            verifying_key,
            contexts::ACK,
            &self.signed_bytes(),
            &self.signature,
        )
    }

    /// The serial hash a successor ack at `message_hash` must carry.
    pub fn next_serial_hash(&self, message_hash: &CryptoHash) -> CryptoHash {
        CryptoHash::combine(&self.serial_hash, message_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn test_ack() -> Ack {
        Ack {
            db_height: DbHeight::new(7),
            vm_index: VmIndex::new(0),
            height: ListHeight::new(0),
            minute: Minute::new(0),
            timestamp: Timestamp::new(42),
            salt: [0u8; 8],
            salt_number: SaltNumber::new(0),
            message_hash: CryptoHash::of(b"some message"),
            serial_hash: CryptoHash::of(b"some message"),
            leader_chain_id: ServerId::zero(),
            balance_hash: None,
            signature: SignatureBytes::zero(),
        }
    }

    #[test]
    fn signature_covers_the_serial_hash() {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng));
        let mut ack = test_ack();
        ack.sign(&keypair);
        assert!(ack.is_correct(&keypair.public()));

        let mut tampered = ack.clone();
        tampered.serial_hash = CryptoHash::of(b"a different chain");
        assert!(!tampered.is_correct(&keypair.public()));
    }

    #[test]
    fn serial_hashes_chain() {
        let ack = test_ack();
        let next_msg = CryptoHash::of(b"next message");
        assert_eq!(
            ack.next_serial_hash(&next_msg),
            CryptoHash::combine(&ack.serial_hash, &next_msg)
        );
    }
}
