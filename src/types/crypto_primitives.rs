/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signing and verification, with per-kind domain separation.
//!
//! Every signature in this protocol covers the SHA-256 digest of the signed value's canonical
//! bytes prefixed by a context tag naming what is being signed. The tags keep signature kinds
//! disjoint: a signature over an acknowledgement can never verify as a fault vote, even if the
//! two values happened to serialize to the same bytes. Pre-hashing also keeps signing cost flat
//! in the size of the signed value, which matters for directory block headers that commit to a
//! whole block body.
//!
//! The context tags live in [`contexts`], one per signed message kind. A signer and its verifier
//! must name the same tag; [`Keypair::sign`] and [`verify_signature`] are the only two functions
//! that touch the curve, so the tagging discipline cannot be bypassed elsewhere in the crate.

use ed25519_dalek::{Signature, Signer, Verifier};
use sha2::{Digest, Sha256};

use super::data_types::SignatureBytes;

pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Context tags, one per signed value kind.
pub mod contexts {
    /// An acknowledgement stamping a message into a virtual server slot.
    pub const ACK: &[u8] = b"fedchain/ack/v1";
    /// An end-of-minute marker.
    pub const END_OF_MINUTE: &[u8] = b"fedchain/eom/v1";
    /// A directory block signature over the previous block's header.
    pub const DIRECTORY_BLOCK_SIGNATURE: &[u8] = b"fedchain/dbsig/v1";
    /// A fault vote, or an audit server's pledge; both sign a fault core hash.
    pub const SERVER_FAULT: &[u8] = b"fedchain/fault/v1";
    /// An audit server's liveness beacon.
    pub const HEARTBEAT: &[u8] = b"fedchain/heartbeat/v1";
}

/// The digest actually handed to the curve: `H(len(context) ‖ context ‖ message)`. The length
/// prefix keeps `(context, message)` pairs unambiguous.
fn tagged_digest(context: &[u8], message: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([context.len() as u8]);
    hasher.update(context);
    hasher.update(message);
    hasher.finalize().into()
}

/// A node's signing identity.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Sign `message` under `context`. Callers name the tag matching the message kind from
    /// [`contexts`].
    pub fn sign(&self, context: &[u8], message: &[u8]) -> SignatureBytes {
        let digest = tagged_digest(context, message);
        SignatureBytes::new(self.0.sign(&digest).to_bytes())
    }

    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

/// Verify `signature` over `message` under `context` against `verifying_key`. The context must be
/// the one the signer named.
pub fn verify_signature(
    verifying_key: &VerifyingKey,
    context: &[u8],
    message: &[u8],
    signature: &SignatureBytes,
) -> bool {
    let signature = Signature::from_bytes(&signature.bytes());
    verifying_key
        .verify(&tagged_digest(context, message), &signature)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn contexts_keep_signature_kinds_disjoint() {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng));
        let message = b"the same canonical bytes";

        let as_ack = keypair.sign(contexts::ACK, message);
        assert!(verify_signature(
            &keypair.public(),
            contexts::ACK,
            message,
            &as_ack
        ));
        assert!(!verify_signature(
            &keypair.public(),
            contexts::SERVER_FAULT,
            message,
            &as_ack
        ));
    }

    #[test]
    fn the_length_prefix_disambiguates_tag_boundaries() {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng));

        // Without the length prefix these two would hash identical input streams.
        let signed = keypair.sign(b"ab", b"cd");
        assert!(!verify_signature(&keypair.public(), b"abc", b"d", &signed));
        assert!(verify_signature(&keypair.public(), b"ab", b"cd", &signed));
    }
}
