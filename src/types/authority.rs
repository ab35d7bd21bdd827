/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Federated and audit server identities, and the authority set that maps a server's identity chain
//! ID to its current signing key.
//!
//! The consensus core never loads identities off the chain itself; the embedder seeds an
//! [`AuthoritySet`] when the node boots and the core keeps it current as admin operations and
//! identity entries are processed. Identity chain *parsing* stays outside this crate; what the core
//! needs is the mapping `ServerId → VerifyingKey` and enough bookkeeping to answer "is this a
//! federated signature, an audit signature, or noise?".

use std::collections::HashMap;

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use super::{
    crypto_primitives::verify_signature,
    data_types::{CryptoHash, ServerId, SignatureBytes},
};

/// Whether an authority currently occupies a federated (block-producing) seat or an audit
/// (standby) seat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum ServerClass {
    Federated,
    Audit,
}

/// A federated or audit server as it appears inside a process list: its identity plus its liveness
/// flag. Demoted servers stay in the audit pool, offline, until they heartbeat back.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Server {
    pub id: ServerId,
    pub online: bool,
}

impl Server {
    pub fn new(id: ServerId) -> Self {
        Self { id, online: true }
    }
}

/// A single known authority: the stable identity chain ID and the mutable key material hanging off
/// it.
#[derive(Clone, Debug)]
pub struct Authority {
    pub server_id: ServerId,
    pub signing_key: [u8; 32],
    pub class: ServerClass,
    pub matryoshka_hash: Option<CryptoHash>,
    pub btc_anchor_key: Option<[u8; 20]>,
}

impl Authority {
    pub fn new(server_id: ServerId, signing_key: [u8; 32], class: ServerClass) -> Self {
        Self {
            server_id,
            signing_key,
            class,
            matryoshka_hash: None,
            btc_anchor_key: None,
        }
    }

    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.signing_key).ok()
    }

    /// Verify `signature` over `data` under `context` against this authority's current signing
    /// key. A key that does not decode as a curve point verifies nothing.
    pub fn verify_signature(&self, context: &[u8], data: &[u8], signature: &SignatureBytes) -> bool {
        match self.verifying_key() {
            Some(key) => verify_signature(&key, context, data, signature),
            None => false,
        }
    }
}

/// All authorities this node knows about, keyed by identity chain ID.
#[derive(Clone, Debug, Default)]
pub struct AuthoritySet {
    authorities: HashMap<ServerId, Authority>,
}

impl AuthoritySet {
    pub fn new() -> Self {
        Self {
            authorities: HashMap::new(),
        }
    }

    pub fn get(&self, server_id: &ServerId) -> Option<&Authority> {
        self.authorities.get(server_id)
    }

    pub fn is_authority(&self, server_id: &ServerId) -> bool {
        self.authorities.contains_key(server_id)
    }

    pub fn server_class(&self, server_id: &ServerId) -> Option<ServerClass> {
        self.authorities.get(server_id).map(|a| a.class)
    }

    pub fn register(&mut self, authority: Authority) {
        self.authorities.insert(authority.server_id, authority);
    }

    pub fn remove(&mut self, server_id: &ServerId) {
        self.authorities.remove(server_id);
    }

    pub fn set_class(&mut self, server_id: &ServerId, class: ServerClass) {
        if let Some(authority) = self.authorities.get_mut(server_id) {
            authority.class = class;
        }
    }

    pub fn set_signing_key(&mut self, server_id: &ServerId, signing_key: [u8; 32]) {
        if let Some(authority) = self.authorities.get_mut(server_id) {
            authority.signing_key = signing_key;
        }
    }

    pub fn set_btc_anchor_key(&mut self, server_id: &ServerId, key: [u8; 20]) {
        if let Some(authority) = self.authorities.get_mut(server_id) {
            authority.btc_anchor_key = Some(key);
        }
    }

    pub fn set_matryoshka_hash(&mut self, server_id: &ServerId, hash: CryptoHash) {
        if let Some(authority) = self.authorities.get_mut(server_id) {
            authority.matryoshka_hash = Some(hash);
        }
    }

    /// Resolve the issuer of `signature` by its raw key bytes and classify the result:
    /// `> 0` if the signature verifies under a current federated server's key, `0` if it verifies
    /// under an audit server's key, `-1` if it verifies under nobody's.
    pub fn fast_verify_authority_signature(
        &self,
        context: &[u8],
        data: &[u8],
        key: &[u8; 32],
        signature: &SignatureBytes,
    ) -> i32 {
        for authority in self.authorities.values() {
            if &authority.signing_key != key {
                continue;
            }
            if !authority.verify_signature(context, data, signature) {
                return -1;
            }
            return match authority.class {
                ServerClass::Federated => 1,
                ServerClass::Audit => 0,
            };
        }
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::crypto_primitives::{contexts, Keypair};
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn test_authority(class: ServerClass) -> (Keypair, Authority) {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng));
        let id = ServerId::new(CryptoHash::of(&keypair.public().to_bytes()).bytes());
        let authority = Authority::new(id, keypair.public().to_bytes(), class);
        (keypair, authority)
    }

    #[test]
    fn fast_verify_classifies_by_server_class() {
        let (fed_keypair, fed) = test_authority(ServerClass::Federated);
        let (audit_keypair, audit) = test_authority(ServerClass::Audit);

        let mut set = AuthoritySet::new();
        set.register(fed.clone());
        set.register(audit.clone());

        let context = contexts::SERVER_FAULT;
        let data = b"fault core hash";
        let fed_sig = fed_keypair.sign(context, data);
        let audit_sig = audit_keypair.sign(context, data);

        assert_eq!(
            set.fast_verify_authority_signature(context, data, &fed.signing_key, &fed_sig),
            1
        );
        assert_eq!(
            set.fast_verify_authority_signature(context, data, &audit.signing_key, &audit_sig),
            0
        );
        // A federated key over data it never signed verifies under nobody.
        assert_eq!(
            set.fast_verify_authority_signature(context, b"other data", &fed.signing_key, &fed_sig),
            -1
        );
        // Neither does the right data under the wrong context.
        assert_eq!(
            set.fast_verify_authority_signature(contexts::ACK, data, &fed.signing_key, &fed_sig),
            -1
        );
    }

    #[test]
    fn key_rotation_replaces_the_verifier() {
        let (old_keypair, authority) = test_authority(ServerClass::Federated);
        let id = authority.server_id;

        let mut set = AuthoritySet::new();
        set.register(authority);

        let new_keypair = Keypair::new(SigningKey::generate(&mut OsRng));
        set.set_signing_key(&id, new_keypair.public().to_bytes());

        let context = contexts::DIRECTORY_BLOCK_SIGNATURE;
        let data = b"signed after rotation";
        assert!(set
            .get(&id)
            .unwrap()
            .verify_signature(context, data, &new_keypair.sign(context, data)));
        assert!(!set
            .get(&id)
            .unwrap()
            .verify_signature(context, data, &old_keypair.sign(context, data)));
    }
}
