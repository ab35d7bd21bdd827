/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Authority management messages, processed at the system level and recorded into the admin block.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    authority::ServerClass,
    data_types::{CryptoHash, DbHeight, ServerId, SignatureBytes, Timestamp},
};

/// Admin block change code: replace a server's Matryoshka hash.
pub const TYPE_ADD_MATRYOSHKA: u8 = 0x03;
/// Admin block change code: add a signing key for a federated server.
pub const TYPE_ADD_FED_SERVER_KEY: u8 = 0x08;
/// Admin block change code: add a Bitcoin anchor key for a federated server.
pub const TYPE_ADD_BTC_ANCHOR_KEY: u8 = 0x09;

/// Promote an identity into the federated or audit server set.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct AddServer {
    pub server_id: ServerId,
    pub server_class: ServerClass,
    pub db_height: DbHeight,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}

/// Remove a server from the authority set.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct RemoveServer {
    pub server_id: ServerId,
    pub server_class: ServerClass,
    pub db_height: DbHeight,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}

/// Rotate one of a server's keys. `admin_block_change` selects which key, using the `TYPE_*`
/// codes above.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ChangeServerKey {
    pub identity_chain_id: ServerId,
    pub admin_block_change: u8,
    pub key_priority: u8,
    pub key_type: u8,
    pub key: CryptoHash,
    pub db_height: DbHeight,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}
