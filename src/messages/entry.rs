/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Commit and reveal messages: the two-phase path by which entries reach entry blocks.
//!
//! A commit pays entry credits for an entry identified only by its hash; the reveal later supplies
//! the entry itself. The core pairs the two through the commit registry, keeping the
//! highest-credit commit per entry hash until its reveal arrives.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    blocks::Entry,
    data_types::{Address, CryptoHash, EntryCredits, SignatureBytes, Timestamp},
};

/// Commit paying for the first entry of a brand new chain.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CommitChain {
    pub entry_hash: CryptoHash,
    /// Commitment to the new chain's ID. A chain commit is only redeemable by a reveal that
    /// creates the chain.
    pub chain_id_hash: CryptoHash,
    pub credits: EntryCredits,
    pub ec_address: Address,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}

/// Commit paying for an entry in an existing chain.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CommitEntry {
    pub entry_hash: CryptoHash,
    pub credits: EntryCredits,
    pub ec_address: Address,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}

/// The reveal that redeems a prior commit by supplying the committed entry.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct RevealEntry {
    pub entry: Entry,
    /// Whether the claimed commit was a [`CommitEntry`] (an entry in an existing chain) rather
    /// than a [`CommitChain`] (the first entry of a new chain). Stamped when the commit is
    /// claimed.
    pub is_entry: bool,
    pub timestamp: Timestamp,
}

impl RevealEntry {
    pub fn entry_hash(&self) -> CryptoHash {
        self.entry.hash()
    }
}
