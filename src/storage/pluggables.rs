/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`BlockStore`] trait: the key/value-plus-batch facade through which the consensus core
//! reads and writes persistent blocks and entries.
//!
//! The core never opens a database itself. The embedder supplies a `BlockStore`; the library only
//! asks of it the handful of reads the protocol needs (a directory block by height, an entry
//! block chain head, entry existence) and writes finished work through multi-batches so that a
//! crash cannot leave a half-written block behind.

use std::fmt::Display;

use crate::types::{
    blocks::{AdminBlock, DirectoryBlock, EBlock, Entry, EntryCreditBlock, FactoidBlock},
    data_types::{ChainId, CryptoHash, DbHeight},
};

pub trait BlockStore: Send + 'static {
    fn fetch_dblock_by_height(&self, db_height: DbHeight) -> Option<DirectoryBlock>;

    /// The newest entry block of `chain_id`, if the chain exists.
    fn fetch_eblock_head(&self, chain_id: &ChainId) -> Option<EBlock>;

    fn entry_exists(&self, entry_hash: &CryptoHash) -> bool;

    /// Open a write batch. Writes staged after this call become visible only once
    /// [`execute_multi_batch`](Self::execute_multi_batch) commits them.
    fn start_multi_batch(&mut self);

    fn insert_entry_multi_batch(&mut self, entry: &Entry) -> Result<(), StoreError>;

    fn execute_multi_batch(&mut self) -> Result<(), StoreError>;

    /// Persist an entry block and, when `preserve` is set, keep its entries retrievable
    /// individually.
    fn process_eblock_batch(&mut self, eblock: &EBlock, preserve: bool) -> Result<(), StoreError>;

    /// Persist one finalized block with all of its components, atomically.
    fn save_block(
        &mut self,
        directory_block: &DirectoryBlock,
        admin_block: &AdminBlock,
        factoid_block: &FactoidBlock,
        entry_credit_block: &EntryCreditBlock,
        eblocks: &[EBlock],
        entries: &[Entry],
    ) -> Result<(), StoreError>;

    /// Give the store a chance to compact or drop caches. Called from the holding review, which
    /// runs at most every few hundred milliseconds.
    fn trim(&mut self);
}

/// The ways a [`BlockStore`] operation can fail.
#[derive(Debug)]
pub enum StoreError {
    /// A batched write was staged without an open batch.
    BatchNotStarted,
    /// The backing store reported an error.
    Backend { detail: String },
}

impl Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::BatchNotStarted => write!(f, "multi-batch write without an open batch"),
            StoreError::Backend { detail } => write!(f, "backing store error: {}", detail),
        }
    }
}
