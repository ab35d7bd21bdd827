//! A simple, volatile, in-memory implementation of [`BlockStore`].

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use fedchain_rs::storage::pluggables::{BlockStore, StoreError};
use fedchain_rs::types::{
    blocks::{AdminBlock, DirectoryBlock, EBlock, Entry, EntryCreditBlock, FactoidBlock},
    data_types::{ChainId, CryptoHash, DbHeight},
};

#[derive(Default)]
struct Inner {
    dblocks: HashMap<u32, DirectoryBlock>,
    eblock_heads: HashMap<ChainId, EBlock>,
    entries: HashSet<CryptoHash>,
    batch: Option<Vec<Entry>>,
}

/// An in-memory implementation of [`BlockStore`].
#[derive(Clone, Default)]
pub(crate) struct MemStore(Arc<Mutex<Inner>>);

impl MemStore {
    pub(crate) fn new() -> MemStore {
        MemStore::default()
    }

    #[allow(dead_code)]
    pub(crate) fn saved_heights(&self) -> Vec<u32> {
        let mut heights: Vec<u32> = self.0.lock().unwrap().dblocks.keys().copied().collect();
        heights.sort();
        heights
    }
}

impl BlockStore for MemStore {
    fn fetch_dblock_by_height(&self, db_height: DbHeight) -> Option<DirectoryBlock> {
        self.0.lock().unwrap().dblocks.get(&db_height.int()).cloned()
    }

    fn fetch_eblock_head(&self, chain_id: &ChainId) -> Option<EBlock> {
        self.0.lock().unwrap().eblock_heads.get(chain_id).cloned()
    }

    fn entry_exists(&self, entry_hash: &CryptoHash) -> bool {
        self.0.lock().unwrap().entries.contains(entry_hash)
    }

    fn start_multi_batch(&mut self) {
        self.0.lock().unwrap().batch = Some(Vec::new());
    }

    fn insert_entry_multi_batch(&mut self, entry: &Entry) -> Result<(), StoreError> {
        match &mut self.0.lock().unwrap().batch {
            Some(batch) => {
                batch.push(entry.clone());
                Ok(())
            }
            None => Err(StoreError::BatchNotStarted),
        }
    }

    fn execute_multi_batch(&mut self) -> Result<(), StoreError> {
        let mut inner = self.0.lock().unwrap();
        match inner.batch.take() {
            Some(batch) => {
                for entry in batch {
                    inner.entries.insert(entry.hash());
                }
                Ok(())
            }
            None => Err(StoreError::BatchNotStarted),
        }
    }

    fn process_eblock_batch(&mut self, eblock: &EBlock, _preserve: bool) -> Result<(), StoreError> {
        self.0
            .lock()
            .unwrap()
            .eblock_heads
            .insert(eblock.chain_id(), eblock.clone());
        Ok(())
    }

    fn save_block(
        &mut self,
        directory_block: &DirectoryBlock,
        _admin_block: &AdminBlock,
        _factoid_block: &FactoidBlock,
        _entry_credit_block: &EntryCreditBlock,
        eblocks: &[EBlock],
        entries: &[Entry],
    ) -> Result<(), StoreError> {
        let mut inner = self.0.lock().unwrap();
        inner
            .dblocks
            .insert(directory_block.db_height().int(), directory_block.clone());
        for eblock in eblocks {
            inner.eblock_heads.insert(eblock.chain_id(), eblock.clone());
        }
        for entry in entries {
            inner.entries.insert(entry.hash());
        }
        Ok(())
    }

    fn trim(&mut self) {}
}
