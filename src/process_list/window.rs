/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The sliding window of process lists.
//!
//! Process lists exist for heights in `[base, base + MAX_DEPTH)`. A list is created on demand when
//! the first message for its height arrives, seeded with the federated and audit server sets of
//! the newest list below it, and destroyed when the window slides past it. Downstream state must
//! key anything it caches by height, never by reference: a retired height invalidates its list.

use std::collections::BTreeMap;

use crate::types::{
    authority::Server,
    data_types::{DbHeight, Timestamp},
};

use super::ProcessList;

/// How far above the base the window extends.
pub const MAX_DEPTH: u32 = 10;

pub struct ProcessLists {
    db_height_base: DbHeight,
    lists: BTreeMap<DbHeight, ProcessList>,
}

impl ProcessLists {
    pub fn new(db_height_base: DbHeight) -> Self {
        Self {
            db_height_base,
            lists: BTreeMap::new(),
        }
    }

    pub fn db_height_base(&self) -> DbHeight {
        self.db_height_base
    }

    pub fn get(&self, db_height: DbHeight) -> Option<&ProcessList> {
        self.lists.get(&db_height)
    }

    pub fn get_mut(&mut self, db_height: DbHeight) -> Option<&mut ProcessList> {
        self.lists.get_mut(&db_height)
    }

    /// Fetch the list at `db_height`, creating it if the height lies inside the window. A new
    /// list inherits the server sets of the newest existing list below it, falling back to
    /// `seed_servers` when there is none.
    pub fn get_or_create(
        &mut self,
        db_height: DbHeight,
        seed_servers: &(Vec<Server>, Vec<Server>),
        timestamp: Timestamp,
    ) -> Option<&mut ProcessList> {
        if db_height < self.db_height_base
            || db_height.int() >= self.db_height_base.int() + MAX_DEPTH
        {
            return None;
        }
        if !self.lists.contains_key(&db_height) {
            let (fed_servers, audit_servers) = self
                .lists
                .range(..db_height)
                .next_back()
                .map(|(_, pl)| (pl.fed_servers.clone(), pl.audit_servers.clone()))
                .unwrap_or_else(|| seed_servers.clone());
            self.lists.insert(
                db_height,
                ProcessList::new(db_height, fed_servers, audit_servers, timestamp),
            );
        }
        self.lists.get_mut(&db_height)
    }

    /// Slide the window so that `saved` is the last height behind the base, destroying retired
    /// lists.
    pub fn trim_to(&mut self, saved: DbHeight) {
        let new_base = saved + 1;
        if new_base.int() <= self.db_height_base.int() {
            return;
        }
        self.db_height_base = new_base;
        self.lists = self.lists.split_off(&new_base);
    }

    /// Heights of the lists currently alive, in order.
    pub fn heights(&self) -> Vec<DbHeight> {
        self.lists.keys().copied().collect()
    }
}
