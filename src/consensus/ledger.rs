/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Permanent balances and the factoid block under construction.
//!
//! Temporary per-block overlays live on each process list; this module holds the *permanent* maps
//! that survive block boundaries. They are the only consensus state read concurrently (API
//! readers inspect balances), so they sit behind mutexes: readers and writers must hold the lock,
//! and a temp-overlay miss falls through to the permanent map.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{
    blocks::FactoidBlock,
    data_types::{Address, CryptoHash, DbHeight, EntryCredits},
};

/// The ways applying a credit transaction can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum LedgerError {
    InsufficientCredits { address: Address, needed: u8 },
}

pub struct LedgerState {
    pub factoid_balances: Mutex<HashMap<Address, i64>>,
    pub ec_balances: Mutex<HashMap<Address, i64>>,
    current_factoid_block: FactoidBlock,
    periods_closed: u8,
}

impl LedgerState {
    pub fn new(db_height: DbHeight) -> Self {
        Self {
            factoid_balances: Mutex::new(HashMap::new()),
            ec_balances: Mutex::new(HashMap::new()),
            current_factoid_block: FactoidBlock::new(db_height),
            periods_closed: 0,
        }
    }

    /// Debit `credits` from the entry credit balance of `address`.
    pub fn update_ec_transaction(
        &mut self,
        address: Address,
        credits: EntryCredits,
    ) -> Result<(), LedgerError> {
        let mut balances = self.ec_balances.lock().unwrap();
        let balance = balances.entry(address).or_insert(0);
        if *balance < credits.int() as i64 {
            return Err(LedgerError::InsufficientCredits {
                address,
                needed: credits.int(),
            });
        }
        *balance -= credits.int() as i64;
        Ok(())
    }

    /// Close a transaction period in the factoid block under construction. One per minute.
    pub fn end_of_period(&mut self, minute: u8) {
        if self.periods_closed <= minute {
            self.periods_closed = minute + 1;
        }
    }

    pub fn current_block(&self) -> &FactoidBlock {
        &self.current_factoid_block
    }

    /// Take the completed factoid block and start building the one for `next_height`.
    pub fn take_current_block(&mut self, next_height: DbHeight) -> FactoidBlock {
        self.periods_closed = 0;
        std::mem::replace(&mut self.current_factoid_block, FactoidBlock::new(next_height))
    }

    /// Digest over the permanent balance maps, in a deterministic order.
    pub fn balance_hash(&self) -> CryptoHash {
        let mut bytes = Vec::new();
        for balances in [&self.factoid_balances, &self.ec_balances] {
            let map = balances.lock().unwrap();
            let mut entries: Vec<_> = map.iter().map(|(a, v)| (a.bytes(), *v)).collect();
            entries.sort();
            for (address, value) in entries {
                bytes.extend_from_slice(&address);
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        CryptoHash::of(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ec_debits_refuse_to_overdraw() {
        let mut ledger = LedgerState::new(DbHeight::new(0));
        let address = Address::new([1u8; 32]);
        ledger.ec_balances.lock().unwrap().insert(address, 5);

        assert!(ledger
            .update_ec_transaction(address, EntryCredits::new(3))
            .is_ok());
        assert_eq!(
            ledger.update_ec_transaction(address, EntryCredits::new(3)),
            Err(LedgerError::InsufficientCredits { address, needed: 3 })
        );
        assert_eq!(*ledger.ec_balances.lock().unwrap().get(&address).unwrap(), 2);
    }

    #[test]
    fn balance_hash_is_order_independent() {
        let a = Address::new([1u8; 32]);
        let b = Address::new([2u8; 32]);

        let mut first = LedgerState::new(DbHeight::new(0));
        first.factoid_balances.lock().unwrap().insert(a, 10);
        first.factoid_balances.lock().unwrap().insert(b, 20);

        let mut second = LedgerState::new(DbHeight::new(0));
        second.factoid_balances.lock().unwrap().insert(b, 20);
        second.factoid_balances.lock().unwrap().insert(a, 10);

        assert_eq!(first.balance_hash(), second.balance_hash());
    }
}
