/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The holding store: messages parked until their prerequisites arrive.
//!
//! A message lands here when it validates as "not yet" (its ack, its commit, or an older block has
//! not arrived) and leaves through one of three doors: promotion into the review queue by the
//! periodic holding review, direct pairing when the missing prerequisite shows up, or eviction on
//! expiry, replay, or permanent invalidity.

use std::collections::HashMap;

use crate::{
    messages::Message,
    types::data_types::{CryptoHash, Timestamp},
};

/// How long a message may sit in holding before the review expires it, in seconds.
pub const HOLDING_EXPIRY_SECS: i64 = 60 * 60;

/// How long between re-broadcasts of a held-but-valid message, in seconds.
pub const HOLDING_RESEND_SECS: i64 = 10;

struct Held {
    msg: Message,
    held_since: Timestamp,
    last_resend: Option<Timestamp>,
}

pub struct Holding {
    messages: HashMap<CryptoHash, Held>,
}

impl Holding {
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
        }
    }

    /// Park `msg` under its message hash. Re-inserting refreshes nothing: the original arrival
    /// time keeps counting toward expiry.
    pub fn put(&mut self, msg: Message, now: Timestamp) {
        let hash = msg.msg_hash();
        self.messages.entry(hash).or_insert(Held {
            msg,
            held_since: now,
            last_resend: None,
        });
    }

    pub fn get(&self, hash: &CryptoHash) -> Option<&Message> {
        self.messages.get(hash).map(|held| &held.msg)
    }

    pub fn remove(&mut self, hash: &CryptoHash) -> Option<Message> {
        self.messages.remove(hash).map(|held| held.msg)
    }

    pub fn contains(&self, hash: &CryptoHash) -> bool {
        self.messages.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the message under `hash` has outlived [`HOLDING_EXPIRY_SECS`].
    pub fn expired(&self, hash: &CryptoHash, now: Timestamp) -> bool {
        match self.messages.get(hash) {
            Some(held) => held.held_since.secs_until(now) > HOLDING_EXPIRY_SECS,
            None => false,
        }
    }

    /// Whether the message under `hash` is due for a re-broadcast.
    pub fn should_resend(&self, hash: &CryptoHash, now: Timestamp) -> bool {
        match self.messages.get(hash) {
            Some(held) => {
                let reference = held.last_resend.unwrap_or(held.held_since);
                reference.secs_until(now) >= HOLDING_RESEND_SECS
            }
            None => false,
        }
    }

    pub fn mark_resent(&mut self, hash: &CryptoHash, now: Timestamp) {
        if let Some(held) = self.messages.get_mut(hash) {
            held.last_resend = Some(now);
        }
    }

    /// Snapshot of the held hashes, so the review can mutate the store while walking it.
    pub fn hashes(&self) -> Vec<CryptoHash> {
        self.messages.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MissingMsg, Payload};
    use crate::types::data_types::{DbHeight, ServerId, VmIndex};

    fn test_msg(seed: u8) -> Message {
        Message::new(
            Payload::MissingMsg(MissingMsg {
                asker: ServerId::zero(),
                db_height: DbHeight::new(seed as u32),
                vm_index: VmIndex::new(0),
                system_height: 0,
                process_list_heights: vec![],
            }),
            Timestamp::new(1_000),
        )
    }

    #[test]
    fn put_get_remove_round_trip() {
        let mut holding = Holding::new();
        let msg = test_msg(1);
        let hash = msg.msg_hash();

        holding.put(msg, Timestamp::new(1_000));
        assert!(holding.contains(&hash));
        assert!(holding.remove(&hash).is_some());
        assert!(holding.is_empty());
    }

    #[test]
    fn reinsertion_keeps_the_original_arrival_time() {
        let mut holding = Holding::new();
        let msg = test_msg(2);
        let hash = msg.msg_hash();

        holding.put(msg.clone(), Timestamp::new(1_000));
        let just_before_expiry = Timestamp::new((1 + HOLDING_EXPIRY_SECS as u64) * 1000);
        holding.put(msg, just_before_expiry);

        let past_expiry = Timestamp::new((2 + HOLDING_EXPIRY_SECS as u64) * 1000);
        assert!(holding.expired(&hash, past_expiry));
    }
}
