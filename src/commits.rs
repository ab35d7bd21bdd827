/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The commit registry: for every entry hash, the best commit seen so far, waiting for its reveal.
//!
//! "Best" means most entry credits. When two commits of the same kind pay for the same entry hash,
//! the higher-credit one wins and the lower one is discarded; an equal-credit late arrival loses.
//! Claiming a reveal consumes the commit, so a commit arriving after the reveal was accepted finds
//! the registry empty and starts a fresh pairing for the next window.

use std::collections::HashMap;

use crate::{
    messages::{Message, Payload},
    types::data_types::{CryptoHash, EntryCredits, Timestamp},
};

/// How long an unclaimed commit survives in the registry, in seconds.
pub const COMMIT_EXPIRY_SECS: i64 = 60 * 60;

fn commit_shape(msg: &Message) -> Option<(bool, EntryCredits)> {
    match &msg.payload {
        Payload::CommitChain(cc) => Some((false, cc.credits)),
        Payload::CommitEntry(ce) => Some((true, ce.credits)),
        _ => None,
    }
}

pub struct Commits {
    commits: HashMap<CryptoHash, (Message, Timestamp)>,
}

impl Commits {
    pub fn new() -> Self {
        Self {
            commits: HashMap::new(),
        }
    }

    /// The best unclaimed commit for `entry_hash`, without consuming it.
    pub fn next_commit(&self, entry_hash: &CryptoHash) -> Option<&Message> {
        self.commits.get(entry_hash).map(|(msg, _)| msg)
    }

    /// Whether `msg` would displace the stored commit for `entry_hash`. True when no commit is
    /// stored, when the kinds differ, or when `msg` pays strictly more credits than a stored
    /// commit of the same kind.
    pub fn is_highest_commit(&self, entry_hash: &CryptoHash, msg: &Message) -> bool {
        let (existing, _) = match self.commits.get(entry_hash) {
            Some(stored) => stored,
            None => return true,
        };
        match (commit_shape(existing), commit_shape(msg)) {
            (Some((stored_kind, stored_credits)), Some((new_kind, new_credits)))
                if stored_kind == new_kind =>
            {
                stored_credits < new_credits
            }
            _ => true,
        }
    }

    /// Store `msg` if it is the highest commit for `entry_hash`.
    pub fn put(&mut self, entry_hash: CryptoHash, msg: Message, now: Timestamp) {
        if self.is_highest_commit(&entry_hash, &msg) {
            self.commits.insert(entry_hash, (msg, now));
        }
    }

    /// Consume the commit for `entry_hash`.
    pub fn delete(&mut self, entry_hash: &CryptoHash) -> Option<Message> {
        self.commits.remove(entry_hash).map(|(msg, _)| msg)
    }

    /// Evict commits whose reveal never came. Returns how many were evicted.
    pub fn remove_expired(&mut self, now: Timestamp) -> usize {
        let before = self.commits.len();
        self.commits
            .retain(|_, (_, stored_at)| stored_at.secs_until(now) <= COMMIT_EXPIRY_SECS);
        before - self.commits.len()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CommitEntry;
    use crate::types::data_types::{Address, SignatureBytes};

    fn commit_entry(entry_hash: CryptoHash, credits: u8) -> Message {
        Message::new(
            Payload::CommitEntry(CommitEntry {
                entry_hash,
                credits: EntryCredits::new(credits),
                ec_address: Address::new([0u8; 32]),
                timestamp: Timestamp::new(1_000),
                signature: SignatureBytes::zero(),
            }),
            Timestamp::new(1_000),
        )
    }

    #[test]
    fn higher_credits_displace_lower() {
        let mut commits = Commits::new();
        let eh = CryptoHash::of(b"entry");
        let now = Timestamp::new(1_000);

        commits.put(eh, commit_entry(eh, 10), now);
        commits.put(eh, commit_entry(eh, 20), now);

        let stored = commits.next_commit(&eh).unwrap();
        assert_eq!(commit_shape(stored).unwrap().1, EntryCredits::new(20));
    }

    #[test]
    fn equal_credits_keep_the_first_commit() {
        let mut commits = Commits::new();
        let eh = CryptoHash::of(b"entry");
        let now = Timestamp::new(1_000);

        let first = commit_entry(eh, 10);
        let first_hash = first.msg_hash();
        commits.put(eh, first, now);
        assert!(!commits.is_highest_commit(&eh, &commit_entry(eh, 10)));
        commits.put(eh, commit_entry(eh, 5), now);

        assert_eq!(commits.next_commit(&eh).unwrap().msg_hash(), first_hash);
    }

    #[test]
    fn claiming_consumes_the_commit() {
        let mut commits = Commits::new();
        let eh = CryptoHash::of(b"entry");
        commits.put(eh, commit_entry(eh, 10), Timestamp::new(1_000));

        assert!(commits.delete(&eh).is_some());
        assert!(commits.next_commit(&eh).is_none());
        // A later commit starts a fresh pairing.
        assert!(commits.is_highest_commit(&eh, &commit_entry(eh, 1)));
    }

    #[test]
    fn unclaimed_commits_expire() {
        let mut commits = Commits::new();
        let eh = CryptoHash::of(b"entry");
        commits.put(eh, commit_entry(eh, 10), Timestamp::new(1_000));

        let much_later = Timestamp::new((2 + COMMIT_EXPIRY_SECS as u64) * 1000);
        assert_eq!(commits.remove_expired(much_later), 1);
        assert!(commits.is_empty());
    }
}
