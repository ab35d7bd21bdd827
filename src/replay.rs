/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Time-windowed replay filtering.
//!
//! The core runs three *independent* replay spaces, selected by [`ReplayKind`]:
//! 1. `Internal` gates every message entering the executor, keyed by repeat hash.
//! 2. `Block` gates factoid transactions across completed blocks, keyed by transaction signature
//!    hash (the double-spend scan).
//! 3. `Reveal` gates entry reveals, keyed by entry hash, so an entry can be revealed at most once
//!    per window.
//!
//! A hash is accepted iff it has not been seen in its space within the window centered on the
//! filter's notion of "now". Sealed hashes are bucketed by minute and expire wholesale as the
//! window slides, so rejection is O(1) and expiry is O(expired), never O(filter).

use std::collections::{BTreeMap, HashMap};

use crate::types::data_types::{CryptoHash, Timestamp};

/// Half-width of the acceptance window, in seconds. A timestamp farther than this from "now" in
/// either direction is rejected outright.
pub const REPLAY_WINDOW_SECS: i64 = 60 * 60;

/// The three independent replay spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayKind {
    Internal,
    Block,
    Reveal,
}

impl ReplayKind {
    fn index(&self) -> usize {
        match self {
            ReplayKind::Internal => 0,
            ReplayKind::Block => 1,
            ReplayKind::Reveal => 2,
        }
    }
}

#[derive(Default)]
struct ReplaySpace {
    /// Every sealed hash, for O(1) membership checks.
    seen: HashMap<CryptoHash, u64>,
    /// Sealed hashes bucketed by the minute of their timestamp, for O(expired) expiry.
    buckets: BTreeMap<u64, Vec<CryptoHash>>,
}

impl ReplaySpace {
    fn seal(&mut self, hash: CryptoHash, timestamp: Timestamp) {
        let bucket = timestamp.secs() / 60;
        self.seen.insert(hash, bucket);
        self.buckets.entry(bucket).or_default().push(hash);
    }

    fn expire_before(&mut self, cutoff_secs: u64) {
        let cutoff_bucket = cutoff_secs / 60;
        let keep = self.buckets.split_off(&cutoff_bucket);
        let expired = std::mem::replace(&mut self.buckets, keep);
        for hashes in expired.values() {
            for hash in hashes {
                self.seen.remove(hash);
            }
        }
    }
}

/// Three time-windowed hash sets rejecting duplicate message and transaction hashes.
#[derive(Default)]
pub struct ReplayFilter {
    spaces: [ReplaySpace; 3],
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `hash` would be accepted right now: its timestamp lies inside the window centered
    /// on `now`, and it has not been sealed in this space.
    pub fn valid(
        &self,
        kind: ReplayKind,
        hash: &CryptoHash,
        timestamp: Timestamp,
        now: Timestamp,
    ) -> bool {
        let offset = timestamp.secs_until(now);
        if offset.abs() > REPLAY_WINDOW_SECS {
            return false;
        }
        !self.spaces[kind.index()].seen.contains_key(hash)
    }

    /// Seal `hash` into its space if it is currently valid. Returns whether the hash was newly
    /// sealed; sealing an already-sealed hash is a no-op returning false.
    pub fn is_ts_valid(
        &mut self,
        kind: ReplayKind,
        hash: &CryptoHash,
        timestamp: Timestamp,
        now: Timestamp,
    ) -> bool {
        if !self.valid(kind, hash, timestamp, now) {
            return false;
        }
        self.spaces[kind.index()].seal(*hash, timestamp);
        self.expire(now);
        true
    }

    /// Slide every space's window forward to `now`, dropping buckets that fell off the trailing
    /// edge.
    pub fn expire(&mut self, now: Timestamp) {
        let cutoff = now.secs().saturating_sub(REPLAY_WINDOW_SECS as u64);
        for space in &mut self.spaces {
            space.expire_before(cutoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Timestamp {
        Timestamp::new(s * 1000)
    }

    #[test]
    fn sealing_is_idempotent() {
        let mut filter = ReplayFilter::new();
        let hash = CryptoHash::of(b"a message");
        let now = secs(10_000);

        assert!(filter.valid(ReplayKind::Internal, &hash, now, now));
        assert!(filter.is_ts_valid(ReplayKind::Internal, &hash, now, now));
        assert!(!filter.is_ts_valid(ReplayKind::Internal, &hash, now, now));
        assert!(!filter.valid(ReplayKind::Internal, &hash, now, now));
    }

    #[test]
    fn spaces_are_independent() {
        let mut filter = ReplayFilter::new();
        let hash = CryptoHash::of(b"shared hash");
        let now = secs(10_000);

        assert!(filter.is_ts_valid(ReplayKind::Internal, &hash, now, now));
        assert!(filter.valid(ReplayKind::Block, &hash, now, now));
        assert!(filter.valid(ReplayKind::Reveal, &hash, now, now));
    }

    #[test]
    fn timestamps_outside_the_window_are_rejected() {
        let filter = ReplayFilter::new();
        let hash = CryptoHash::of(b"too old");
        let now = secs(10_000);

        let too_old = secs(10_000 - REPLAY_WINDOW_SECS as u64 - 1);
        let too_new = secs(10_000 + REPLAY_WINDOW_SECS as u64 + 1);
        assert!(!filter.valid(ReplayKind::Internal, &hash, too_old, now));
        assert!(!filter.valid(ReplayKind::Internal, &hash, too_new, now));

        let edge = secs(10_000 - REPLAY_WINDOW_SECS as u64);
        assert!(filter.valid(ReplayKind::Internal, &hash, edge, now));
    }

    #[test]
    fn sealed_hashes_expire_as_the_window_slides() {
        let mut filter = ReplayFilter::new();
        let hash = CryptoHash::of(b"expires");
        let sealed_at = secs(10_000);

        assert!(filter.is_ts_valid(ReplayKind::Reveal, &hash, sealed_at, sealed_at));

        // Slide far enough that the sealed bucket falls off, then the hash is acceptable again
        // at a fresh timestamp.
        let later = secs(10_000 + 2 * REPLAY_WINDOW_SECS as u64);
        filter.expire(later);
        assert!(filter.valid(ReplayKind::Reveal, &hash, later, later));
    }
}
