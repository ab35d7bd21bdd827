/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Inert newtypes used across the consensus core.
//!
//! Every scalar quantity that crosses a module boundary gets its own type here, so that a directory
//! block height can never be confused with a position inside a virtual server's list, and a minute
//! can never be confused with a VM index. All of these types serialize with borsh, since all of them
//! can appear inside wire-visible messages.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
    time::{SystemTime, UNIX_EPOCH},
};

/// Ordinal of a ten-minute directory block.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct DbHeight(u32);

impl DbHeight {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    /// The height directly below this one, saturating at zero.
    pub fn prev(&self) -> DbHeight {
        DbHeight(self.0.saturating_sub(1))
    }
}

impl Display for DbHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u32> for DbHeight {
    type Output = DbHeight;
    fn add(self, rhs: u32) -> Self::Output {
        DbHeight(self.0 + rhs)
    }
}

impl AddAssign<u32> for DbHeight {
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs
    }
}

impl Sub<DbHeight> for DbHeight {
    type Output = i64;
    fn sub(self, rhs: DbHeight) -> Self::Output {
        self.0 as i64 - rhs.0 as i64
    }
}

/// Sub-block index. Minutes 0 through 9 carry entries; minute 10 is the finalization transient in
/// which the block is closed and the next one opened.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Minute(u8);

impl Minute {
    pub const fn new(int: u8) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u8 {
        self.0
    }

    pub fn next(&self) -> Minute {
        Minute(self.0 + 1)
    }

    /// The end-of-minute marker byte recorded in entry blocks and the entry credit block when this
    /// minute closes. Markers are one-based while minutes are zero-based.
    pub fn marker(&self) -> u8 {
        self.0 + 1
    }
}

impl Display for Minute {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Index of a virtual server inside a process list. There is one VM per federated server.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct VmIndex(u8);

impl VmIndex {
    pub const fn new(int: u8) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u8 {
        self.0
    }

    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for VmIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Position of a message inside a virtual server's list. Positions are dense: a VM list is indexed
/// `0..height` with no gaps once every acknowledged slot has arrived.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ListHeight(u32);

impl ListHeight {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn next(&self) -> ListHeight {
        ListHeight(self.0 + 1)
    }
}

impl Display for ListHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Number of entry credits paid by a commit. A reveal is paired against the commit with the most
/// credits seen for its entry hash.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct EntryCredits(u8);

impl EntryCredits {
    pub const fn new(int: u8) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u8 {
        self.0
    }
}

/// Milliseconds since the Unix epoch. Timestamps are advisory: they gate replay windows and the
/// boot-time ignore-missing period, but carry no ordering authority of their own.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is set before the Unix epoch")
            .as_millis() as u64;
        Self(millis)
    }

    pub const fn millis(&self) -> u64 {
        self.0
    }

    pub const fn secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Seconds elapsed between `self` and a later timestamp. Negative if `later` is in fact
    /// earlier.
    pub fn secs_until(&self, later: Timestamp) -> i64 {
        later.0 as i64 / 1000 - self.0 as i64 / 1000
    }

    pub fn millis_until(&self, later: Timestamp) -> i64 {
        later.0 as i64 - self.0 as i64
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A 32-byte digest. Message hashes, serial hashes, entry hashes, key Merkle roots and body Merkle
/// roots are all `CryptoHash`es.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Digest of an arbitrary byte string.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// Digest of the concatenation `left ‖ right`. Serial hashes chain with this:
    /// `serial[h] = combine(serial[h-1], msg_hash[h])`.
    pub fn combine(left: &CryptoHash, right: &CryptoHash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    /// Interpret the leading 8 bytes as a little-endian integer. Used to assign chain-bound
    /// messages to virtual servers by consistent hashing.
    pub fn to_u64(&self) -> u64 {
        let mut le = [0u8; 8];
        le.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(le)
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

/// Identity chain ID of a server. Federated and audit servers are identified by the hash of their
/// identity chain, not by their signing key; keys can rotate under a stable `ServerId`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct ServerId([u8; 32]);

impl ServerId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

/// ID of an entry chain. Every entry belongs to exactly one chain, and every chain maps to at most
/// one entry block per directory block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct ChainId([u8; 32]);

impl ChainId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn as_hash(&self) -> CryptoHash {
        CryptoHash::new(self.0)
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

/// A factoid or entry credit address, used as the key of the balance maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Address([u8; 32]);

impl Address {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

/// Signature represented in bytes.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 64])
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0[..8], f)
    }
}

/// Node-local salt derivative stamped into acknowledgements and heartbeats. Lets a restarted node
/// recognize its own pre-restart messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SaltNumber(u32);

impl SaltNumber {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_order_sensitive() {
        let a = CryptoHash::of(b"a");
        let b = CryptoHash::of(b"b");
        assert_ne!(CryptoHash::combine(&a, &b), CryptoHash::combine(&b, &a));
    }

    #[test]
    fn serial_hash_chains_deterministically() {
        let genesis = CryptoHash::of(b"first message");
        let second = CryptoHash::of(b"second message");
        let chained = CryptoHash::combine(&genesis, &second);
        assert_eq!(chained, CryptoHash::combine(&genesis, &second));
        assert_ne!(chained, genesis);
        assert_ne!(chained, second);
    }

    #[test]
    fn minute_markers_are_one_based() {
        assert_eq!(Minute::new(0).marker(), 1);
        assert_eq!(Minute::new(9).marker(), 10);
    }
}
