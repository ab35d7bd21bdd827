/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local consensus core.
//!
//! ## Event enum
//!
//! Significant occurrences in the core include closing a minute, completing a block, applying a
//! block snapshot, swapping a faulted federated server, or parking and promoting messages through
//! the holding store.
//!
//! Each of these corresponds to a variant of the [event enum](Event). Each variant tuple contains
//! an inner struct type storing information that summarizes the particular kind of event. This
//! information always includes a timestamp corresponding to the time the event occurred.
//!
//! ## Registering event handlers
//!
//! Library users can register event handler closures, which are then internally called by the
//! library's [event bus](crate::event_bus) thread when the handler's particular event variant
//! happens. Custom handlers are registered when building the [node](crate::node); default handlers
//! that log events as CSV lines can be enabled in the node's configuration.
//!
//! ## Timing
//!
//! Events are always emitted **after** the corresponding occurrence is completed. The
//! [CompleteBlockEvent], for example, is only emitted once the new block snapshot is recorded in
//! the ledger and the next process list is open.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::data_types::{
    ChainId, CryptoHash, DbHeight, EntryCredits, ListHeight, Minute, ServerId, VmIndex,
};

/// Enumerates all events defined for the consensus core.
pub enum Event {
    // Events that change the ledger.
    ApplySnapshot(ApplySnapshotEvent),
    IgnoreSnapshot(IgnoreSnapshotEvent),
    CompleteBlock(CompleteBlockEvent),

    // Minute and block progress events.
    StartMinuteSync(StartMinuteSyncEvent),
    CompleteMinute(CompleteMinuteEvent),
    GenerateDbSig(GenerateDbSigEvent),
    SendHeartbeat(SendHeartbeatEvent),

    // Message flow events.
    HoldMessage(HoldMessageEvent),
    InvalidMessage(InvalidMessageEvent),
    PairSlot(PairSlotEvent),
    StoreCommit(StoreCommitEvent),
    ProcessReveal(ProcessRevealEvent),
    ReviewHolding(ReviewHoldingEvent),

    // Fault protocol events.
    SwapServer(SwapServerEvent),
    ClearFault(ClearFaultEvent),
}

impl Event {
    /// Publishes a given instance of the [Event](Event) enum on the event publisher channel (if the
    /// channel is defined).
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A block snapshot was validated against the ledger tail and applied.
pub struct ApplySnapshotEvent {
    pub timestamp: SystemTime,
    pub db_height: DbHeight,
    pub from_network: bool,
}

/// A block snapshot was rejected as invalid against the ledger tail.
pub struct IgnoreSnapshotEvent {
    pub timestamp: SystemTime,
    pub db_height: DbHeight,
}

/// Minute 10 closed: the block at `db_height` was finalized into the ledger and the next process
/// list opened.
pub struct CompleteBlockEvent {
    pub timestamp: SystemTime,
    pub db_height: DbHeight,
}

/// The first end-of-minute marker of a new minute arrived and the core began collecting markers
/// from every federated VM.
pub struct StartMinuteSyncEvent {
    pub timestamp: SystemTime,
    pub db_height: DbHeight,
    pub minute: Minute,
}

/// Every federated VM delivered its marker and the minute closed.
pub struct CompleteMinuteEvent {
    pub timestamp: SystemTime,
    pub db_height: DbHeight,
    pub minute: Minute,
}

/// This node generated and issued a directory block signature.
pub struct GenerateDbSigEvent {
    pub timestamp: SystemTime,
    pub db_height: DbHeight,
    pub vm_index: VmIndex,
}

/// This node, serving as an audit server, emitted a heartbeat at a minute completion.
pub struct SendHeartbeatEvent {
    pub timestamp: SystemTime,
    pub db_height: DbHeight,
}

/// A message was parked in holding pending a prerequisite.
pub struct HoldMessageEvent {
    pub timestamp: SystemTime,
    pub msg_hash: CryptoHash,
    pub kind: &'static str,
}

/// A message validated as invalid-forever and its invalidity was broadcast once.
pub struct InvalidMessageEvent {
    pub timestamp: SystemTime,
    pub msg_hash: CryptoHash,
    pub kind: &'static str,
}

/// An `(ack, message)` pair was accepted into a virtual server's list.
pub struct PairSlotEvent {
    pub timestamp: SystemTime,
    pub db_height: DbHeight,
    pub vm_index: VmIndex,
    pub height: ListHeight,
    pub msg_hash: CryptoHash,
}

/// A commit entered the commit registry as the best commit for its entry hash.
pub struct StoreCommitEvent {
    pub timestamp: SystemTime,
    pub entry_hash: CryptoHash,
    pub credits: EntryCredits,
}

/// A reveal was paired with its commit and recorded into the current process list.
pub struct ProcessRevealEvent {
    pub timestamp: SystemTime,
    pub entry_hash: CryptoHash,
    pub chain_id: ChainId,
}

/// The periodic holding review ran, promoting and expiring held messages.
pub struct ReviewHoldingEvent {
    pub timestamp: SystemTime,
    pub promoted: usize,
    pub expired: usize,
}

/// A full server fault completed: the faulted federated server was demoted and the pledged audit
/// server promoted in its place.
pub struct SwapServerEvent {
    pub timestamp: SystemTime,
    pub db_height: DbHeight,
    pub demoted: ServerId,
    pub promoted: ServerId,
}

/// A fault was cleared without any promotion because the accused leader came back.
pub struct ClearFaultEvent {
    pub timestamp: SystemTime,
    pub db_height: DbHeight,
    pub server_id: ServerId,
}
