/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them in the node's
//! configuration.
//!
//! This library logs using the [log](https://docs.rs/log/latest/log/) crate. To get these
//! messages printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following
//! snippet is how a [PairSlot](crate::events::PairSlotEvent) is printed:
//!
//! ```text
//! PairSlot, 1701329264, 12, 0, 3, Id5u7f6
//! ```
//!
//! In the snippet, the third through fifth values are the directory block height, VM index and
//! list height of the paired slot, and the sixth is the first seven characters of the Base64
//! encoding of the paired message's hash.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const APPLY_SNAPSHOT: &str = "ApplySnapshot";
pub const IGNORE_SNAPSHOT: &str = "IgnoreSnapshot";
pub const COMPLETE_BLOCK: &str = "CompleteBlock";

pub const START_MINUTE_SYNC: &str = "StartMinuteSync";
pub const COMPLETE_MINUTE: &str = "CompleteMinute";
pub const GENERATE_DBSIG: &str = "GenerateDbSig";
pub const SEND_HEARTBEAT: &str = "SendHeartbeat";

pub const HOLD_MESSAGE: &str = "HoldMessage";
pub const INVALID_MESSAGE: &str = "InvalidMessage";
pub const PAIR_SLOT: &str = "PairSlot";
pub const STORE_COMMIT: &str = "StoreCommit";
pub const PROCESS_REVEAL: &str = "ProcessReveal";
pub const REVIEW_HOLDING: &str = "ReviewHolding";

pub const SWAP_SERVER: &str = "SwapServer";
pub const CLEAR_FAULT: &str = "ClearFault";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

/// Get a more readable representation of a byte sequence by base64-encoding it and taking the
/// first 7 characters.
pub fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

pub fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("event occurred before the Unix Epoch")
        .as_secs()
}

impl Logger for ApplySnapshotEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ApplySnapshotEvent| {
            log::info!(
                "{}, {}, {}, {}",
                APPLY_SNAPSHOT,
                secs_since_unix_epoch(event.timestamp),
                event.db_height,
                if event.from_network { "network" } else { "local" }
            )
        })
    }
}

impl Logger for IgnoreSnapshotEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &IgnoreSnapshotEvent| {
            log::debug!(
                "{}, {}, {}",
                IGNORE_SNAPSHOT,
                secs_since_unix_epoch(event.timestamp),
                event.db_height
            )
        })
    }
}

impl Logger for CompleteBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CompleteBlockEvent| {
            log::info!(
                "{}, {}, {}",
                COMPLETE_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                event.db_height
            )
        })
    }
}

impl Logger for StartMinuteSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartMinuteSyncEvent| {
            log::debug!(
                "{}, {}, {}, {}",
                START_MINUTE_SYNC,
                secs_since_unix_epoch(event.timestamp),
                event.db_height,
                event.minute
            )
        })
    }
}

impl Logger for CompleteMinuteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CompleteMinuteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMPLETE_MINUTE,
                secs_since_unix_epoch(event.timestamp),
                event.db_height,
                event.minute
            )
        })
    }
}

impl Logger for GenerateDbSigEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &GenerateDbSigEvent| {
            log::info!(
                "{}, {}, {}, {}",
                GENERATE_DBSIG,
                secs_since_unix_epoch(event.timestamp),
                event.db_height,
                event.vm_index
            )
        })
    }
}

impl Logger for SendHeartbeatEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &SendHeartbeatEvent| {
            log::debug!(
                "{}, {}, {}",
                SEND_HEARTBEAT,
                secs_since_unix_epoch(event.timestamp),
                event.db_height
            )
        })
    }
}

impl Logger for HoldMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &HoldMessageEvent| {
            log::trace!(
                "{}, {}, {}, {}",
                HOLD_MESSAGE,
                secs_since_unix_epoch(event.timestamp),
                event.kind,
                first_seven_base64_chars(&event.msg_hash.bytes())
            )
        })
    }
}

impl Logger for InvalidMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &InvalidMessageEvent| {
            log::debug!(
                "{}, {}, {}, {}",
                INVALID_MESSAGE,
                secs_since_unix_epoch(event.timestamp),
                event.kind,
                first_seven_base64_chars(&event.msg_hash.bytes())
            )
        })
    }
}

impl Logger for PairSlotEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &PairSlotEvent| {
            log::trace!(
                "{}, {}, {}, {}, {}, {}",
                PAIR_SLOT,
                secs_since_unix_epoch(event.timestamp),
                event.db_height,
                event.vm_index,
                event.height,
                first_seven_base64_chars(&event.msg_hash.bytes())
            )
        })
    }
}

impl Logger for StoreCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StoreCommitEvent| {
            log::trace!(
                "{}, {}, {}, {}",
                STORE_COMMIT,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.entry_hash.bytes()),
                event.credits.int()
            )
        })
    }
}

impl Logger for ProcessRevealEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ProcessRevealEvent| {
            log::trace!(
                "{}, {}, {}, {}",
                PROCESS_REVEAL,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.entry_hash.bytes()),
                first_seven_base64_chars(&event.chain_id.bytes())
            )
        })
    }
}

impl Logger for ReviewHoldingEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReviewHoldingEvent| {
            log::trace!(
                "{}, {}, {}, {}",
                REVIEW_HOLDING,
                secs_since_unix_epoch(event.timestamp),
                event.promoted,
                event.expired
            )
        })
    }
}

impl Logger for SwapServerEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &SwapServerEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                SWAP_SERVER,
                secs_since_unix_epoch(event.timestamp),
                event.db_height,
                first_seven_base64_chars(&event.demoted.bytes()),
                first_seven_base64_chars(&event.promoted.bytes())
            )
        })
    }
}

impl Logger for ClearFaultEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ClearFaultEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                CLEAR_FAULT,
                secs_since_unix_epoch(event.timestamp),
                event.db_height,
                first_seven_base64_chars(&event.server_id.bytes())
            )
        })
    }
}
