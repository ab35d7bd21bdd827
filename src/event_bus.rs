/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the [consensus](crate::consensus) thread and passes them
//! to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it triggers the
//! execution of all handlers defined for the contained event type, where the handlers for each
//! event type are stored in [`EventHandlers`].
//!
//! When no handlers are present in a node's instance of `EventHandlers` this thread is not
//! started.

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the argument (for our use case, event) type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the two optional handlers enabled for an event type that implements the [`Logger`]
/// trait, namely one logging handler, defined in [`logging`](crate::logging), and one
/// user-defined handler, passed in when the node is built.
pub(crate) struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    // Checks if no event handlers are defined for this event.
    fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    /// Creates a new `HandlerPair` with the user-defined handler, and the default logging handler
    /// if logging is enabled.
    fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        self.user_defined_handler.iter().for_each(|handler| handler(event));
        self.logging_handler.iter().for_each(|handler| handler(event));
    }
}

/// Stores the `HandlerPair` of user-defined and optional logging handlers for each pre-defined
/// event type from [events](crate::events).
pub(crate) struct EventHandlers {
    pub(crate) apply_snapshot_handlers: HandlerPair<ApplySnapshotEvent>,
    pub(crate) ignore_snapshot_handlers: HandlerPair<IgnoreSnapshotEvent>,
    pub(crate) complete_block_handlers: HandlerPair<CompleteBlockEvent>,

    pub(crate) start_minute_sync_handlers: HandlerPair<StartMinuteSyncEvent>,
    pub(crate) complete_minute_handlers: HandlerPair<CompleteMinuteEvent>,
    pub(crate) generate_dbsig_handlers: HandlerPair<GenerateDbSigEvent>,
    pub(crate) send_heartbeat_handlers: HandlerPair<SendHeartbeatEvent>,

    pub(crate) hold_message_handlers: HandlerPair<HoldMessageEvent>,
    pub(crate) invalid_message_handlers: HandlerPair<InvalidMessageEvent>,
    pub(crate) pair_slot_handlers: HandlerPair<PairSlotEvent>,
    pub(crate) store_commit_handlers: HandlerPair<StoreCommitEvent>,
    pub(crate) process_reveal_handlers: HandlerPair<ProcessRevealEvent>,
    pub(crate) review_holding_handlers: HandlerPair<ReviewHoldingEvent>,

    pub(crate) swap_server_handlers: HandlerPair<SwapServerEvent>,
    pub(crate) clear_fault_handlers: HandlerPair<ClearFaultEvent>,
}

/// User-defined handlers collected by the node builder. All default to `None`.
#[derive(Default)]
pub struct UserHandlers {
    pub apply_snapshot: Option<HandlerPtr<ApplySnapshotEvent>>,
    pub ignore_snapshot: Option<HandlerPtr<IgnoreSnapshotEvent>>,
    pub complete_block: Option<HandlerPtr<CompleteBlockEvent>>,
    pub start_minute_sync: Option<HandlerPtr<StartMinuteSyncEvent>>,
    pub complete_minute: Option<HandlerPtr<CompleteMinuteEvent>>,
    pub generate_dbsig: Option<HandlerPtr<GenerateDbSigEvent>>,
    pub send_heartbeat: Option<HandlerPtr<SendHeartbeatEvent>>,
    pub hold_message: Option<HandlerPtr<HoldMessageEvent>>,
    pub invalid_message: Option<HandlerPtr<InvalidMessageEvent>>,
    pub pair_slot: Option<HandlerPtr<PairSlotEvent>>,
    pub store_commit: Option<HandlerPtr<StoreCommitEvent>>,
    pub process_reveal: Option<HandlerPtr<ProcessRevealEvent>>,
    pub review_holding: Option<HandlerPtr<ReviewHoldingEvent>>,
    pub swap_server: Option<HandlerPtr<SwapServerEvent>>,
    pub clear_fault: Option<HandlerPtr<ClearFaultEvent>>,
}

impl EventHandlers {
    /// Creates the [handler pairs](HandlerPair) for all pre-defined event types given the
    /// user-defined handlers, and information on whether logging is enabled.
    pub(crate) fn new(log: bool, user: UserHandlers) -> EventHandlers {
        EventHandlers {
            apply_snapshot_handlers: HandlerPair::new(log, user.apply_snapshot),
            ignore_snapshot_handlers: HandlerPair::new(log, user.ignore_snapshot),
            complete_block_handlers: HandlerPair::new(log, user.complete_block),
            start_minute_sync_handlers: HandlerPair::new(log, user.start_minute_sync),
            complete_minute_handlers: HandlerPair::new(log, user.complete_minute),
            generate_dbsig_handlers: HandlerPair::new(log, user.generate_dbsig),
            send_heartbeat_handlers: HandlerPair::new(log, user.send_heartbeat),
            hold_message_handlers: HandlerPair::new(log, user.hold_message),
            invalid_message_handlers: HandlerPair::new(log, user.invalid_message),
            pair_slot_handlers: HandlerPair::new(log, user.pair_slot),
            store_commit_handlers: HandlerPair::new(log, user.store_commit),
            process_reveal_handlers: HandlerPair::new(log, user.process_reveal),
            review_holding_handlers: HandlerPair::new(log, user.review_holding),
            swap_server_handlers: HandlerPair::new(log, user.swap_server),
            clear_fault_handlers: HandlerPair::new(log, user.clear_fault),
        }
    }

    /// Checks if no handlers are defined, i.e., neither user-defined handlers were given nor
    /// logging is enabled.
    pub(crate) fn is_empty(&self) -> bool {
        self.apply_snapshot_handlers.is_empty()
            && self.ignore_snapshot_handlers.is_empty()
            && self.complete_block_handlers.is_empty()
            && self.start_minute_sync_handlers.is_empty()
            && self.complete_minute_handlers.is_empty()
            && self.generate_dbsig_handlers.is_empty()
            && self.send_heartbeat_handlers.is_empty()
            && self.hold_message_handlers.is_empty()
            && self.invalid_message_handlers.is_empty()
            && self.pair_slot_handlers.is_empty()
            && self.store_commit_handlers.is_empty()
            && self.process_reveal_handlers.is_empty()
            && self.review_holding_handlers.is_empty()
            && self.swap_server_handlers.is_empty()
            && self.clear_fault_handlers.is_empty()
    }

    /// Triggers the execution of each of the two handlers - the user-defined and the logging
    /// handler, if defined - for a given event.
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ApplySnapshot(event) => self.apply_snapshot_handlers.fire(&event),
            Event::IgnoreSnapshot(event) => self.ignore_snapshot_handlers.fire(&event),
            Event::CompleteBlock(event) => self.complete_block_handlers.fire(&event),
            Event::StartMinuteSync(event) => self.start_minute_sync_handlers.fire(&event),
            Event::CompleteMinute(event) => self.complete_minute_handlers.fire(&event),
            Event::GenerateDbSig(event) => self.generate_dbsig_handlers.fire(&event),
            Event::SendHeartbeat(event) => self.send_heartbeat_handlers.fire(&event),
            Event::HoldMessage(event) => self.hold_message_handlers.fire(&event),
            Event::InvalidMessage(event) => self.invalid_message_handlers.fire(&event),
            Event::PairSlot(event) => self.pair_slot_handlers.fire(&event),
            Event::StoreCommit(event) => self.store_commit_handlers.fire(&event),
            Event::ProcessReveal(event) => self.process_reveal_handlers.fire(&event),
            Event::ReviewHolding(event) => self.review_holding_handlers.fire(&event),
            Event::SwapServer(event) => self.swap_server_handlers.fire(&event),
            Event::ClearFault(event) => self.clear_fault_handlers.fire(&event),
        }
    }
}

/// Starts the event bus thread. The thread drains the event subscriber until shutdown is
/// signalled, then drains whatever remains before exiting.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => {
                while let Ok(event) = event_subscriber.try_recv() {
                    event_handlers.fire_handlers(event);
                }
                return;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                panic!("the event bus thread's shutdown signal was disconnected")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => return,
        }
    })
}
