/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus core: the single-threaded state machine that drives a node through the leader and
//! follower roles of minute-based federated block production.
//!
//! ## Structure
//!
//! All consensus state lives in one struct, [`ConsensusCore`](state::ConsensusCore), owned by one
//! thread. The modules here split its behavior by concern:
//!
//! - [`state`]: the struct itself, its configuration, counters, and small accessors
//!   (acknowledgement construction, balance reads, salts).
//! - [`executor`]: classification and dispatch of every inbound message through
//!   `validate → (leader-execute ‖ follower-execute)`, including block snapshot application.
//! - [`apply`]: the per-variant process functions that run when a process-list slot is consumed
//!   (commits, reveals, authority management).
//! - [`minutes`]: the end-of-minute and directory-block-signature synchronization machines that
//!   advance `current_minute` and close blocks.
//! - [`faults`]: the full-server-fault protocol that swaps a stalled federated server for a
//!   pledged audit server.
//! - [`process`]: the outer cooperative process loop and the periodic holding review.
//!
//! ## Concurrency model
//!
//! External producers only touch the bounded [queues](crate::networking::queues); the consensus
//! thread is the sole mutator of everything else. The permanent balance maps are the one
//! exception: API readers may inspect them concurrently, so they sit behind mutexes in
//! [`ledger`].

pub mod apply;

pub mod executor;

pub mod faults;

pub mod ledger;

pub mod minutes;

pub mod process;

pub mod state;
