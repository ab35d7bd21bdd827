/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! fedchain-rs is a Rust library implementing the consensus processing core of a federated
//! blockchain node: multi-leader, minute-based block production over directory blocks.
//!
//! ## Protocol shape
//!
//! Time is divided into ten-minute blocks, each subdivided into ten minutes. Every federated
//! server leads one [virtual server](process_list) stream per block, stamping the messages it is
//! responsible for with signed [acknowledgements](messages::Ack) that fix their order. Minutes
//! close when every federated VM has produced its [end-of-minute marker](messages::EndOfMinute);
//! blocks close at minute ten, and each new block opens with a round of
//! [directory block signatures](messages::DirectoryBlockSignature) over the previous one. A
//! federated server that stalls is swapped for a pledged audit server through the
//! [fault protocol](consensus::faults).
//!
//! ## What the library does and does not do
//!
//! This crate owns consensus state and message processing: the
//! [process loop](consensus::process), the [holding and review machinery](holding), the
//! [replay filters](replay), [commit/reveal pairing](commits), the per-block
//! [process lists](process_list) and the [ledger of completed blocks](dbstate).
//!
//! Networking and persistence are pluggable: the embedder implements
//! [`Network`](networking::network::Network) and
//! [`BlockStore`](storage::pluggables::BlockStore), seeds the initial
//! [authority set](types::authority::AuthoritySet), and starts a [node](node::Node). Observable
//! occurrences inside the core are published as [events](events), which the
//! [event bus](event_bus) dispatches to user handlers and the default [CSV logs](logging).

pub mod commits;

pub mod consensus;

pub mod dbstate;

pub(crate) mod engine;

pub mod event_bus;

pub mod events;

pub mod holding;

pub mod logging;

pub mod messages;

pub mod networking;

pub mod node;

pub mod process_list;

pub mod replay;

pub mod storage;

pub mod types;
