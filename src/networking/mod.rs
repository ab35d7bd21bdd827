/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer networking and the bounded inbound queues.
//!
//! All network I/O lives outside this crate. The embedder implements [`Network`](network::Network)
//! for the outbound direction and feeds inbound traffic through the bounded
//! [queues](queues) the node hands out on construction. The queues are deliberately lossy under
//! backpressure: when the inbound queue runs high, gap-fill responses are dropped and the holding
//! review is skipped, because a node that is drowning should catch up through block snapshots
//! rather than through individual messages.

pub mod network;

pub mod queues;
