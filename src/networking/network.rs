/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for pluggable peer-to-peer (P2P) networking.
//!
//! Main trait: [`Network`].

use crate::{messages::Message, types::data_types::ServerId};

/// Trait for pluggable peer-to-peer (P2P) networking.
pub trait Network: Clone + Send + 'static {
    /// Send a message to all peers without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: ServerId, message: Message);
}

/// Handle for sending and broadcasting messages to the [`Network`].
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N) -> Self {
        Self { network }
    }

    /// Broadcast `msg` unless it is peer-to-peer traffic, which never fans out.
    pub(crate) fn send_out(&mut self, msg: &Message) {
        if msg.is_peer_to_peer() {
            return;
        }
        self.network.broadcast(msg.clone());
    }

    pub(crate) fn broadcast(&mut self, msg: Message) {
        self.network.broadcast(msg);
    }

    pub(crate) fn send(&mut self, peer: ServerId, msg: Message) {
        self.network.send(peer, msg);
    }
}
