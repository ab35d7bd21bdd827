/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that build and start a node, and the type that keeps it alive.
//!
//! A [`Node`] owns two threads: the consensus thread running the
//! [process loop](crate::consensus::process), and (when any handlers are registered or logging is
//! enabled) the [event bus](crate::event_bus) thread. The embedder supplies the pluggable pieces:
//! a [`BlockStore`](crate::storage::pluggables::BlockStore), a
//! [`Network`](crate::networking::network::Network), the initial
//! [`AuthoritySet`](crate::types::authority::AuthoritySet), and optionally a
//! [`ConfigSource`](crate::consensus::state::ConfigSource) for identity hot-reload.
//!
//! Inbound traffic goes through the [`NodeHandle`]: `submit` classifies each message into the
//! bounded ack or message queue and fails fast when the node is saturated.

use std::{
    collections::HashMap,
    sync::mpsc::{self, Sender},
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    consensus::state::{ConfigSource, ConsensusCore, CoreChannels, CoreConfig},
    engine::start_engine,
    event_bus::{start_event_bus, EventHandlers, UserHandlers},
    messages::{Message, Payload},
    networking::{
        network::Network,
        queues::{bounded, QueueReceiver, QueueSender},
    },
    storage::pluggables::BlockStore,
    types::{
        authority::{AuthoritySet, Server},
        blocks::Entry,
        crypto_primitives::Keypair,
        data_types::{CryptoHash, ServerId},
    },
};

/// Configuration for a node. Build one with [`Configuration::builder`].
pub struct Configuration {
    pub identity_chain_id: ServerId,
    pub keypair: Keypair,
    pub salt: CryptoHash,
    pub network_name: String,
    pub checkpoints: HashMap<u32, String>,
    pub start_delay: Duration,
    pub fault_timeout: Duration,
    pub keep_mismatch: bool,
    pub ack_change: u32,
    pub initial_fed_servers: Vec<Server>,
    pub initial_audit_servers: Vec<Server>,
    pub inbound_queue_capacity: usize,
    pub log_events: bool,
}

impl Configuration {
    pub fn builder(identity_chain_id: ServerId, keypair: Keypair) -> ConfigurationBuilder {
        ConfigurationBuilder {
            configuration: Configuration {
                identity_chain_id,
                keypair,
                salt: CryptoHash::zero(),
                network_name: "LOCAL".to_string(),
                checkpoints: HashMap::new(),
                start_delay: Duration::from_secs(20),
                fault_timeout: Duration::from_secs(120),
                keep_mismatch: false,
                ack_change: 0,
                initial_fed_servers: Vec::new(),
                initial_audit_servers: Vec::new(),
                inbound_queue_capacity: 10_000,
                log_events: false,
            },
        }
    }

    fn into_core_config(self) -> CoreConfig {
        CoreConfig {
            identity_chain_id: self.identity_chain_id,
            keypair: self.keypair,
            salt: self.salt,
            network_name: self.network_name,
            checkpoints: self.checkpoints,
            start_delay_limit_millis: self.start_delay.as_millis() as i64,
            fault_timeout_secs: self.fault_timeout.as_secs() as i64,
            keep_mismatch: self.keep_mismatch,
            ack_change: self.ack_change,
            initial_fed_servers: self.initial_fed_servers,
            initial_audit_servers: self.initial_audit_servers,
        }
    }
}

pub struct ConfigurationBuilder {
    configuration: Configuration,
}

impl ConfigurationBuilder {
    pub fn salt(mut self, salt: CryptoHash) -> Self {
        self.configuration.salt = salt;
        self
    }

    pub fn network_name(mut self, network_name: impl Into<String>) -> Self {
        self.configuration.network_name = network_name.into();
        self
    }

    pub fn checkpoints(mut self, checkpoints: HashMap<u32, String>) -> Self {
        self.configuration.checkpoints = checkpoints;
        self
    }

    pub fn start_delay(mut self, start_delay: Duration) -> Self {
        self.configuration.start_delay = start_delay;
        self
    }

    pub fn fault_timeout(mut self, fault_timeout: Duration) -> Self {
        self.configuration.fault_timeout = fault_timeout;
        self
    }

    pub fn keep_mismatch(mut self, keep_mismatch: bool) -> Self {
        self.configuration.keep_mismatch = keep_mismatch;
        self
    }

    pub fn ack_change(mut self, ack_change: u32) -> Self {
        self.configuration.ack_change = ack_change;
        self
    }

    pub fn initial_fed_servers(mut self, servers: Vec<Server>) -> Self {
        self.configuration.initial_fed_servers = servers;
        self
    }

    pub fn initial_audit_servers(mut self, servers: Vec<Server>) -> Self {
        self.configuration.initial_audit_servers = servers;
        self
    }

    pub fn inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.configuration.inbound_queue_capacity = capacity;
        self
    }

    pub fn log_events(mut self, log_events: bool) -> Self {
        self.configuration.log_events = log_events;
        self
    }

    pub fn build(self) -> Configuration {
        self.configuration
    }
}

/// The producer-side handle: how network and API threads feed the consensus core.
#[derive(Clone)]
pub struct NodeHandle {
    ack_queue: QueueSender<Message>,
    msg_queue: QueueSender<Message>,
}

impl NodeHandle {
    /// Enqueue an inbound message, routing acks onto their dedicated queue. Fails fast with the
    /// message when the node is saturated; dropping under backpressure is the design.
    pub fn submit(&self, msg: Message) -> Result<(), Message> {
        match msg.payload {
            Payload::Ack(_) => self.ack_queue.try_send(msg),
            _ => self.msg_queue.try_send(msg),
        }
    }

    pub fn inbound_depth(&self) -> usize {
        self.ack_queue.len() + self.msg_queue.len()
    }
}

/// The consumer sides of the node's outbound queues.
pub struct NodeOutputs {
    /// Messages that validated as invalid-forever, for the embedder to gossip as such.
    pub invalid_messages: QueueReceiver<Message>,
    /// Entries recovered out-of-band, for the embedder to persist.
    pub entries_to_write: QueueReceiver<Entry>,
}

/// A running node. Dropping it shuts both threads down in order.
pub struct Node {
    handle: NodeHandle,
    engine: Option<JoinHandle<()>>,
    engine_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Node {
    /// Start a node. Returns the running node and the consumer sides of its outbound queues.
    pub fn start<S: BlockStore, N: Network>(
        configuration: Configuration,
        store: S,
        network: N,
        authorities: AuthoritySet,
        config_source: Option<Box<dyn ConfigSource>>,
        handlers: UserHandlers,
    ) -> (Node, NodeOutputs) {
        let capacity = configuration.inbound_queue_capacity;
        let log_events = configuration.log_events;

        let (ack_tx, ack_rx) = bounded(capacity);
        let (msg_tx, msg_rx) = bounded(capacity);
        let (invalid_tx, invalid_rx) = bounded(capacity);
        let (write_entry_tx, write_entry_rx) = bounded(capacity);

        let event_handlers = EventHandlers::new(log_events, handlers);
        let (event_publisher, event_bus, event_bus_shutdown) = if event_handlers.is_empty() {
            (None, None, None)
        } else {
            let (publisher, subscriber) = mpsc::channel();
            let (shutdown_tx, shutdown_rx) = mpsc::channel();
            let bus = start_event_bus(event_handlers, subscriber, shutdown_rx);
            (Some(publisher), Some(bus), Some(shutdown_tx))
        };

        let core = ConsensusCore::new(
            configuration.into_core_config(),
            config_source,
            store,
            network,
            CoreChannels {
                ack_queue: ack_rx,
                msg_queue: msg_rx,
                network_invalid: invalid_tx,
                write_entry: write_entry_tx,
            },
            authorities,
            event_publisher,
        );

        let (engine_shutdown, engine_shutdown_rx) = mpsc::channel();
        let engine = start_engine(core, engine_shutdown_rx);

        let node = Node {
            handle: NodeHandle {
                ack_queue: ack_tx,
                msg_queue: msg_tx,
            },
            engine: Some(engine),
            engine_shutdown,
            event_bus,
            event_bus_shutdown,
        };
        let outputs = NodeOutputs {
            invalid_messages: invalid_rx,
            entries_to_write: write_entry_rx,
        };
        (node, outputs)
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // The consensus thread publishes events, so it must stop before the event bus does.
        let _ = self.engine_shutdown.send(());
        if let Some(engine) = self.engine.take() {
            let _ = engine.join();
        }
        if let Some(shutdown) = self.event_bus_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}
