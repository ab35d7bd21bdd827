//! A recording network stub: every broadcast and directed send is captured for inspection.

use std::sync::{Arc, Mutex};

use fedchain_rs::{
    messages::Message,
    networking::network::Network,
    types::data_types::ServerId,
};

#[derive(Clone, Default)]
pub(crate) struct RecordingNetwork {
    broadcasts: Arc<Mutex<Vec<Message>>>,
    sends: Arc<Mutex<Vec<(ServerId, Message)>>>,
}

impl RecordingNetwork {
    pub(crate) fn new() -> RecordingNetwork {
        RecordingNetwork::default()
    }

    pub(crate) fn broadcasts(&self) -> Vec<Message> {
        self.broadcasts.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub(crate) fn sends(&self) -> Vec<(ServerId, Message)> {
        self.sends.lock().unwrap().clone()
    }
}

impl Network for RecordingNetwork {
    fn broadcast(&mut self, message: Message) {
        self.broadcasts.lock().unwrap().push(message);
    }

    fn send(&mut self, peer: ServerId, message: Message) {
        self.sends.lock().unwrap().push((peer, message));
    }
}
