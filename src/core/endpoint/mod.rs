// src/core/endpoint/mod.rs

//! Client Protocol Endpoint (spec §4.7): local stream IPC to subsystem
//! clients. Each client registers with `setup` and then issues
//! line-oriented commands; the daemon answers with line-oriented
//! callbacks on the same connection.

pub mod listener;
pub mod protocol;

use std::collections::HashMap;

use tokio::sync::mpsc;

pub use protocol::{ClientCallback, ClientCommand, ClientCodec};

pub type ClientId = u64;

/// What a connected client declared via `setup` (spec §4.7).
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub type_label: String,
    pub level: u8,
}

/// The set of connected clients and the channel used to push callbacks
/// to each one's connection task, mirroring the teacher's per-connection
/// outbound channel in `connection/handler.rs`.
#[derive(Default)]
pub struct ClientTable {
    clients: HashMap<ClientId, (Option<ClientIdentity>, mpsc::UnboundedSender<ClientCallback>)>,
    next_id: ClientId,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tx: mpsc::UnboundedSender<ClientCallback>) -> ClientId {
        self.next_id += 1;
        let id = self.next_id;
        self.clients.insert(id, (None, tx));
        id
    }

    pub fn setup(&mut self, id: ClientId, identity: ClientIdentity) {
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.0 = Some(identity);
        }
    }

    pub fn identity(&self, id: ClientId) -> Option<&ClientIdentity> {
        self.clients.get(&id).and_then(|(identity, _)| identity.as_ref())
    }

    pub fn send(&self, id: ClientId, callback: ClientCallback) -> bool {
        match self.clients.get(&id) {
            Some((_, tx)) => tx.send(callback).is_ok(),
            None => false,
        }
    }

    pub fn disconnect(&mut self, id: ClientId) {
        self.clients.remove(&id);
    }
}
