// src/core/messaging/loopback.rs

//! In-memory, multi-daemon test double for [`super::MessageBus`]. Several
//! [`LoopbackBus`] handles share one [`LoopbackHub`], giving integration
//! tests real virtual-synchrony-like delivery ordering without sockets
//! (SPEC_FULL §E), in the spirit of the teacher's in-process
//! `LoopbackBus`/`LoopbackOracle` test harness idiom.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::errors::GroupdError;
use crate::core::node::NodeId;
use crate::core::wire::WireMessage;

use super::{BusEvent, ConfigChange, MessageBus, Scope};

struct ScopeState {
    members: Vec<NodeId>,
    senders: HashMap<NodeId, mpsc::UnboundedSender<BusEvent>>,
}

#[derive(Default)]
pub struct LoopbackHub {
    scopes: Mutex<HashMap<Scope, ScopeState>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackHub {
            scopes: Mutex::new(HashMap::new()),
        })
    }
}

pub struct LoopbackBus {
    nodeid: NodeId,
    hub: Arc<LoopbackHub>,
    tx: mpsc::UnboundedSender<BusEvent>,
}

impl LoopbackBus {
    pub fn new(nodeid: NodeId, hub: Arc<LoopbackHub>) -> (Self, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LoopbackBus { nodeid, hub, tx }, rx)
    }
}

#[async_trait]
impl MessageBus for LoopbackBus {
    async fn join(&self, scope: Scope) -> Result<(), GroupdError> {
        let mut scopes = self.hub.scopes.lock();
        let state = scopes.entry(scope).or_insert_with(|| ScopeState {
            members: Vec::new(),
            senders: HashMap::new(),
        });
        if !state.members.contains(&self.nodeid) {
            state.members.push(self.nodeid);
        }
        state.senders.insert(self.nodeid, self.tx.clone());

        let members = state.members.clone();
        let senders: Vec<_> = state.senders.values().cloned().collect();
        drop(scopes);

        let change = BusEvent::ConfigChanged(ConfigChange {
            scope,
            members,
            joined: vec![self.nodeid],
            left: vec![],
        });
        for sender in senders {
            let _ = sender.send(change.clone());
        }
        Ok(())
    }

    async fn leave(&self, scope: Scope) -> Result<(), GroupdError> {
        let mut scopes = self.hub.scopes.lock();
        let Some(state) = scopes.get_mut(&scope) else {
            return Ok(());
        };
        state.members.retain(|&id| id != self.nodeid);
        state.senders.remove(&self.nodeid);

        let members = state.members.clone();
        let senders: Vec<_> = state.senders.values().cloned().collect();
        drop(scopes);

        let change = BusEvent::ConfigChanged(ConfigChange {
            scope,
            members,
            joined: vec![],
            left: vec![self.nodeid],
        });
        for sender in senders {
            let _ = sender.send(change.clone());
        }
        Ok(())
    }

    async fn multicast(&self, scope: Scope, message: WireMessage) -> Result<(), GroupdError> {
        let scopes = self.hub.scopes.lock();
        let Some(state) = scopes.get(&scope) else {
            return Err(GroupdError::BusSendFailed("scope not joined".into()));
        };
        let senders: Vec<_> = state.senders.values().cloned().collect();
        drop(scopes);

        let event = BusEvent::Delivered {
            scope,
            sender: self.nodeid,
            message,
        };
        for sender in senders {
            let _ = sender.send(event.clone());
        }
        Ok(())
    }

    async fn send_to(&self, scope: Scope, nodeid: NodeId, message: WireMessage) -> Result<(), GroupdError> {
        let scopes = self.hub.scopes.lock();
        let Some(state) = scopes.get(&scope) else {
            return Err(GroupdError::BusSendFailed("scope not joined".into()));
        };
        let Some(sender) = state.senders.get(&nodeid).cloned() else {
            return Err(GroupdError::BusSendFailed(format!("node {nodeid} not in scope")));
        };
        drop(scopes);

        let event = BusEvent::Delivered {
            scope,
            sender: self.nodeid,
            message,
        };
        let _ = sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wire::{Header, MessageType, Status};
    use bytes::Bytes;

    fn msg() -> WireMessage {
        WireMessage::new(
            Header {
                ms_type: MessageType::JoinReq,
                ms_status: Status::Pos,
                ms_level: 0,
                ms_event_id: 1,
                ms_group_id: 0,
                ms_last_id: 0,
                ms_to_nodeid: 0,
            },
            Bytes::new(),
        )
    }

    #[tokio::test]
    async fn join_then_multicast_is_delivered_to_all_members() {
        let hub = LoopbackHub::new();
        let (bus1, mut rx1) = LoopbackBus::new(1, hub.clone());
        let (bus2, mut rx2) = LoopbackBus::new(2, hub.clone());

        bus1.join(Scope::DaemonPeers).await.unwrap();
        bus2.join(Scope::DaemonPeers).await.unwrap();

        // both sides observed the second join as a config change
        let _ = rx1.recv().await.unwrap();
        let _ = rx2.recv().await.unwrap();

        bus1.multicast(Scope::DaemonPeers, msg()).await.unwrap();
        let delivered = rx2.recv().await.unwrap();
        assert!(matches!(delivered, BusEvent::Delivered { sender: 1, .. }));
    }
}
