// src/core/messaging/udp.rs

//! Reference [`MessageBus`] implementation: best-effort UDP datagrams
//! carrying the [`crate::core::wire`] format, with bounded local retry on
//! send failure. Grounded on the teacher's `core/cluster/gossip.rs::run`
//! receive-loop idiom (one task owns the socket; decoded datagrams are
//! forwarded to the core over a channel) rather than on a real virtual-
//! synchrony transport, which SPEC_FULL §G explicitly leaves pluggable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::core::errors::GroupdError;
use crate::core::node::NodeId;
use crate::core::wire::{WireCodec, WireMessage};

use super::{BusEvent, ConfigChange, MessageBus, Scope};

const SEND_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Static node-id → socket-address table. The real cluster conf would
/// populate this; tests and small deployments can build it directly.
#[derive(Debug, Default, Clone)]
pub struct PeerTable {
    addrs: HashMap<NodeId, SocketAddr>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: NodeId, addr: SocketAddr) {
        self.addrs.insert(id, addr);
    }

    pub fn addr_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.addrs.get(&id).copied()
    }
}

struct ScopeMembers {
    members: Vec<NodeId>,
}

/// A UDP-backed [`MessageBus`]. One socket per daemon process; scope
/// membership is tracked locally and config-change notifications are
/// synthesized on join/leave (no genuine cross-node config agreement —
/// acceptable for the reference transport per SPEC_FULL §G).
pub struct UdpBus {
    socket: Arc<UdpSocket>,
    our_nodeid: NodeId,
    peers: PeerTable,
    scopes: Mutex<HashMap<Scope, ScopeMembers>>,
    events_tx: mpsc::UnboundedSender<BusEvent>,
}

impl UdpBus {
    /// Binds the socket and spawns the receive loop, returning the bus
    /// handle plus the event stream the daemon's main loop selects on.
    pub async fn bind(
        bind_addr: SocketAddr,
        our_nodeid: NodeId,
        peers: PeerTable,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<BusEvent>), GroupdError> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let bus = Arc::new(UdpBus {
            socket,
            our_nodeid,
            peers,
            scopes: Mutex::new(HashMap::new()),
            events_tx,
        });

        bus.clone().spawn_receiver();
        Ok((bus, events_rx))
    }

    fn spawn_receiver(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (n, from) = match self.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "udp bus recv failed");
                        continue;
                    }
                };
                let mut bytes = BytesMut::from(&buf[..n]);
                let mut codec = WireCodec;
                match codec.decode(&mut bytes) {
                    Ok(Some(message)) => {
                        let Some(sender) = self.sender_for_addr(from) else {
                            debug!(%from, "datagram from unregistered peer, dropping");
                            continue;
                        };
                        let scope = Scope::Group(message.header.ms_group_id);
                        let event = BusEvent::Delivered { scope, sender, message };
                        let _ = self.events_tx.send(event);
                    }
                    Ok(None) => debug!(%from, "incomplete datagram, dropping"),
                    Err(e) => warn!(%from, error = %e, "malformed datagram, dropping"),
                }
            }
        });
    }

    fn sender_for_addr(&self, addr: SocketAddr) -> Option<NodeId> {
        self.peers.addrs.iter().find(|(_, a)| **a == addr).map(|(id, _)| *id)
    }

    async fn send_datagram(&self, addr: SocketAddr, message: &WireMessage) -> Result<(), GroupdError> {
        let mut buf = BytesMut::new();
        let mut codec = WireCodec;
        codec.encode(message.clone(), &mut buf)?;

        let mut attempt = 0;
        loop {
            match self.socket.send_to(&buf, addr).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < SEND_RETRIES => {
                    attempt += 1;
                    // Jitter the backoff so a burst of sends that all hit a
                    // momentarily full socket buffer don't retry in lockstep.
                    let jitter = rand::thread_rng().gen_range(0..RETRY_BACKOFF.as_millis() as u64 / 2 + 1);
                    warn!(%addr, error = %e, attempt, "transient send failure, retrying");
                    tokio::time::sleep(RETRY_BACKOFF + Duration::from_millis(jitter)).await;
                }
                Err(e) => {
                    return Err(GroupdError::BusSendFailed(format!(
                        "send to {addr} failed after {SEND_RETRIES} retries: {e}"
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl MessageBus for UdpBus {
    async fn join(&self, scope: Scope) -> Result<(), GroupdError> {
        let mut scopes = self.scopes.lock();
        let entry = scopes.entry(scope).or_insert_with(|| ScopeMembers { members: vec![] });
        if !entry.members.contains(&self.our_nodeid) {
            entry.members.push(self.our_nodeid);
        }
        let members = entry.members.clone();
        drop(scopes);

        let _ = self.events_tx.send(BusEvent::ConfigChanged(ConfigChange {
            scope,
            members,
            joined: vec![self.our_nodeid],
            left: vec![],
        }));
        Ok(())
    }

    async fn leave(&self, scope: Scope) -> Result<(), GroupdError> {
        let mut scopes = self.scopes.lock();
        if let Some(entry) = scopes.get_mut(&scope) {
            entry.members.retain(|&id| id != self.our_nodeid);
            let members = entry.members.clone();
            drop(scopes);
            let _ = self.events_tx.send(BusEvent::ConfigChanged(ConfigChange {
                scope,
                members,
                joined: vec![],
                left: vec![self.our_nodeid],
            }));
        }
        Ok(())
    }

    async fn multicast(&self, scope: Scope, message: WireMessage) -> Result<(), GroupdError> {
        let targets: Vec<NodeId> = {
            let scopes = self.scopes.lock();
            scopes
                .get(&scope)
                .map(|s| s.members.clone())
                .unwrap_or_default()
        };
        for nodeid in targets {
            if nodeid == self.our_nodeid {
                continue;
            }
            if let Some(addr) = self.peers.addr_of(nodeid) {
                self.send_datagram(addr, &message).await?;
            }
        }
        Ok(())
    }

    async fn send_to(&self, _scope: Scope, nodeid: NodeId, message: WireMessage) -> Result<(), GroupdError> {
        let addr = self
            .peers
            .addr_of(nodeid)
            .ok_or_else(|| GroupdError::BusSendFailed(format!("no address for node {nodeid}")))?;
        self.send_datagram(addr, &message).await
    }
}
