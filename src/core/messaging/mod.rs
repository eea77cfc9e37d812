// src/core/messaging/mod.rs

//! Messaging Adapter (spec §4.3): typed send/receive over an ordered
//! virtually-synchronous bus scoped to the daemon-peer group and to each
//! managed group.

pub mod loopback;
pub mod udp;

use async_trait::async_trait;

use crate::core::errors::GroupdError;
use crate::core::node::NodeId;
use crate::core::wire::WireMessage;

/// Identifies a virtual-synchrony scope: the daemon-peer scope, or the
/// per-group scope for a given global-id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    DaemonPeers,
    Group(u32),
}

/// A configuration-change notification for a scope (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub scope: Scope,
    pub members: Vec<NodeId>,
    pub joined: Vec<NodeId>,
    pub left: Vec<NodeId>,
}

/// An event delivered to the core from the bus: either a message or a
/// membership configuration change for one of the joined scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Delivered {
        scope: Scope,
        sender: NodeId,
        message: WireMessage,
    },
    ConfigChanged(ConfigChange),
}

/// Narrow contract the core consumes from the reliable virtual-synchrony
/// transport (spec §6, "Messaging bus contract (consumed)").
///
/// The trait is intentionally free of retry logic: the adapter implementing
/// it is responsible for the bounded local retry on transient "try-again"
/// outcomes described in spec §4.3; callers treat [`GroupdError::BusSendFailed`]
/// as the exhausted-retry case, which is fatal to the daemon per spec §7.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Join a scope, beginning delivery of its messages and config changes.
    async fn join(&self, scope: Scope) -> Result<(), GroupdError>;

    /// Leave a scope. A no-op if not joined.
    async fn leave(&self, scope: Scope) -> Result<(), GroupdError>;

    /// Multicast a message to every current member of `scope`.
    async fn multicast(&self, scope: Scope, message: WireMessage) -> Result<(), GroupdError>;

    /// Send a message addressed to a single node within `scope`.
    async fn send_to(&self, scope: Scope, nodeid: NodeId, message: WireMessage) -> Result<(), GroupdError>;
}
