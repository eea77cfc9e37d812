// src/core/node.rs

//! Node identity and liveness bookkeeping, as maintained by the
//! [`crate::core::oracle`] adapter (`gd_internal.h: struct node`).

use bitflags::bitflags;

pub type NodeId = u32;

bitflags! {
    /// Mirrors the original `NFL_*` node flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// The oracle currently counts this node among the cluster membership.
        const CLUSTER_MEMBER = 0b0000_0001;
        /// At least one group on this node still needs recovery work.
        const NEEDS_RECOVERY = 0b0000_0010;
        /// The node has announced it is leaving the cluster cleanly.
        const LEAVING = 0b0000_0100;
    }
}

/// A single node as tracked by the daemon's local view of cluster membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub flags: NodeFlags,
    /// Strictly increases across a fail-then-rejoin of the same `id`.
    pub incarnation: u32,
    /// Set once the peer daemon on this node has been observed reachable
    /// on the messaging bus; gates inclusion in group addition (spec §4.1).
    pub reachable: bool,
}

impl Node {
    pub fn new(id: NodeId, incarnation: u32) -> Self {
        Node {
            id,
            flags: NodeFlags::CLUSTER_MEMBER,
            incarnation,
            reachable: false,
        }
    }

    pub fn is_member(&self) -> bool {
        self.flags.contains(NodeFlags::CLUSTER_MEMBER)
    }
}

/// Diff emitted by the oracle adapter when the observed node set changes
/// (spec §4.1: rejoin-as-new, addition, failure, emitted in that order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A node whose incarnation changed: the old incarnation is treated as
    /// a failure and the new incarnation as an addition.
    RejoinAsNew {
        id: NodeId,
        old_incarnation: u32,
        new_incarnation: u32,
    },
    /// A previously-absent node has appeared and is now reachable.
    Added { id: NodeId, incarnation: u32 },
    /// A previously-present node has disappeared.
    Failed { id: NodeId, incarnation: u32 },
}
