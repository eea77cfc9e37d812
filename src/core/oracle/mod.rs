// src/core/oracle/mod.rs

//! Membership Oracle Adapter (spec §4.1): converts external cluster
//! membership notifications into [`crate::core::node::NodeEvent`]s.

pub mod liveness;
pub mod loopback;
pub mod static_table;

use async_trait::async_trait;

use crate::core::errors::GroupdError;
use crate::core::node::NodeId;

/// Narrow contract the core consumes from the cluster membership oracle
/// (spec §6, "Oracle contract (consumed)").
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    /// Current observed nodes as `(nodeid, incarnation)`.
    async fn current_members(&self) -> Result<Vec<(NodeId, u32)>, GroupdError>;

    /// Whether the cluster currently holds a quorum.
    async fn quorate(&self) -> bool;

    /// This process's own nodeid.
    fn our_nodeid(&self) -> NodeId;
}
