// src/core/oracle/static_table.rs

//! A minimal [`MembershipOracle`] driven by a fixed, configured node
//! list rather than a live cluster membership service. Stands in for
//! the real oracle (cman/corosync in the original) the reference binary
//! does not ship, per SPEC_FULL §G; a production deployment plugs in its
//! own adapter against this trait.

use async_trait::async_trait;

use crate::core::errors::GroupdError;
use crate::core::node::NodeId;

#[derive(Debug, Clone)]
pub struct StaticOracle {
    our_nodeid: NodeId,
    members: Vec<(NodeId, u32)>,
}

impl StaticOracle {
    pub fn new(our_nodeid: NodeId, mut peers: Vec<NodeId>) -> Self {
        if !peers.contains(&our_nodeid) {
            peers.push(our_nodeid);
        }
        let members = peers.into_iter().map(|id| (id, 1)).collect();
        StaticOracle { our_nodeid, members }
    }
}

#[async_trait]
impl super::MembershipOracle for StaticOracle {
    async fn current_members(&self) -> Result<Vec<(NodeId, u32)>, GroupdError> {
        Ok(self.members.clone())
    }

    async fn quorate(&self) -> bool {
        // A single-member or unanimous static table is always considered
        // quorate; real deployments supply a quorum-aware adapter.
        true
    }

    fn our_nodeid(&self) -> NodeId {
        self.our_nodeid
    }
}
