// src/core/oracle/loopback.rs

//! In-memory test double for [`super::MembershipOracle`], used by
//! integration tests to drive multi-node scenarios without real sockets
//! (SPEC_FULL §E).

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::errors::GroupdError;
use crate::core::node::NodeId;

#[derive(Debug, Default)]
struct Inner {
    members: Vec<(NodeId, u32)>,
    quorate: bool,
}

/// A hand-driven oracle: tests call [`LoopbackOracle::set_members`] and
/// [`LoopbackOracle::set_quorate`] to script membership changes.
#[derive(Debug, Clone)]
pub struct LoopbackOracle {
    our_nodeid: NodeId,
    inner: Arc<Mutex<Inner>>,
}

impl LoopbackOracle {
    pub fn new(our_nodeid: NodeId) -> Self {
        LoopbackOracle {
            our_nodeid,
            inner: Arc::new(Mutex::new(Inner {
                members: vec![(our_nodeid, 1)],
                quorate: true,
            })),
        }
    }

    pub fn set_members(&self, members: Vec<(NodeId, u32)>) {
        self.inner.lock().members = members;
    }

    pub fn set_quorate(&self, quorate: bool) {
        self.inner.lock().quorate = quorate;
    }
}

#[async_trait]
impl super::MembershipOracle for LoopbackOracle {
    async fn current_members(&self) -> Result<Vec<(NodeId, u32)>, GroupdError> {
        Ok(self.inner.lock().members.clone())
    }

    async fn quorate(&self) -> bool {
        self.inner.lock().quorate
    }

    fn our_nodeid(&self) -> NodeId {
        self.our_nodeid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::oracle::MembershipOracle;

    #[tokio::test]
    async fn reflects_scripted_membership() {
        let oracle = LoopbackOracle::new(1);
        oracle.set_members(vec![(1, 1), (2, 1)]);
        assert_eq!(oracle.current_members().await.unwrap(), vec![(1, 1), (2, 1)]);
        assert!(oracle.quorate().await);
        oracle.set_quorate(false);
        assert!(!oracle.quorate().await);
    }
}
