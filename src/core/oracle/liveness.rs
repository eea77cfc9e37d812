// src/core/oracle/liveness.rs

//! The adapter logic proper (spec §4.1): diffs successive oracle reads
//! into ordered [`NodeEvent`]s and gates `Added` events behind a
//! reachability probe, mirroring the original's `cman.c: wait_for_groupd`
//! polling idiom and the teacher's gossip ping/pong liveness check
//! (`core/cluster/gossip.rs::send_pings`).

use std::collections::HashMap;

use tracing::debug;

use crate::core::errors::GroupdError;
use crate::core::node::{NodeEvent, NodeId};
use crate::core::oracle::MembershipOracle;

/// Something that can be asked "is the peer daemon at this node reachable
/// on the messaging bus yet?" Implemented by the messaging adapter.
pub trait ReachabilityProbe: Send + Sync {
    fn is_reachable(&self, nodeid: NodeId) -> bool;
}

/// Wraps a [`MembershipOracle`], tracking the previously observed node set
/// so each poll can be turned into the ordered diff spec §4.1 requires.
pub struct OracleAdapter<O: MembershipOracle> {
    oracle: O,
    known: HashMap<NodeId, u32>,
    /// nodes seen as added by the oracle but not yet confirmed reachable;
    /// re-checked on every poll until the probe succeeds.
    pending_reachability: HashMap<NodeId, u32>,
}

impl<O: MembershipOracle> OracleAdapter<O> {
    pub fn new(oracle: O) -> Self {
        OracleAdapter {
            oracle,
            known: HashMap::new(),
            pending_reachability: HashMap::new(),
        }
    }

    pub fn our_nodeid(&self) -> NodeId {
        self.oracle.our_nodeid()
    }

    pub async fn quorate(&self) -> bool {
        self.oracle.quorate().await
    }

    /// Poll the oracle once and return the ordered events implied by the
    /// change from the previously known set: rejoin-as-new, then addition
    /// (subject to reachability), then failure.
    pub async fn poll(&mut self, probe: &dyn ReachabilityProbe) -> Result<Vec<NodeEvent>, GroupdError> {
        let current: HashMap<NodeId, u32> = self.oracle.current_members().await?.into_iter().collect();
        let mut events = Vec::new();

        // (i) rejoin-as-new: nodeid present both before and now, but with a
        // different incarnation.
        for (&id, &new_inc) in &current {
            if let Some(&old_inc) = self.known.get(&id) {
                if old_inc != new_inc {
                    debug!(nodeid = id, old_inc, new_inc, "rejoin as new");
                    events.push(NodeEvent::RejoinAsNew {
                        id,
                        old_incarnation: old_inc,
                        new_incarnation: new_inc,
                    });
                    self.pending_reachability.insert(id, new_inc);
                }
            } else {
                self.pending_reachability.insert(id, new_inc);
            }
        }

        // (ii) addition: newly present nodeids, deferred until reachable.
        let mut became_reachable = Vec::new();
        for (&id, &inc) in &self.pending_reachability {
            if current.contains_key(&id) && probe.is_reachable(id) {
                events.push(NodeEvent::Added { id, incarnation: inc });
                became_reachable.push(id);
            }
        }
        for id in became_reachable {
            self.pending_reachability.remove(&id);
        }

        // (iii) failure: previously known nodeids no longer present.
        for (&id, &inc) in &self.known {
            if !current.contains_key(&id) {
                events.push(NodeEvent::Failed { id, incarnation: inc });
                self.pending_reachability.remove(&id);
            }
        }

        self.known = current;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::oracle::loopback::LoopbackOracle;

    struct AlwaysReachable;
    impl ReachabilityProbe for AlwaysReachable {
        fn is_reachable(&self, _nodeid: NodeId) -> bool {
            true
        }
    }

    struct NeverReachable;
    impl ReachabilityProbe for NeverReachable {
        fn is_reachable(&self, _nodeid: NodeId) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn first_poll_defers_additions_until_reachable() {
        let oracle = LoopbackOracle::new(1);
        oracle.set_members(vec![(1, 1), (2, 1)]);
        let mut adapter = OracleAdapter::new(oracle);

        let events = adapter.poll(&NeverReachable).await.unwrap();
        assert!(events.is_empty(), "additions must wait for reachability");

        let events = adapter.poll(&AlwaysReachable).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, NodeEvent::Added { id: 1, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, NodeEvent::Added { id: 2, .. })));
    }

    #[tokio::test]
    async fn departure_emits_failed() {
        let oracle = LoopbackOracle::new(1);
        oracle.set_members(vec![(1, 1), (2, 1)]);
        let mut adapter = OracleAdapter::new(oracle.clone());
        adapter.poll(&AlwaysReachable).await.unwrap();

        oracle.set_members(vec![(1, 1)]);
        let events = adapter.poll(&AlwaysReachable).await.unwrap();
        assert_eq!(events, vec![NodeEvent::Failed { id: 2, incarnation: 1 }]);
    }

    #[tokio::test]
    async fn incarnation_change_emits_rejoin_as_new() {
        let oracle = LoopbackOracle::new(1);
        oracle.set_members(vec![(1, 1), (2, 1)]);
        let mut adapter = OracleAdapter::new(oracle.clone());
        adapter.poll(&AlwaysReachable).await.unwrap();

        oracle.set_members(vec![(1, 1), (2, 2)]);
        let events = adapter.poll(&AlwaysReachable).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            NodeEvent::RejoinAsNew {
                id: 2,
                old_incarnation: 1,
                new_incarnation: 2
            }
        )));
    }
}
