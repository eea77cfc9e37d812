// src/core/barrier.rs

//! Barrier Service (spec §4.5): named N-way rendezvous used to confirm
//! all peers completed a start or recovery step.

use std::collections::{HashMap, HashSet};

use crate::core::errors::GroupdError;
use crate::core::event::EventId;
use crate::core::group::GlobalId;
use crate::core::node::NodeId;

/// The purpose a barrier was raised for. `Reset` is not in spec.md's
/// §4.5 text but is present in the original (`GD_BARRIER_RESET`,
/// SPEC_FULL §F.2): it resynchronizes a group's barrier table after a
/// cancelled recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPurpose {
    StartdoneNew,
    StartdoneUpdate,
    Recovery,
    Reset,
}

/// Deterministic barrier name derivation (spec §4.4, §6). Every
/// participant must compute the identical ASCII name, ≤ 32 bytes.
pub fn barrier_name(
    purpose: BarrierPurpose,
    global_id: GlobalId,
    initiator: NodeId,
    event_id: EventId,
    member_count: usize,
) -> String {
    let name = match purpose {
        BarrierPurpose::Recovery => format!("sm.{global_id}.{event_id}.RECOV.{member_count}"),
        BarrierPurpose::Reset => format!("sm.{global_id}.{event_id}.RESET.{member_count}"),
        BarrierPurpose::StartdoneNew | BarrierPurpose::StartdoneUpdate => {
            format!("sm.{global_id}.{initiator}.{event_id}.{member_count}")
        }
    };
    debug_assert!(name.len() <= 32, "barrier name exceeds 32 bytes: {name}");
    name
}

struct Wait {
    expected_count: usize,
    acked: HashSet<NodeId>,
    purpose: BarrierPurpose,
}

/// Tracks outstanding barrier waits by name. `expected_count` shrinks
/// when a configuration change removes a peer (spec §4.5: "no time-based
/// expiration").
#[derive(Default)]
pub struct BarrierService {
    waits: HashMap<String, Wait>,
}

impl BarrierService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin waiting on `name`. A member count of one short-circuits the
    /// barrier immediately (spec §4.4).
    pub fn begin(&mut self, name: String, expected_count: usize, purpose: BarrierPurpose) -> bool {
        if expected_count <= 1 {
            return true;
        }
        self.waits.insert(
            name,
            Wait {
                expected_count,
                acked: HashSet::new(),
                purpose,
            },
        );
        false
    }

    /// Record an ack from `sender` for `name`. Returns `true` once the
    /// barrier has reached its expected count.
    pub fn ack(&mut self, name: &str, sender: NodeId) -> Result<bool, GroupdError> {
        let wait = self
            .waits
            .get_mut(name)
            .ok_or_else(|| GroupdError::Internal(format!("ack for unknown barrier {name}")))?;
        wait.acked.insert(sender);
        Ok(wait.acked.len() >= wait.expected_count)
    }

    /// A lost peer shrinks `expected_count`; may itself complete the
    /// barrier.
    pub fn remove_peer(&mut self, name: &str, lost: NodeId) -> Option<bool> {
        let wait = self.waits.get_mut(name)?;
        wait.acked.remove(&lost);
        if wait.expected_count > 1 {
            wait.expected_count -= 1;
        }
        Some(wait.acked.len() >= wait.expected_count)
    }

    pub fn purpose_of(&self, name: &str) -> Option<BarrierPurpose> {
        self.waits.get(name).map(|w| w.purpose)
    }

    /// Cancel a barrier by name, discarding accumulated acks (spec §4.5).
    pub fn cancel(&mut self, name: &str) {
        self.waits.remove(name);
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.waits.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_member_count_short_circuits() {
        let mut svc = BarrierService::new();
        let done = svc.begin("b1".into(), 1, BarrierPurpose::StartdoneNew);
        assert!(done);
        assert!(!svc.is_pending("b1"));
    }

    #[test]
    fn completes_once_expected_acks_arrive() {
        let mut svc = BarrierService::new();
        svc.begin("b1".into(), 2, BarrierPurpose::StartdoneNew);
        assert!(!svc.ack("b1", 1).unwrap());
        assert!(svc.ack("b1", 2).unwrap());
    }

    #[test]
    fn losing_a_peer_shrinks_expected_count() {
        let mut svc = BarrierService::new();
        svc.begin("b1".into(), 3, BarrierPurpose::Recovery);
        svc.ack("b1", 1).unwrap();
        // 3 was never going to ack, and has now failed.
        let completed = svc.remove_peer("b1", 3).unwrap();
        assert!(!completed);
        assert!(svc.ack("b1", 2).unwrap());
    }

    #[test]
    fn cancel_discards_accumulated_acks() {
        let mut svc = BarrierService::new();
        svc.begin("b1".into(), 2, BarrierPurpose::StartdoneNew);
        svc.ack("b1", 1).unwrap();
        svc.cancel("b1");
        assert!(!svc.is_pending("b1"));
    }

    #[test]
    fn name_derivation_is_deterministic_and_bounded() {
        let n1 = barrier_name(BarrierPurpose::StartdoneNew, 0x0001_0007, 7, 42, 3);
        let n2 = barrier_name(BarrierPurpose::StartdoneNew, 0x0001_0007, 7, 42, 3);
        assert_eq!(n1, n2);
        assert!(n1.len() <= 32);
        let recov = barrier_name(BarrierPurpose::Recovery, 0x0001_0007, 7, 42, 3);
        assert!(recov.contains("RECOV"));
    }
}
