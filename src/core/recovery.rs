// src/core/recovery.rs

//! Recovery Coordinator (spec §4.6): groups node-failures into recovery
//! sets, enforces layered restart ordering, and gates restart on quorum.

use std::collections::{HashMap, HashSet};

use crate::core::event::EventState;
use crate::core::group::GroupId;
use crate::core::node::NodeId;

pub type RecoverySetId = u32;

/// The union of groups that contained a failed nodeid at the moment of
/// failure (spec §3 "Recovery Set").
#[derive(Debug, Clone)]
pub struct RecoverySet {
    pub id: RecoverySetId,
    pub failed_nodeid: NodeId,
    /// Group handles in this set, paired with their level for the
    /// layered-ordering check.
    pub groups: Vec<(GroupId, u8)>,
}

impl RecoverySet {
    pub fn groups_below(&self, level: u8) -> impl Iterator<Item = GroupId> + '_ {
        self.groups.iter().filter(move |(_, l)| *l < level).map(|(g, _)| *g)
    }
}

/// Coordinates all active recovery sets. Owned by the same single-threaded
/// context as the Registry and Event Queues (spec §5: "no locks are
/// required").
#[derive(Default)]
pub struct RecoveryCoordinator {
    sets: HashMap<RecoverySetId, RecoverySet>,
    next_id: RecoverySetId,
}

impl RecoveryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new recovery set for a fresh node-fail notification,
    /// populated with every group handle that contained `failed_nodeid`.
    pub fn start_set(&mut self, failed_nodeid: NodeId, groups: Vec<(GroupId, u8)>) -> RecoverySetId {
        self.next_id += 1;
        let id = self.next_id;
        self.sets.insert(id, RecoverySet { id, failed_nodeid, groups });
        id
    }

    pub fn get(&self, id: RecoverySetId) -> Option<&RecoverySet> {
        self.sets.get(&id)
    }

    pub fn complete_set(&mut self, id: RecoverySetId) {
        self.sets.remove(&id);
    }

    /// Every recovery set that contains `group`.
    pub fn sets_containing(&self, group: GroupId) -> Vec<RecoverySetId> {
        self.sets
            .iter()
            .filter(|(_, set)| set.groups.iter().any(|(g, _)| *g == group))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Layered ordering rule (spec §4.6): `group` at `level` may leave
    /// `FailAllStopped` only once every group at a lower level, in every
    /// recovery set containing `group`, has reached at least
    /// `FailAllStarted`. `states` maps a group handle to its Fail event's
    /// current state, queried by the caller from its live event queues.
    pub fn may_start_restart(
        &self,
        group: GroupId,
        level: u8,
        states: &HashMap<GroupId, EventState>,
    ) -> bool {
        let mut lower_level_groups = HashSet::new();
        for set in self.sets.values() {
            if set.groups.iter().any(|(g, _)| *g == group) {
                lower_level_groups.extend(set.groups_below(level));
            }
        }
        lower_level_groups.into_iter().all(|g| {
            matches!(
                states.get(&g),
                Some(EventState::FailAllStarted) | None
            )
        })
    }

    /// Whether the restart phase may begin at all: the cluster must be
    /// quorate (spec §4.6 "Quorum gating").
    pub fn restart_allowed(&self, quorate: bool) -> bool {
        quorate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_blocked_until_quorum_returns() {
        let coord = RecoveryCoordinator::new();
        assert!(!coord.restart_allowed(false));
        assert!(coord.restart_allowed(true));
    }

    #[test]
    fn lower_level_group_must_finish_before_higher_level_starts() {
        let mut coord = RecoveryCoordinator::new();
        let set_id = coord.start_set(3, vec![(1, 0), (2, 1)]);
        let _ = set_id;

        let mut states = HashMap::new();
        states.insert(1, EventState::FailAllStopped);
        assert!(!coord.may_start_restart(2, 1, &states));

        states.insert(1, EventState::FailAllStarted);
        assert!(coord.may_start_restart(2, 1, &states));
    }

    #[test]
    fn group_with_no_lower_peers_is_unblocked() {
        let mut coord = RecoveryCoordinator::new();
        coord.start_set(3, vec![(1, 0)]);
        let states = HashMap::new();
        assert!(coord.may_start_restart(1, 0, &states));
    }
}
