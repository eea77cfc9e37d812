// src/core/group.rs

//! Group data model (spec §3): a named, leveled process group and its
//! coarse lifecycle state.

use bitflags::bitflags;

use crate::core::errors::GroupdError;
use crate::core::node::NodeId;

pub type GroupId = u32;
pub type GlobalId = u32;

bitflags! {
    /// Mirrors the original `GFL_*` group flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GroupFlags: u8 {
        const JOINING = 0b0000_0001;
        const LEAVING = 0b0000_0010;
        const MEMBER = 0b0000_0100;
        const UPDATE = 0b0000_1000;
        const NEED_RECOVERY = 0b0001_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    None,
    Join,
    Run,
    Recover,
    Update,
}

/// A single named, leveled process group.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub level: u8,
    pub name: String,
    /// Assigned exactly once by the first joiner (spec §4.2); `0` means
    /// not yet elected.
    pub global_id: GlobalId,
    pub flags: GroupFlags,
    pub state: GroupState,
    /// Ordered list of confirmed members.
    pub members: Vec<NodeId>,
    /// Nodes whose Join has been approved but not yet completed.
    pub joining: Vec<NodeId>,
    /// The client-endpoint id of the local owner, if any local client
    /// has `setup` for this (level, name).
    pub local_client: Option<u64>,
}

impl Group {
    pub fn new(id: GroupId, level: u8, name: String) -> Self {
        Group {
            id,
            level,
            name,
            global_id: 0,
            flags: GroupFlags::empty(),
            state: GroupState::None,
            members: Vec::new(),
            joining: Vec::new(),
            local_client: None,
        }
    }

    pub fn key(&self) -> (u8, &str) {
        (self.level, &self.name)
    }

    pub fn has_member(&self, nodeid: NodeId) -> bool {
        self.members.contains(&nodeid)
    }

    /// Elect a global-id per spec §3: `(monotonic_counter << 16) | low16(our_nodeid)`.
    pub fn elect_global_id(monotonic_counter: u32, our_nodeid: NodeId) -> GlobalId {
        (monotonic_counter << 16) | (our_nodeid & 0xFFFF)
    }

    /// Add `nodeid` to the membership list, enforcing the configured
    /// member cap (spec §3 "at most `max_members` members"). Idempotent:
    /// a nodeid already present is not an error.
    pub fn add_member(&mut self, nodeid: NodeId, max_members: usize) -> Result<(), GroupdError> {
        if self.members.contains(&nodeid) {
            return Ok(());
        }
        if self.members.len() >= max_members {
            return Err(GroupdError::GroupFull {
                level: self.level,
                name: self.name.clone(),
                max: max_members,
            });
        }
        self.members.push(nodeid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_id_election_packs_counter_and_low16_nodeid() {
        let id = Group::elect_global_id(1, 7);
        assert_eq!(id, (1 << 16) | 7);
        let id = Group::elect_global_id(1, 0x1_0007);
        assert_eq!(id, (1 << 16) | 0x0007);
    }

    #[test]
    fn new_group_starts_empty_and_unassigned() {
        let g = Group::new(1, 0, "lock1".into());
        assert_eq!(g.global_id, 0);
        assert!(g.members.is_empty());
        assert_eq!(g.state, GroupState::None);
    }

    #[test]
    fn add_member_rejects_past_the_cap() {
        let mut g = Group::new(1, 0, "lock1".into());
        g.add_member(1, 1).unwrap();
        assert!(g.add_member(1, 1).is_ok(), "re-adding an existing member is a no-op");
        assert!(matches!(g.add_member(2, 1), Err(GroupdError::GroupFull { .. })));
        assert_eq!(g.members, vec![1]);
    }
}
