// src/core/event.rs

//! Event Queue & State Machine (spec §4.4): the per-group FIFO of
//! pending Join/Leave/Fail events and their state transitions.

use std::collections::HashSet;
use std::time::Instant;

use bitflags::bitflags;

use crate::core::group::GroupId;
use crate::core::node::NodeId;

pub type EventId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Join,
    Leave,
    Fail,
}

bitflags! {
    /// Mirrors the original `EFL_*` event flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        const ALLOW_JOIN = 0b0000_0001;
        const ALLOW_JSTOP = 0b0000_0010;
        const ALLOW_LEAVE = 0b0000_0100;
        const ALLOW_LSTOP = 0b0000_1000;
        const ALLOW_STARTDONE = 0b0001_0000;
        const ALLOW_BARRIER = 0b0010_0000;
        const DELAY = 0b0100_0000;
        const CANCEL = 0b1000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    // Join
    JoinBegin,
    JoinAckwait,
    JoinAcked,
    JstopAckwait,
    /// All Jstop acks are in; waiting on our own client's `stop_done`.
    JstopWaitClient,
    JstartSent,
    JstartWaitBarrier,
    JoinDone,
    // Leave
    LeaveBegin,
    LeaveAckwait,
    LstopAckwait,
    /// All Lstop acks are in; waiting on our own client's `stop_done`.
    LstopWaitClient,
    LstartSent,
    LstartWaitremote,
    LeaveDone,
    // Fail
    FailBegin,
    FailStopWait,
    /// `stop` was sent to the local client; waiting on its `stop_done`.
    FailStopWaitClient,
    FailAllStopped,
    FailStartWait,
    /// `start` was sent to the local client; waiting on its `start_done`.
    FailStartWaitClient,
    FailAllStarted,
}

impl EventState {
    /// Whether the state machine has run a client `start` callback for
    /// the current pass (used by the Recovery Coordinator's "had not yet
    /// run start" rule, spec §4.6, and by the stop/start/finish invariant
    /// in spec §8).
    pub fn has_started(&self) -> bool {
        matches!(
            self,
            EventState::JstartSent
                | EventState::JstartWaitBarrier
                | EventState::JoinDone
                | EventState::LstartSent
                | EventState::LstartWaitremote
                | EventState::LeaveDone
                | EventState::FailStartWait
                | EventState::FailStartWaitClient
                | EventState::FailAllStarted
        )
    }

    /// Whether the event is still before its stop phase, i.e. in the
    /// negotiation window where lower-nodeid-wins conflict resolution
    /// applies (spec §4.4 "Conflict resolution during negotiation").
    pub fn is_pre_stop(&self) -> bool {
        matches!(
            self,
            EventState::JoinBegin
                | EventState::JoinAckwait
                | EventState::LeaveBegin
                | EventState::LeaveAckwait
        )
    }

    /// The `*_BEGIN` state an event is requeued at on cancellation
    /// (spec §4.4 "Cancellation").
    pub fn begin_state_for(kind: EventKind) -> EventState {
        match kind {
            EventKind::Join => EventState::JoinBegin,
            EventKind::Leave => EventState::LeaveBegin,
            EventKind::Fail => EventState::FailBegin,
        }
    }
}

/// A pending membership transition bound to a single subject nodeid
/// (spec §3 "Event").
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub group: GroupId,
    pub subject: NodeId,
    pub kind: EventKind,
    pub state: EventState,
    pub member_snapshot: Vec<NodeId>,
    /// Additional failed nodeids a Fail event has absorbed (spec §3).
    pub extension: Vec<NodeId>,
    pub flags: EventFlags,
    pub retry_deadline: Option<Instant>,
    /// Peers that have replied affirmatively to the negotiation request
    /// currently outstanding for this event (spec §4.4 steps 1-3).
    /// Cleared at the start of each negotiation phase (ackwait, then
    /// stopwait), since the same set of peers must re-ack each phase.
    pub acks: HashSet<NodeId>,
    /// Set when any peer has replied negatively to the current
    /// negotiation request; consumed by the driving state to cancel the
    /// event rather than proceed (spec §4.4 "Conflict resolution during
    /// negotiation").
    pub got_nak: bool,
}

impl Event {
    pub fn new(id: EventId, group: GroupId, subject: NodeId, kind: EventKind) -> Self {
        Event {
            id,
            group,
            subject,
            kind,
            state: EventState::begin_state_for(kind),
            member_snapshot: Vec::new(),
            extension: Vec::new(),
            flags: EventFlags::empty(),
            retry_deadline: None,
            acks: HashSet::new(),
            got_nak: false,
        }
    }

    /// Begin a fresh negotiation phase: discard any acks/naks collected
    /// for the phase just finished (spec §4.4: ackwait and stopwait each
    /// re-tally from an empty set).
    pub fn reset_negotiation(&mut self) {
        self.acks.clear();
        self.got_nak = false;
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.contains(EventFlags::CANCEL)
    }

    pub fn mark_cancelled(&mut self) {
        self.flags.insert(EventFlags::CANCEL);
    }

    /// Apply a pending cancellation: requeue at `*_BEGIN` with a back-off
    /// deadline (spec §4.4, §5).
    pub fn apply_cancellation(&mut self, now: Instant, backoff: std::time::Duration) {
        self.flags.remove(EventFlags::CANCEL);
        self.flags.insert(EventFlags::DELAY);
        self.state = EventState::begin_state_for(self.kind);
        self.retry_deadline = Some(now + backoff);
    }

    pub fn retry_is_due(&self, now: Instant) -> bool {
        match self.retry_deadline {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }

    pub fn clear_delay(&mut self) {
        self.flags.remove(EventFlags::DELAY);
        self.retry_deadline = None;
    }

    /// Absorb an additional failed nodeid into an already-queued Fail
    /// event (spec §4.6: "extend an already-queued Fail event").
    pub fn absorb_failure(&mut self, nodeid: NodeId) {
        debug_assert_eq!(self.kind, EventKind::Fail);
        if !self.extension.contains(&nodeid) {
            self.extension.push(nodeid);
        }
    }
}

/// A Group's per-Group FIFO of pending events plus its current event
/// (spec §4.4: "a Group processes at most one Event at any time").
#[derive(Debug, Default)]
pub struct EventQueue {
    pub current: Option<Event>,
    pub pending: std::collections::VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new event, respecting the rule that a queued Fail event
    /// preempts and may replace the current non-Fail event (spec §4.4).
    pub fn enqueue(&mut self, event: Event) {
        if event.kind == EventKind::Fail {
            if let Some(current) = &self.current {
                if current.kind != EventKind::Fail && !current.state.has_started() {
                    // Fail preempts a non-started Join/Leave outright.
                    self.current = Some(event);
                    return;
                }
            }
        }
        self.pending.push_back(event);
    }

    /// Advance to the next queued event once the current one is done or
    /// absent. No-op if an event is already current.
    pub fn advance(&mut self) {
        if self.current.is_none() {
            self.current = self.pending.pop_front();
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_preempts_non_started_current_event() {
        let mut q = EventQueue::new();
        q.current = Some(Event::new(1, 10, 2, EventKind::Join));
        let fail = Event::new(2, 10, 3, EventKind::Fail);
        q.enqueue(fail.clone());
        assert_eq!(q.current.as_ref().unwrap().kind, EventKind::Fail);
        assert!(q.pending.is_empty());
    }

    #[test]
    fn fail_does_not_preempt_started_event() {
        let mut q = EventQueue::new();
        let mut join = Event::new(1, 10, 2, EventKind::Join);
        join.state = EventState::JstartSent;
        q.current = Some(join);
        let fail = Event::new(2, 10, 3, EventKind::Fail);
        q.enqueue(fail);
        assert_eq!(q.current.as_ref().unwrap().kind, EventKind::Join);
        assert_eq!(q.pending.len(), 1);
    }

    #[test]
    fn cancellation_requeues_at_begin_with_deadline() {
        let mut e = Event::new(1, 10, 2, EventKind::Join);
        e.state = EventState::JoinAckwait;
        e.mark_cancelled();
        let now = Instant::now();
        e.apply_cancellation(now, std::time::Duration::from_millis(10));
        assert_eq!(e.state, EventState::JoinBegin);
        assert!(!e.is_cancelled());
        assert!(e.flags.contains(EventFlags::DELAY));
        assert!(!e.retry_is_due(now));
    }

    #[test]
    fn absorb_failure_is_idempotent() {
        let mut e = Event::new(1, 10, 2, EventKind::Fail);
        e.absorb_failure(5);
        e.absorb_failure(5);
        assert_eq!(e.extension, vec![5]);
    }
}
