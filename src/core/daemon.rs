// src/core/daemon.rs

//! The event loop proper (spec §5): a single task owns every mutable
//! structure and polls the oracle, the messaging bus, and connected
//! clients, draining as much state-machine progress as possible between
//! external wakeups (`process_apps`), mirroring the teacher's
//! `ServerState`/`connection_loop` split (`core/state/core.rs`,
//! `server/connection_loop.rs`) translated into single-owner form.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::barrier::BarrierService;
use crate::core::endpoint::{ClientCallback, ClientCommand, ClientId, ClientIdentity, ClientTable};
use crate::core::errors::GroupdError;
use crate::core::event::{Event, EventId, EventKind, EventQueue, EventState};
use crate::core::group::{Group, GroupId, GroupState};
use crate::core::introspection::RingBuffer;
use crate::core::messaging::{BusEvent, ConfigChange, MessageBus, Scope};
use crate::core::node::{NodeEvent, NodeId};
use crate::core::oracle::liveness::{OracleAdapter, ReachabilityProbe};
use crate::core::oracle::MembershipOracle;
use crate::core::recovery::RecoveryCoordinator;
use crate::core::registry::Registry;
use crate::core::wire::{Header, MessageType, Status, WireMessage};

/// Messages the endpoint's per-connection tasks forward into the
/// single-owner event loop.
pub enum InboundClientMessage {
    Connected {
        tx: mpsc::UnboundedSender<ClientCallback>,
        assigned_id: tokio::sync::oneshot::Sender<ClientId>,
    },
    Command { client: ClientId, command: ClientCommand },
    Disconnected { client: ClientId },
}

/// A reachability prober that always reports nodes reachable. Suitable
/// when the messaging bus itself provides delivery-order guarantees
/// strong enough that oracle additions need no extra gating (e.g. the
/// in-process loopback bus used by tests).
pub struct AlwaysReachable;
impl ReachabilityProbe for AlwaysReachable {
    fn is_reachable(&self, _nodeid: NodeId) -> bool {
        true
    }
}

/// A peer-initiated Jstop/Lstop request we've told our local client to
/// stop for; once it acks, we owe the requester a reply (spec §4.4,
/// mirroring `update.c`'s `process_join_stop`/`process_join_stopdone`).
struct PeerUpdate {
    scope: Scope,
    to: NodeId,
    reply_type: MessageType,
    event_id: EventId,
    global_id: u32,
}

/// The single top-level context owning every process-local structure
/// (spec §9: "Global mutable state ... is collected into one top-level
/// context owned by the event loop").
pub struct Context<O: MembershipOracle> {
    pub config: Config,
    pub oracle: OracleAdapter<O>,
    pub bus: Arc<dyn MessageBus>,
    pub registry: Registry,
    pub queues: HashMap<GroupId, EventQueue>,
    /// Pending local-stop-then-reply cycles for peer-initiated Jstop/Lstop
    /// requests, keyed by the group they concern. Not an [`EventQueue`]
    /// entry: a peer reacting to another node's event does not own it.
    peer_updates: HashMap<GroupId, PeerUpdate>,
    pub barriers: BarrierService,
    pub recovery: RecoveryCoordinator,
    pub clients: ClientTable,
    pub ring: Arc<Mutex<RingBuffer>>,
    next_event_id: EventId,
    quorate: bool,
}

impl<O: MembershipOracle> Context<O> {
    pub fn new(config: Config, oracle: O, bus: Arc<dyn MessageBus>) -> Self {
        Context {
            config,
            oracle: OracleAdapter::new(oracle),
            bus,
            registry: Registry::new(),
            queues: HashMap::new(),
            peer_updates: HashMap::new(),
            barriers: BarrierService::new(),
            recovery: RecoveryCoordinator::new(),
            clients: ClientTable::new(),
            ring: Arc::new(Mutex::new(RingBuffer::default())),
            next_event_id: 0,
            quorate: true,
        }
    }

    fn alloc_event_id(&mut self) -> EventId {
        self.next_event_id += 1;
        self.next_event_id
    }

    fn log_transition(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("{line}");
        self.ring.lock().push(line);
    }

    /// The main event loop (spec §5): select over the oracle tick, bus
    /// events, and client messages; after each wakeup drain
    /// [`Self::process_apps`] until no group has residual work.
    pub async fn run(
        mut self,
        mut bus_events: mpsc::UnboundedReceiver<BusEvent>,
        mut client_rx: mpsc::UnboundedReceiver<InboundClientMessage>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut oracle_tick = interval(Duration::from_millis(200));
        info!("daemon event loop starting");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("shutdown signal received, flushing ring buffer");
                    let rendered = self.ring.lock().render();
                    if let Err(e) = tokio::fs::write(&self.config.ring_dump_path, rendered).await {
                        warn!(error = %e, "failed to flush ring buffer on shutdown");
                    }
                    break;
                }

                _ = oracle_tick.tick() => {
                    self.quorate = self.oracle.quorate().await;
                    match self.oracle.poll(&AlwaysReachable).await {
                        Ok(events) => {
                            for ev in events {
                                self.handle_node_event(ev);
                            }
                        }
                        Err(e) => warn!(error = %e, "oracle poll failed"),
                    }
                }

                Some(event) = bus_events.recv() => {
                    self.handle_bus_event(event);
                }

                Some(msg) = client_rx.recv() => {
                    self.handle_client_message(msg);
                }
            }

            self.process_apps();
        }
    }

    fn handle_client_message(&mut self, msg: InboundClientMessage) {
        match msg {
            InboundClientMessage::Connected { tx, assigned_id } => {
                let id = self.clients.register(tx);
                debug!(client = id, "client connected");
                let _ = assigned_id.send(id);
            }
            InboundClientMessage::Command { client, command } => {
                if let Err(e) = self.dispatch_client_command(client, command) {
                    warn!(client, error = %e, "client protocol violation");
                }
            }
            InboundClientMessage::Disconnected { client } => {
                self.clients.disconnect(client);
            }
        }
    }

    pub fn dispatch_client_command(&mut self, client: ClientId, command: ClientCommand) -> Result<(), GroupdError> {
        match command {
            ClientCommand::Setup { type_label, level } => {
                if level >= crate::core::MAX_LEVELS {
                    return Err(GroupdError::InvalidLevel(level));
                }
                self.clients.setup(client, ClientIdentity { type_label, level });
                Ok(())
            }
            ClientCommand::Join { name } => self.local_join(client, name),
            ClientCommand::Leave { name } => self.local_leave(client, name),
            ClientCommand::StopDone { name } => self.client_stop_done(client, name),
            ClientCommand::StartDone { name, event_id } => self.client_start_done(client, name, event_id),
            ClientCommand::Send { name, payload } => self.client_send(client, name, payload),
            ClientCommand::GetGroups | ClientCommand::GetGroup { .. } | ClientCommand::Dump => {
                // Introspection-only; handled by the connection task directly
                // against a read-only snapshot (see endpoint handler).
                Ok(())
            }
            ClientCommand::Log { level } => {
                info!(client, level = %level, "runtime log level change requested");
                Ok(())
            }
        }
    }

    fn require_setup(&self, client: ClientId) -> Result<&ClientIdentity, GroupdError> {
        self.clients
            .identity(client)
            .ok_or(GroupdError::ClientNotSetup)
    }

    fn local_join(&mut self, client: ClientId, name: String) -> Result<(), GroupdError> {
        let identity = self.require_setup(client)?.clone();
        if name.len() > crate::core::MAX_NAMELEN {
            return Err(GroupdError::NameTooLong(name));
        }

        let group_id = match self.registry.lookup(identity.level, &name) {
            Some(g) => g.id,
            None => self.registry.create(identity.level, name.clone(), Some(client))?,
        };

        let our_nodeid = self.oracle.our_nodeid();
        let event_id = self.alloc_event_id();
        let event = Event::new(event_id, group_id, our_nodeid, EventKind::Join);
        self.queues.entry(group_id).or_default().enqueue(event);
        self.log_transition(format!("group {name}: local join queued as event {event_id}"));
        Ok(())
    }

    fn local_leave(&mut self, client: ClientId, name: String) -> Result<(), GroupdError> {
        let identity = self.require_setup(client)?.clone();
        let group = self
            .registry
            .lookup(identity.level, &name)
            .ok_or_else(|| GroupdError::NoSuchGroup { level: identity.level, name: name.clone() })?;
        let group_id = group.id;

        let our_nodeid = self.oracle.our_nodeid();
        let event_id = self.alloc_event_id();
        let event = Event::new(event_id, group_id, our_nodeid, EventKind::Leave);
        self.queues.entry(group_id).or_default().enqueue(event);
        self.log_transition(format!("group {name}: local leave queued as event {event_id}"));
        Ok(())
    }

    fn client_stop_done(&mut self, client: ClientId, name: String) -> Result<(), GroupdError> {
        let identity = self.require_setup(client)?.clone();
        let group_id = self
            .registry
            .lookup(identity.level, &name)
            .map(|g| g.id)
            .ok_or_else(|| GroupdError::NoSuchGroup { level: identity.level, name })?;

        // A stop we owe a peer a reply for takes priority over any stop of
        // our own: the two phases never overlap for the same group, but
        // checking here keeps the caller-facing contract uniform.
        if let Some(update) = self.peer_updates.remove(&group_id) {
            self.reply_to(update.scope, update.to, update.reply_type, Status::Pos, update.event_id, update.global_id);
            return Ok(());
        }

        let queue = self.queues.entry(group_id).or_default();
        let Some(event) = queue.current.as_mut() else {
            return Err(GroupdError::ClientProtocolViolation("stop_done with no pending stop".into()));
        };
        event.state = advance_past_stop(event.state);
        Ok(())
    }

    fn client_start_done(&mut self, client: ClientId, name: String, event_id: EventId) -> Result<(), GroupdError> {
        let identity = self.require_setup(client)?.clone();
        let group_id = self
            .registry
            .lookup(identity.level, &name)
            .map(|g| g.id)
            .ok_or_else(|| GroupdError::NoSuchGroup { level: identity.level, name })?;
        let queue = self.queues.entry(group_id).or_default();
        let Some(event) = queue.current.as_mut() else {
            return Err(GroupdError::ClientProtocolViolation("start_done with no pending start".into()));
        };
        if event.id != event_id {
            return Err(GroupdError::ClientProtocolViolation(format!(
                "start_done for wrong event_nr: expected {}, got {event_id}",
                event.id
            )));
        }
        event.state = advance_past_start(event.state);
        Ok(())
    }

    fn client_send(&mut self, client: ClientId, name: String, payload: Vec<u8>) -> Result<(), GroupdError> {
        let identity = self.require_setup(client)?.clone();
        let group = self
            .registry
            .lookup(identity.level, &name)
            .ok_or_else(|| GroupdError::NoSuchGroup { level: identity.level, name })?;
        let scope = Scope::Group(group.global_id);
        let header = Header {
            ms_type: MessageType::AppInternal,
            ms_status: Status::Pos,
            ms_level: identity.level as u16,
            ms_event_id: 0,
            ms_group_id: group.global_id,
            ms_last_id: 0,
            ms_to_nodeid: 0,
        };
        let bus = self.bus.clone();
        let msg = WireMessage::new(header, payload.into());
        tokio::spawn(async move {
            if let Err(e) = bus.multicast(scope, msg).await {
                warn!(error = %e, "application payload send failed");
            }
        });
        Ok(())
    }

    fn handle_node_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Added { id, .. } => {
                self.log_transition(format!("node {id} observed addable"));
            }
            NodeEvent::RejoinAsNew { id, .. } | NodeEvent::Failed { id, .. } => {
                self.trigger_recovery_for(id);
            }
        }
    }

    /// Drives a node-fail notification directly, bypassing the oracle
    /// poll tick. Exposed for tests that script failures precisely rather
    /// than waiting on the polling interval.
    pub fn simulate_node_failure(&mut self, failed_nodeid: NodeId) {
        self.trigger_recovery_for(failed_nodeid);
    }

    /// Dispatches one bus event directly, bypassing the `select!` arm in
    /// [`Self::run`]. Exposed so integration tests can drain a loopback
    /// bus's receiver and feed each node's messages to its peers without
    /// spawning the full event loop.
    pub fn pump_bus_event(&mut self, event: BusEvent) {
        self.handle_bus_event(event);
    }

    /// Node-fail handling (spec §4.6): allocate a recovery set, enqueue or
    /// extend a Fail event on every group containing the failed nodeid.
    fn trigger_recovery_for(&mut self, failed_nodeid: NodeId) {
        let group_ids = self.registry.groups_containing(failed_nodeid);
        if group_ids.is_empty() {
            self.log_transition(format!("fail for {failed_nodeid}: no-op, in no groups"));
            return;
        }

        let groups_with_levels: Vec<(GroupId, u8)> = group_ids
            .iter()
            .filter_map(|&id| self.registry.get(id).map(|g| (id, g.level)))
            .collect();
        self.recovery.start_set(failed_nodeid, groups_with_levels);

        for group_id in group_ids {
            let already_extended = {
                let queue = self.queues.entry(group_id).or_default();
                let extended = queue
                    .pending
                    .iter_mut()
                    .chain(queue.current.iter_mut())
                    .find(|e| e.kind == EventKind::Fail);
                if let Some(existing) = extended {
                    existing.absorb_failure(failed_nodeid);
                    true
                } else {
                    false
                }
            };
            if already_extended {
                continue;
            }

            let event_id = self.alloc_event_id();
            let event = Event::new(event_id, group_id, failed_nodeid, EventKind::Fail);
            let queue = self.queues.entry(group_id).or_default();
            queue.enqueue(event);

            // purge the failing node from the joining list; if it was
            // itself the subject of a queued Join, drop that Join (spec §4.6).
            if let Some(group) = self.registry.get_mut(group_id) {
                group.joining.retain(|&n| n != failed_nodeid);
            }
            let queue = self.queues.get_mut(&group_id).unwrap();
            queue.pending.retain(|e| !(e.kind == EventKind::Join && e.subject == failed_nodeid));
        }
        self.log_transition(format!("recovery set started for failed node {failed_nodeid}"));
    }

    fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Delivered { scope, sender, message } => {
                self.handle_wire_message(scope, sender, message);
            }
            BusEvent::ConfigChanged(change) => self.handle_config_change(change),
        }
    }

    fn handle_wire_message(&mut self, scope: Scope, sender: NodeId, message: WireMessage) {
        match message.header.ms_type {
            MessageType::Barrier => {
                let name = String::from_utf8_lossy(&message.payload).to_string();
                match self.barriers.ack(&name, sender) {
                    Ok(true) => self.complete_barrier(&name),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "ack for unknown barrier, protocol divergence"),
                }
            }
            // A peer is negotiating a Join/Leave on a group we both
            // belong to (spec §4.4 steps 1-3): we object only if we have
            // a conflicting event of our own already past its begin state.
            MessageType::JoinReq | MessageType::LeaveReq => {
                let global_id = message.header.ms_group_id;
                let reply_type = if message.header.ms_type == MessageType::JoinReq {
                    MessageType::JoinRep
                } else {
                    MessageType::LeaveRep
                };
                let status = self.negotiation_status(global_id);
                self.reply_to(scope, sender, reply_type, status, message.header.ms_event_id, global_id);
            }
            // A peer (or our own scope echo) asking existing members to
            // stop their local subsystem before the membership change is
            // applied (spec §4.4; `update.c`'s `process_join_stop`). We
            // reply only once our own client acknowledges the stop.
            MessageType::JstopReq | MessageType::LstopReq => {
                if sender == self.oracle.our_nodeid() {
                    // Our own broadcast echoed back; the owning state
                    // machine drives our local stop directly.
                    return;
                }
                let global_id = message.header.ms_group_id;
                let reply_type = if message.header.ms_type == MessageType::JstopReq {
                    MessageType::JstopRep
                } else {
                    MessageType::LstopRep
                };
                let event_id = message.header.ms_event_id;
                let Some(group) = self.registry.lookup_by_global_id(global_id).cloned() else {
                    self.reply_to(scope, sender, reply_type, Status::Pos, event_id, global_id);
                    return;
                };
                match group.local_client {
                    Some(client_id) => {
                        self.peer_updates.insert(
                            group.id,
                            PeerUpdate { scope, to: sender, reply_type, event_id, global_id },
                        );
                        self.clients.send(client_id, ClientCallback::Stop { name: group.name });
                    }
                    None => self.reply_to(scope, sender, reply_type, Status::Pos, event_id, global_id),
                }
            }
            MessageType::JoinRep | MessageType::JstopRep => {
                self.record_ack(message.header.ms_group_id, message.header.ms_event_id, EventKind::Join, sender, message.header.ms_status);
            }
            MessageType::LeaveRep | MessageType::LstopRep => {
                self.record_ack(message.header.ms_group_id, message.header.ms_event_id, EventKind::Leave, sender, message.header.ms_status);
            }
            // The restarted member list following a completed stop phase
            // (spec §4.4; `update.c`'s `process_join_start`). Join's
            // JstartCmd needs no reply; Leave's does, once-from-any-remaining-
            // member, since the leaver waits for exactly one `LstartDone`.
            MessageType::JstartCmd | MessageType::LstartCmd => {
                if sender == self.oracle.our_nodeid() {
                    return;
                }
                let global_id = message.header.ms_group_id;
                let event_id = message.header.ms_event_id;
                let Some(group) = self.registry.lookup_by_global_id(global_id).cloned() else {
                    return;
                };
                let members = decode_member_list(message.payload.clone());
                let kind = if message.header.ms_type == MessageType::JstartCmd {
                    EventKind::Join
                } else {
                    EventKind::Leave
                };
                if let Some(client_id) = group.local_client {
                    self.clients.send(
                        client_id,
                        ClientCallback::Start { name: group.name, event_id, kind, members },
                    );
                }
                if message.header.ms_type == MessageType::LstartCmd {
                    self.reply_to(scope, sender, MessageType::LstartDone, Status::Pos, event_id, global_id);
                }
            }
            MessageType::LstartDone => {
                self.record_leave_done(message.header.ms_group_id, message.header.ms_event_id);
            }
            other => {
                debug!(?other, group_id = message.header.ms_group_id, "wire message queued for group processing");
            }
        }
    }

    /// Whether we have a conflicting event of our own in flight for the
    /// group identified by `global_id` (spec §4.4 "Conflict resolution
    /// during negotiation"). A conflict exists once our own event has
    /// left its begin state; an event still in begin hasn't committed to
    /// anything yet and yields.
    fn negotiation_status(&self, global_id: u32) -> Status {
        let Some(group) = self.registry.lookup_by_global_id(global_id) else {
            return Status::Pos;
        };
        let conflicting = self
            .queues
            .get(&group.id)
            .and_then(|q| q.current.as_ref())
            .map(|e| !e.state.is_pre_stop())
            .unwrap_or(false);
        if conflicting {
            Status::Neg
        } else {
            Status::Pos
        }
    }

    fn reply_to(&mut self, scope: Scope, to: NodeId, msg_type: MessageType, status: Status, event_id: EventId, global_id: u32) {
        let header = Header {
            ms_type: msg_type,
            ms_status: status,
            ms_level: 0,
            ms_event_id: event_id,
            ms_group_id: global_id,
            ms_last_id: 0,
            ms_to_nodeid: to,
        };
        let bus = self.bus.clone();
        let msg = WireMessage::new(header, Bytes::new());
        tokio::spawn(async move {
            if let Err(e) = bus.send_to(scope, to, msg).await {
                warn!(error = %e, "negotiation reply send failed");
            }
        });
    }

    /// Tally a negotiation reply into the current event of the group
    /// identified by `global_id`, if it's still the event being replied
    /// to (a stale reply for a since-completed event is simply dropped).
    fn record_ack(&mut self, global_id: u32, event_id: EventId, expected_kind: EventKind, sender: NodeId, status: Status) {
        let Some(group_id) = self.registry.lookup_by_global_id(global_id).map(|g| g.id) else {
            return;
        };
        let Some(event) = self.queues.get_mut(&group_id).and_then(|q| q.current.as_mut()) else {
            return;
        };
        if event.kind != expected_kind || event.id != event_id {
            return;
        }
        match status {
            Status::Neg => event.got_nak = true,
            Status::Pos | Status::Wait => {
                event.acks.insert(sender);
            }
        }
    }

    /// The leaver's single-ack contract (spec §4.4): a Leave completes
    /// once any one remaining member acknowledges the restarted member
    /// list, not once every member has (contrast [`Self::record_ack`]'s
    /// all-acks tally used by the negotiation phases).
    fn record_leave_done(&mut self, global_id: u32, event_id: EventId) {
        let Some(group_id) = self.registry.lookup_by_global_id(global_id).map(|g| g.id) else {
            return;
        };
        let Some(event) = self.queues.get_mut(&group_id).and_then(|q| q.current.as_mut()) else {
            return;
        };
        if event.kind != EventKind::Leave || event.id != event_id || event.state != EventState::LstartWaitremote {
            return;
        }
        event.state = EventState::LeaveDone;
    }

    fn complete_barrier(&mut self, name: &str) {
        let Some(purpose) = self.barriers.purpose_of(name) else {
            return;
        };
        self.barriers.cancel(name);
        self.log_transition(format!("barrier {name} complete ({purpose:?})"));
        // Purpose-specific continuation (finish the event, advance
        // recovery) happens in process_apps on the next drain pass, which
        // re-checks every group whose current event is awaiting this barrier.
    }

    fn handle_config_change(&mut self, change: ConfigChange) {
        let Scope::Group(global_id) = change.scope else {
            return;
        };
        let Some(group_id) = self.registry.lookup_by_global_id(global_id).map(|g| g.id) else {
            return;
        };

        // A peer joining the scope is a member we learn about passively,
        // the same way our own join is observed by everyone already there.
        let max_members = self.config.max_members;
        if let Some(group) = self.registry.get_mut(group_id) {
            for &joined in &change.joined {
                if let Err(e) = group.add_member(joined, max_members) {
                    warn!(error = %e, "peer join observed but member cap reached");
                }
            }
        }

        for &lost in &change.left {
            if let Some(group) = self.registry.get_mut(group_id) {
                group.members.retain(|&n| n != lost);
            }
            debug!(node = lost, group = group_id, "peer lost in group scope");
        }
    }

    /// Drains as much local state-machine progress as possible (spec §5:
    /// "repeatedly calls process_apps until no Group reports residual
    /// work"). Advances queues, applies due retries, and checks recovery
    /// layering.
    pub fn process_apps(&mut self) {
        loop {
            let mut progressed = false;
            let now = Instant::now();
            let group_ids: Vec<GroupId> = self.queues.keys().copied().collect();

            for group_id in group_ids {
                if self.advance_group(group_id, now) {
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }
    }

    /// Advance one group's queue as far as it can go without external
    /// input. Returns whether any progress was made.
    fn advance_group(&mut self, group_id: GroupId, now: Instant) -> bool {
        let queue = self.queues.get_mut(&group_id).unwrap();
        queue.advance();

        let Some(event) = &mut queue.current else {
            return false;
        };

        if event.is_cancelled() {
            event.apply_cancellation(now, crate::core::RETRY_DELAY);
            return true;
        }

        if event.flags.contains(crate::core::event::EventFlags::DELAY) {
            if !event.retry_is_due(now) {
                return false;
            }
            event.clear_delay();
        }

        let quorate = self.quorate;
        let our_nodeid = self.oracle.our_nodeid();
        let progressed = self.drive_local_join_steps(group_id, quorate, our_nodeid);
        progressed
    }

    /// Runs the purely-local steps of the protocol that require no
    /// further external input this tick (spec §4.4): electing a
    /// single-member group's global-id and short-circuiting its barrier,
    /// and marking terminal events complete so the queue advances.
    fn drive_local_join_steps(&mut self, group_id: GroupId, quorate: bool, our_nodeid: NodeId) -> bool {
        let queue = self.queues.get_mut(&group_id).unwrap();
        let Some(event) = &mut queue.current else {
            return false;
        };

        match (event.kind, event.state) {
            (EventKind::Join, EventState::JoinBegin) => {
                let existing = self.registry.get(group_id).map(|g| g.members.clone()).unwrap_or_default();
                let global_id = self.registry.get(group_id).map(|g| g.global_id).unwrap_or(0);
                let mut snapshot = existing;
                if !snapshot.contains(&our_nodeid) {
                    snapshot.push(our_nodeid);
                }
                event.member_snapshot = snapshot.clone();
                event.reset_negotiation();
                event.state = EventState::JoinAckwait;
                if snapshot.len() > 1 {
                    // We must be listening on the group's bus scope before
                    // our request goes out, or the replies it provokes have
                    // nowhere to land.
                    join_group_scope(self.bus.clone(), global_id);
                    send_group_request(self.bus.clone(), MessageType::JoinReq, global_id, event.id, event.subject);
                }
                true
            }
            (EventKind::Join, EventState::JoinAckwait) => {
                // Solo-join short circuit: no peers to ack, so there is
                // nobody who could object; elect the global-id immediately.
                if event.member_snapshot.len() == 1 {
                    let counter = self.registry.next_monotonic_counter();
                    let global_id = Group::elect_global_id(counter, our_nodeid);
                    let _ = self.registry.assign_global_id(group_id, global_id);
                    // Register presence on the now-real scope so a future
                    // joiner's negotiation request can reach us.
                    join_group_scope(self.bus.clone(), global_id);
                    let name = self.registry.get(group_id).map(|g| g.name.clone());
                    if let (Some(name), Some(group)) = (name, self.registry.get(group_id)) {
                        if let Some(client) = group.local_client {
                            self.clients.send(client, ClientCallback::SetId { name, global_id });
                        }
                    }
                    let queue = self.queues.get_mut(&group_id).unwrap();
                    let event = queue.current.as_mut().unwrap();
                    event.state = EventState::JoinAcked;
                    true
                } else if event.got_nak {
                    // A current member objects (it has a conflicting event
                    // of its own in flight); back off and retry (spec §4.4
                    // "Conflict resolution during negotiation").
                    event.mark_cancelled();
                    true
                } else {
                    let required: Vec<NodeId> =
                        event.member_snapshot.iter().copied().filter(|&n| n != our_nodeid).collect();
                    if required.iter().all(|n| event.acks.contains(n)) {
                        event.state = EventState::JoinAcked;
                        true
                    } else {
                        false
                    }
                }
            }
            (EventKind::Join, EventState::JoinAcked) => {
                let global_id = self.registry.get(group_id).map(|g| g.global_id).unwrap_or(0);
                let members = event.member_snapshot.clone();
                event.reset_negotiation();
                event.state = EventState::JstopAckwait;
                if members.len() > 1 {
                    send_group_request(self.bus.clone(), MessageType::JstopReq, global_id, event.id, event.subject);
                }
                true
            }
            (EventKind::Join, EventState::JstopAckwait) => {
                // A solo join has nobody to stop but our own subsystem.
                let ready = if event.member_snapshot.len() == 1 {
                    true
                } else {
                    let required: Vec<NodeId> =
                        event.member_snapshot.iter().copied().filter(|&n| n != our_nodeid).collect();
                    required.iter().all(|n| event.acks.contains(n))
                };
                if !ready {
                    false
                } else {
                    let name = self.registry.get(group_id).map(|g| g.name.clone());
                    if let (Some(name), Some(group)) = (name, self.registry.get(group_id)) {
                        if let Some(client) = group.local_client {
                            self.clients.send(client, ClientCallback::Stop { name });
                        }
                    }
                    let queue = self.queues.get_mut(&group_id).unwrap();
                    queue.current.as_mut().unwrap().state = EventState::JstopWaitClient;
                    true
                }
            }
            (EventKind::Join, EventState::JstopWaitClient) => false,
            (EventKind::Join, EventState::JstartSent) => {
                let name = self.registry.get(group_id).map(|g| g.name.clone());
                let global_id = self.registry.get(group_id).map(|g| g.global_id).unwrap_or(0);
                if let Some(name) = name {
                    let event_id = event.id;
                    let kind = event.kind;
                    let members = event.member_snapshot.clone();
                    if let Some(group) = self.registry.get(group_id) {
                        if let Some(client) = group.local_client {
                            self.clients.send(
                                client,
                                ClientCallback::Start { name, event_id, kind, members: members.clone() },
                            );
                        }
                    }
                    if members.len() > 1 {
                        broadcast_member_list(self.bus.clone(), MessageType::JstartCmd, global_id, event_id, members);
                    }
                }
                let queue = self.queues.get_mut(&group_id).unwrap();
                let event = queue.current.as_mut().unwrap();
                event.state = EventState::JstartWaitBarrier;
                true
            }
            (EventKind::Join, EventState::JstartWaitBarrier) => false,
            (EventKind::Join, EventState::JoinDone) => {
                let max_members = self.config.max_members;
                if let Some(group) = self.registry.get_mut(group_id) {
                    group.state = GroupState::Run;
                    if let Err(e) = group.add_member(event.subject, max_members) {
                        warn!(error = %e, "join completed but member cap prevented adding subject");
                    }
                }
                let name = self.registry.get(group_id).map(|g| g.name.clone());
                if let (Some(name), Some(group)) = (name, self.registry.get(group_id)) {
                    if let Some(client) = group.local_client {
                        self.clients.send(client, ClientCallback::Finish { name, event_id: event.id });
                    }
                }
                let queue = self.queues.get_mut(&group_id).unwrap();
                queue.current = None;
                queue.advance();
                true
            }
            (EventKind::Leave, EventState::LeaveBegin) => {
                let members = self.registry.get(group_id).map(|g| g.members.clone()).unwrap_or_default();
                let global_id = self.registry.get(group_id).map(|g| g.global_id).unwrap_or(0);
                event.member_snapshot = members.clone();
                event.reset_negotiation();
                event.state = EventState::LeaveAckwait;
                if members.len() > 1 {
                    send_group_request(self.bus.clone(), MessageType::LeaveReq, global_id, event.id, event.subject);
                }
                true
            }
            (EventKind::Leave, EventState::LeaveAckwait) => {
                let required: Vec<NodeId> =
                    event.member_snapshot.iter().copied().filter(|&n| n != our_nodeid).collect();
                // A Leave cannot be refused outright by a peer once past
                // its begin state (spec §4.4 asymmetry: a Leave only ever
                // yields to a Fail, which preempts it at the queue level
                // rather than through a negotiated nak), so a stray nak
                // here (e.g. a peer mid-recovery) only delays, never cancels.
                if required.is_empty() || required.iter().all(|n| event.acks.contains(n)) {
                    let global_id = self.registry.get(group_id).map(|g| g.global_id).unwrap_or(0);
                    let members = event.member_snapshot.clone();
                    event.reset_negotiation();
                    event.state = EventState::LstopAckwait;
                    if members.len() > 1 {
                        send_group_request(self.bus.clone(), MessageType::LstopReq, global_id, event.id, event.subject);
                    }
                    true
                } else {
                    false
                }
            }
            (EventKind::Leave, EventState::LstopAckwait) => {
                let required: Vec<NodeId> =
                    event.member_snapshot.iter().copied().filter(|&n| n != our_nodeid).collect();
                if !(required.is_empty() || required.iter().all(|n| event.acks.contains(n))) {
                    false
                } else {
                    let name = self.registry.get(group_id).map(|g| g.name.clone());
                    if let (Some(name), Some(group)) = (name, self.registry.get(group_id)) {
                        if let Some(client) = group.local_client {
                            self.clients.send(client, ClientCallback::Stop { name });
                        }
                    }
                    let queue = self.queues.get_mut(&group_id).unwrap();
                    queue.current.as_mut().unwrap().state = EventState::LstopWaitClient;
                    true
                }
            }
            (EventKind::Leave, EventState::LstopWaitClient) => false,
            (EventKind::Leave, EventState::LstartSent) => {
                let name = self.registry.get(group_id).map(|g| g.name.clone());
                if let (Some(name), Some(group)) = (name, self.registry.get(group_id)) {
                    if let Some(client) = group.local_client {
                        self.clients.send(client, ClientCallback::Terminate { name });
                    }
                }
                let global_id = self.registry.get(group_id).map(|g| g.global_id).unwrap_or(0);
                let remaining: Vec<NodeId> =
                    event.member_snapshot.iter().copied().filter(|&n| n != event.subject).collect();
                if remaining.is_empty() {
                    event.state = EventState::LeaveDone;
                } else {
                    broadcast_member_list(self.bus.clone(), MessageType::LstartCmd, global_id, event.id, remaining);
                    event.state = EventState::LstartWaitremote;
                }
                true
            }
            (EventKind::Leave, EventState::LstartWaitremote) => false,
            (EventKind::Leave, EventState::LeaveDone) => {
                let global_id = self.registry.get(group_id).map(|g| g.global_id).unwrap_or(0);
                if global_id != 0 {
                    leave_group_scope(self.bus.clone(), global_id);
                }
                let _ = self.registry.destroy(group_id);
                self.queues.remove(&group_id);
                true
            }
            (EventKind::Fail, state) => self.drive_fail_step(group_id, state, quorate),
            _ => false,
        }
    }

    fn drive_fail_step(&mut self, group_id: GroupId, state: EventState, quorate: bool) -> bool {
        match state {
            EventState::FailBegin => {
                let queue = self.queues.get_mut(&group_id).unwrap();
                queue.current.as_mut().unwrap().state = EventState::FailStopWait;
                true
            }
            EventState::FailStopWait => {
                let name = self.registry.get(group_id).map(|g| g.name.clone());
                if let (Some(name), Some(group)) = (name, self.registry.get(group_id)) {
                    if let Some(client) = group.local_client {
                        self.clients.send(client, ClientCallback::Stop { name });
                    }
                }
                let queue = self.queues.get_mut(&group_id).unwrap();
                queue.current.as_mut().unwrap().state = EventState::FailStopWaitClient;
                true
            }
            EventState::FailStopWaitClient => false,
            EventState::FailAllStopped => {
                let level = self.registry.get(group_id).map(|g| g.level).unwrap_or(0);
                let states: HashMap<GroupId, EventState> = self
                    .queues
                    .iter()
                    .filter_map(|(id, q)| q.current.as_ref().map(|e| (*id, e.state)))
                    .collect();
                if quorate && self.recovery.may_start_restart(group_id, level, &states) {
                    let queue = self.queues.get_mut(&group_id).unwrap();
                    queue.current.as_mut().unwrap().state = EventState::FailStartWait;
                    true
                } else {
                    false
                }
            }
            EventState::FailStartWait => {
                let name = self.registry.get(group_id).map(|g| g.name.clone());
                let members = self.registry.get(group_id).map(|g| g.members.clone()).unwrap_or_default();
                if let (Some(name), Some(group)) = (name, self.registry.get(group_id)) {
                    if let Some(client) = group.local_client {
                        let event_id = self.queues.get(&group_id).unwrap().current.as_ref().unwrap().id;
                        self.clients.send(
                            client,
                            ClientCallback::Start { name, event_id, kind: EventKind::Fail, members },
                        );
                    }
                }
                let queue = self.queues.get_mut(&group_id).unwrap();
                queue.current.as_mut().unwrap().state = EventState::FailStartWaitClient;
                true
            }
            EventState::FailStartWaitClient => false,
            EventState::FailAllStarted => {
                let failed = self.queues.get(&group_id).unwrap().current.as_ref().unwrap().subject;
                if let Some(group) = self.registry.get_mut(group_id) {
                    group.members.retain(|&n| n != failed);
                }
                for set_id in self.recovery.sets_containing(group_id) {
                    self.recovery.complete_set(set_id);
                }
                let queue = self.queues.get_mut(&group_id).unwrap();
                queue.current = None;
                queue.advance();
                true
            }
            _ => false,
        }
    }

}

/// Fire-and-forget a negotiation request to every current member of a
/// group scope (spec §4.4 steps 1-3). Spawned rather than awaited so the
/// single-owner loop never blocks on bus I/O; the reply, once it
/// arrives, comes back through the bus-events channel like any other
/// wire message.
fn send_group_request(bus: Arc<dyn MessageBus>, msg_type: MessageType, global_id: u32, event_id: EventId, subject: NodeId) {
    let header = Header {
        ms_type: msg_type,
        ms_status: Status::Pos,
        ms_level: 0,
        ms_event_id: event_id,
        ms_group_id: global_id,
        ms_last_id: 0,
        ms_to_nodeid: 0,
    };
    let payload = Bytes::copy_from_slice(&subject.to_be_bytes());
    let scope = Scope::Group(global_id);
    let msg = WireMessage::new(header, payload);
    tokio::spawn(async move {
        if let Err(e) = bus.multicast(scope, msg).await {
            warn!(error = %e, "group negotiation request send failed");
        }
    });
}

/// Register presence on a group's bus scope so negotiation traffic for
/// that scope reaches us. Spawned like [`send_group_request`]; the bus's
/// own `ConfigChanged` notification is how other members learn we joined.
fn join_group_scope(bus: Arc<dyn MessageBus>, global_id: u32) {
    let scope = Scope::Group(global_id);
    tokio::spawn(async move {
        if let Err(e) = bus.join(scope).await {
            warn!(error = %e, "group scope join failed");
        }
    });
}

fn leave_group_scope(bus: Arc<dyn MessageBus>, global_id: u32) {
    let scope = Scope::Group(global_id);
    tokio::spawn(async move {
        if let Err(e) = bus.leave(scope).await {
            warn!(error = %e, "group scope leave failed");
        }
    });
}

/// Encodes a restarted member list as a `u32` count followed by that many
/// big-endian `u32` nodeids. Only the 22-byte header is bit-exact (spec
/// §6); `JstartCmd`/`LstartCmd` payloads are an internal format of our own.
fn encode_member_list(members: &[NodeId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + members.len() * 4);
    buf.put_u32(members.len() as u32);
    for &m in members {
        buf.put_u32(m);
    }
    buf.freeze()
}

fn decode_member_list(mut payload: Bytes) -> Vec<NodeId> {
    if payload.len() < 4 {
        return Vec::new();
    }
    let count = payload.get_u32() as usize;
    let mut members = Vec::with_capacity(count.min(crate::core::MAX_MEMBERS));
    for _ in 0..count {
        if payload.len() < 4 {
            break;
        }
        members.push(payload.get_u32());
    }
    members
}

/// Broadcasts a restarted member list to a group's scope (spec §4.4's
/// `JSTART_CMD`/`LSTART_CMD` step), mirroring [`send_group_request`].
fn broadcast_member_list(bus: Arc<dyn MessageBus>, msg_type: MessageType, global_id: u32, event_id: EventId, members: Vec<NodeId>) {
    let header = Header {
        ms_type: msg_type,
        ms_status: Status::Pos,
        ms_level: 0,
        ms_event_id: event_id,
        ms_group_id: global_id,
        ms_last_id: 0,
        ms_to_nodeid: 0,
    };
    let payload = encode_member_list(&members);
    let scope = Scope::Group(global_id);
    let msg = WireMessage::new(header, payload);
    tokio::spawn(async move {
        if let Err(e) = bus.multicast(scope, msg).await {
            warn!(error = %e, "member list broadcast send failed");
        }
    });
}

fn advance_past_stop(state: EventState) -> EventState {
    match state {
        EventState::JstopWaitClient => EventState::JstartSent,
        EventState::LstopWaitClient => EventState::LstartSent,
        EventState::FailStopWaitClient => EventState::FailAllStopped,
        other => other,
    }
}

fn advance_past_start(state: EventState) -> EventState {
    match state {
        EventState::JstartWaitBarrier => EventState::JoinDone,
        EventState::LstartWaitremote => EventState::LeaveDone,
        EventState::FailStartWaitClient => EventState::FailAllStarted,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::messaging::loopback::{LoopbackBus, LoopbackHub};
    use crate::core::oracle::loopback::LoopbackOracle;

    fn context_for(nodeid: NodeId) -> (Context<LoopbackOracle>, mpsc::UnboundedReceiver<BusEvent>) {
        let hub = LoopbackHub::new();
        let (bus, rx) = LoopbackBus::new(nodeid, hub);
        let oracle = LoopbackOracle::new(nodeid);
        (Context::new(Config::default(), oracle, Arc::new(bus)), rx)
    }

    /// Drives a solo join (or leave) past its local stop/start waits by
    /// acking whatever the client callback channel asks for, the way a
    /// real client's `stop_done`/`start_done` would.
    fn drain_and_ack(ctx: &mut Context<LoopbackOracle>, client: ClientId, name: &str, callbacks: &mut mpsc::UnboundedReceiver<ClientCallback>) -> Vec<ClientCallback> {
        let mut seen = Vec::new();
        loop {
            let mut acked = false;
            while let Ok(cb) = callbacks.try_recv() {
                match &cb {
                    ClientCallback::Stop { .. } => {
                        ctx.dispatch_client_command(client, ClientCommand::StopDone { name: name.into() }).unwrap();
                        acked = true;
                    }
                    ClientCallback::Start { event_id, .. } => {
                        ctx.dispatch_client_command(client, ClientCommand::StartDone { name: name.into(), event_id: *event_id }).unwrap();
                        acked = true;
                    }
                    _ => {}
                }
                seen.push(cb);
            }
            if !acked {
                break;
            }
            ctx.process_apps();
        }
        seen
    }

    #[tokio::test]
    async fn solo_join_reaches_run_and_populates_member_list() {
        let (mut ctx, _rx) = context_for(1);
        let (tx, mut callbacks) = mpsc::unbounded_channel();
        let client = ctx.clients.register(tx);
        ctx.clients.setup(client, ClientIdentity { type_label: "locking".into(), level: 0 });

        ctx.local_join(client, "lock1".into()).unwrap();
        ctx.process_apps();
        let cbs = drain_and_ack(&mut ctx, client, "lock1", &mut callbacks);

        let group = ctx.registry.lookup(0, "lock1").expect("group exists");
        assert_eq!(group.members, vec![1]);
        assert_ne!(group.global_id, 0);

        let saw_stop = cbs.iter().any(|cb| matches!(cb, ClientCallback::Stop { .. }));
        let saw_start = cbs.iter().any(|cb| matches!(cb, ClientCallback::Start { .. }));
        let saw_finish = cbs.iter().any(|cb| matches!(cb, ClientCallback::Finish { .. }));
        assert!(saw_stop && saw_start && saw_finish, "a join runs stop before start before finish");
    }

    #[tokio::test]
    async fn leave_of_last_member_destroys_group_and_terminates() {
        let (mut ctx, _rx) = context_for(1);
        let (tx, mut callbacks) = mpsc::unbounded_channel();
        let client = ctx.clients.register(tx);
        ctx.clients.setup(client, ClientIdentity { type_label: "locking".into(), level: 0 });

        ctx.local_join(client, "x".into()).unwrap();
        ctx.process_apps();
        drain_and_ack(&mut ctx, client, "x", &mut callbacks);

        ctx.local_leave(client, "x".into()).unwrap();
        ctx.process_apps();
        let cbs = drain_and_ack(&mut ctx, client, "x", &mut callbacks);

        assert!(ctx.registry.lookup(0, "x").is_none());
        assert!(cbs.iter().any(|cb| matches!(cb, ClientCallback::Stop { .. })), "leave stops before terminating");
        assert!(cbs.iter().any(|cb| matches!(cb, ClientCallback::Terminate { .. })));
    }

    #[tokio::test]
    async fn fail_for_node_in_no_group_is_a_noop() {
        let (mut ctx, _rx) = context_for(1);
        ctx.trigger_recovery_for(99);
        assert!(ctx.queues.is_empty());
    }
}
