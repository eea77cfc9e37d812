// src/core/endpoint/protocol.rs

//! Line-oriented client command/callback grammar (spec §4.7) and its
//! codec, in the teacher's manual `Decoder`/`Encoder` style
//! (`core/protocol/resp_frame.rs`) rather than a derive-based format,
//! since the grammar is a fixed set of whitespace-separated tokens.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::errors::GroupdError;
use crate::core::event::{EventId, EventKind};
use crate::core::group::GlobalId;
use crate::core::node::NodeId;

/// A request line sent by a client (spec §4.7 table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Setup { type_label: String, level: u8 },
    Join { name: String },
    Leave { name: String },
    StopDone { name: String },
    StartDone { name: String, event_id: EventId },
    Send { name: String, payload: Vec<u8> },
    GetGroups,
    GetGroup { name: String },
    Dump,
    Log { level: String },
}

/// A callback line sent by the daemon to a client (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCallback {
    Stop { name: String },
    Start {
        name: String,
        event_id: EventId,
        kind: EventKind,
        members: Vec<NodeId>,
    },
    Finish { name: String, event_id: EventId },
    SetId { name: String, global_id: GlobalId },
    Terminate { name: String },
    Deliver { name: String, from_nodeid: NodeId, payload: Vec<u8> },
}

fn kind_str(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Join => "Join",
        EventKind::Leave => "Leave",
        EventKind::Fail => "Fail",
    }
}

fn parse_kind(s: &str) -> Result<EventKind, GroupdError> {
    match s {
        "Join" => Ok(EventKind::Join),
        "Leave" => Ok(EventKind::Leave),
        "Fail" => Ok(EventKind::Fail),
        other => Err(GroupdError::MalformedCommand(format!("unknown kind {other}"))),
    }
}

impl ClientCallback {
    pub fn render(&self) -> String {
        match self {
            ClientCallback::Stop { name } => format!("stop {name}"),
            ClientCallback::Start { name, event_id, kind, members } => {
                let members_str = members.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(" ");
                format!(
                    "start {name} {event_id} {} {} {members_str}",
                    kind_str(*kind),
                    members.len()
                )
            }
            ClientCallback::Finish { name, event_id } => format!("finish {name} {event_id}"),
            ClientCallback::SetId { name, global_id } => format!("setid {name} {global_id}"),
            ClientCallback::Terminate { name } => format!("terminate {name}"),
            ClientCallback::Deliver { name, from_nodeid, payload } => {
                format!("deliver {name} {from_nodeid} {}\0{}", payload.len(), String::from_utf8_lossy(payload))
            }
        }
    }
}

fn parse_command(line: &str) -> Result<ClientCommand, GroupdError> {
    let mut parts = line.splitn(2, ' ');
    let verb = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match verb {
        "setup" => {
            let mut it = rest.split_whitespace();
            let type_label = it
                .next()
                .ok_or_else(|| GroupdError::MalformedCommand("setup requires <type>".into()))?
                .to_string();
            let level: u8 = it
                .next()
                .ok_or_else(|| GroupdError::MalformedCommand("setup requires <level>".into()))?
                .parse()
                .map_err(|_| GroupdError::MalformedCommand("setup level not a number".into()))?;
            Ok(ClientCommand::Setup { type_label, level })
        }
        "join" => Ok(ClientCommand::Join { name: rest.to_string() }),
        "leave" => Ok(ClientCommand::Leave { name: rest.to_string() }),
        "stop_done" => Ok(ClientCommand::StopDone { name: rest.to_string() }),
        "start_done" => {
            let mut it = rest.split_whitespace();
            let name = it
                .next()
                .ok_or_else(|| GroupdError::MalformedCommand("start_done requires <name>".into()))?
                .to_string();
            let event_id: EventId = it
                .next()
                .ok_or_else(|| GroupdError::MalformedCommand("start_done requires <event_nr>".into()))?
                .parse()
                .map_err(|_| GroupdError::MalformedCommand("start_done event_nr not a number".into()))?;
            Ok(ClientCommand::StartDone { name, event_id })
        }
        "send" => {
            let mut it = rest.splitn(3, ' ');
            let name = it
                .next()
                .ok_or_else(|| GroupdError::MalformedCommand("send requires <name>".into()))?
                .to_string();
            let len: usize = it
                .next()
                .ok_or_else(|| GroupdError::MalformedCommand("send requires <len>".into()))?
                .parse()
                .map_err(|_| GroupdError::MalformedCommand("send len not a number".into()))?;
            let body = it.next().unwrap_or("");
            if body.len() != len {
                return Err(GroupdError::MalformedCommand("send payload length mismatch".into()));
            }
            Ok(ClientCommand::Send { name, payload: body.as_bytes().to_vec() })
        }
        "get_groups" => Ok(ClientCommand::GetGroups),
        "get_group" => Ok(ClientCommand::GetGroup { name: rest.to_string() }),
        "dump" => Ok(ClientCommand::Dump),
        "log" => Ok(ClientCommand::Log { level: rest.to_string() }),
        other => Err(GroupdError::MalformedCommand(format!("unknown command '{other}'"))),
    }
}

/// Decodes newline-delimited [`ClientCommand`]s and encodes
/// [`ClientCallback`]s, both directions sharing one connection.
#[derive(Debug, Default)]
pub struct ClientCodec;

impl Decoder for ClientCodec {
    type Item = ClientCommand;
    type Error = GroupdError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(newline_pos) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(newline_pos);
        src.advance(1); // consume the '\n'
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return self.decode(src);
        }
        parse_command(line).map(Some)
    }
}

impl Encoder<ClientCallback> for ClientCodec {
    type Error = GroupdError;

    fn encode(&mut self, item: ClientCallback, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.render().as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(input: &str) -> ClientCommand {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(input.as_bytes());
        codec.decode(&mut buf).unwrap().expect("one command")
    }

    #[test]
    fn parses_setup() {
        assert_eq!(
            decode_one("setup locking 0\n"),
            ClientCommand::Setup { type_label: "locking".into(), level: 0 }
        );
    }

    #[test]
    fn parses_join_and_leave() {
        assert_eq!(decode_one("join lock1\n"), ClientCommand::Join { name: "lock1".into() });
        assert_eq!(decode_one("leave lock1\n"), ClientCommand::Leave { name: "lock1".into() });
    }

    #[test]
    fn parses_start_done_with_event_id() {
        assert_eq!(
            decode_one("start_done lock1 42\n"),
            ClientCommand::StartDone { name: "lock1".into(), event_id: 42 }
        );
    }

    #[test]
    fn rejects_malformed_send_length() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from("send lock1 10 short\n".as_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn renders_start_callback_with_member_list() {
        let cb = ClientCallback::Start {
            name: "lock1".into(),
            event_id: 7,
            kind: EventKind::Join,
            members: vec![1, 2],
        };
        assert_eq!(cb.render(), "start lock1 7 Join 2 1 2");
    }

    #[test]
    fn encode_then_decode_round_trips_a_command_line() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"join lock1\n");
        let cmd = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(cmd, ClientCommand::Join { name: "lock1".into() });
    }

    #[test]
    fn kind_str_and_parse_kind_round_trip() {
        for kind in [EventKind::Join, EventKind::Leave, EventKind::Fail] {
            assert_eq!(parse_kind(kind_str(kind)).unwrap(), kind);
        }
    }
}
