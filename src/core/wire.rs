// src/core/wire.rs

//! Bit-exact wire format for the daemon-to-daemon messaging bus (spec §6).
//!
//! Every message is a fixed 22-byte header followed by `length` bytes of
//! type-specific payload, all integers in network byte order. The codec
//! follows the teacher's manual `Decoder`/`Encoder` style
//! (`core/protocol/resp_frame.rs`) rather than a derive-based serializer,
//! since the format is externally fixed and must round-trip byte-for-byte.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::errors::GroupdError;
use crate::core::node::NodeId;

/// `u8 + u8 + u16 + u32 + u32 + u32 + u32 + u16` (type, status, level,
/// event_id, group_id, last_id, to_nodeid, length).
pub const HEADER_LEN: usize = 22;
/// Byte offset of the trailing `u16` payload-length field within the header.
const LENGTH_FIELD_OFFSET: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    JoinReq = 1,
    JoinRep = 2,
    JstopReq = 3,
    JstopRep = 4,
    JstartCmd = 5,
    LeaveReq = 6,
    LeaveRep = 7,
    LstopReq = 8,
    LstopRep = 9,
    LstartCmd = 10,
    LstartDone = 11,
    Recover = 12,
    Barrier = 13,
    AppInternal = 14,
    AppStopped = 15,
    AppStarted = 16,
}

impl MessageType {
    fn from_u8(v: u8) -> Result<Self, GroupdError> {
        use MessageType::*;
        Ok(match v {
            1 => JoinReq,
            2 => JoinRep,
            3 => JstopReq,
            4 => JstopRep,
            5 => JstartCmd,
            6 => LeaveReq,
            7 => LeaveRep,
            8 => LstopReq,
            9 => LstopRep,
            10 => LstartCmd,
            11 => LstartDone,
            12 => Recover,
            13 => Barrier,
            14 => AppInternal,
            15 => AppStopped,
            16 => AppStarted,
            other => {
                return Err(GroupdError::MalformedMessage(format!(
                    "unknown message type {other}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Pos = 1,
    Neg = 2,
    Wait = 3,
}

impl Status {
    fn from_u8(v: u8) -> Result<Self, GroupdError> {
        Ok(match v {
            1 => Status::Pos,
            2 => Status::Neg,
            3 => Status::Wait,
            other => {
                return Err(GroupdError::MalformedMessage(format!(
                    "unknown status {other}"
                )));
            }
        })
    }
}

/// The fixed 20-byte header shared by every wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub ms_type: MessageType,
    pub ms_status: Status,
    pub ms_level: u16,
    pub ms_event_id: u32,
    pub ms_group_id: u32,
    pub ms_last_id: u32,
    pub ms_to_nodeid: NodeId,
}

/// A header plus its type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub header: Header,
    pub payload: bytes::Bytes,
}

impl WireMessage {
    pub fn new(header: Header, payload: bytes::Bytes) -> Self {
        WireMessage { header, payload }
    }
}

#[derive(Debug, Default)]
pub struct WireCodec;

impl Encoder<WireMessage> for WireCodec {
    type Error = GroupdError;

    fn encode(&mut self, msg: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length: u16 = msg
            .payload
            .len()
            .try_into()
            .map_err(|_| GroupdError::MalformedMessage("payload too large".into()))?;

        dst.reserve(HEADER_LEN + msg.payload.len());
        dst.put_u8(msg.header.ms_type as u8);
        dst.put_u8(msg.header.ms_status as u8);
        dst.put_u16(msg.header.ms_level);
        dst.put_u32(msg.header.ms_event_id);
        dst.put_u32(msg.header.ms_group_id);
        dst.put_u32(msg.header.ms_last_id);
        dst.put_u32(msg.header.ms_to_nodeid);
        dst.put_u16(length);
        dst.extend_from_slice(&msg.payload);
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = WireMessage;
    type Error = GroupdError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[LENGTH_FIELD_OFFSET], src[LENGTH_FIELD_OFFSET + 1]]) as usize;
        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut header_buf = src.split_to(HEADER_LEN);
        let ms_type = MessageType::from_u8(header_buf.get_u8())?;
        let ms_status = Status::from_u8(header_buf.get_u8())?;
        let ms_level = header_buf.get_u16();
        let ms_event_id = header_buf.get_u32();
        let ms_group_id = header_buf.get_u32();
        let ms_last_id = header_buf.get_u32();
        let ms_to_nodeid = header_buf.get_u32();
        let _length_field = header_buf.get_u16();

        let payload = src.split_to(length).freeze();

        Ok(Some(WireMessage {
            header: Header {
                ms_type,
                ms_status,
                ms_level,
                ms_event_id,
                ms_group_id,
                ms_last_id,
                ms_to_nodeid,
            },
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample() -> WireMessage {
        WireMessage::new(
            Header {
                ms_type: MessageType::JoinReq,
                ms_status: Status::Pos,
                ms_level: 0,
                ms_event_id: 42,
                ms_group_id: 0x0001_0007,
                ms_last_id: 0,
                ms_to_nodeid: 7,
            },
            Bytes::from_static(b"lock1"),
        )
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(sample(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().expect("one message");
        assert_eq!(decoded, sample());
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_returns_none_on_partial_header() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8; 10]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_waits_for_full_payload() {
        let mut codec = WireCodec;
        let mut full = BytesMut::new();
        codec.encode(sample(), &mut full).unwrap();
        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..HEADER_LEN + 2]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(200);
        buf.put_u8(Status::Pos as u8);
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u16(0);
        assert!(codec.decode(&mut buf).is_err());
    }
}
