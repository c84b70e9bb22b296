//! Wire Protocol
//!
//! Peers exchange length-prefixed frames. Each frame carries one
//! message: a fixed 12-byte prelude followed by a per-kind binary body.
//!
//! ```text
//! +----------------+-----------------------------------------------+
//! | Frame length   |  u32, body bytes that follow (codec level)    |
//! +----------------+-----------------------------------------------+
//! | type           |  u8, message kind                             |
//! | flags          |  u8                                           |
//! | reserved       |  u16                                          |
//! | size           |  u32, body length                             |
//! | checksum       |  u32, CRC32 of the body                       |
//! +----------------+-----------------------------------------------+
//! | body           |  per-kind encoding, varint-prefixed fields    |
//! +----------------+-----------------------------------------------+
//! ```
//!
//! Unknown message types and bad checksums surface as `Status::BadMsg` /
//! `Status::ChecksumMismatch`; the connection layer treats both as
//! protocol errors on the offending connection, never as a crash.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::status::Status;
use crate::types::{ClientId, LogId, NodeId, NodeIndex, Priority};

/// Hard cap on a single message body. Anything larger is rejected with
/// `TooBig` before it reaches a connection.
pub const MAX_MESSAGE_LEN: usize = 32 * 1024 * 1024;

/// Prelude bytes in front of every body.
pub const HEADER_LEN: usize = 12;

/// Oldest protocol version peers are still able to talk to.
pub const MIN_PROTOCOL: u16 = 1;

/// Current protocol version offered in handshakes.
pub const PROTOCOL: u16 = 2;

pub mod flags {
    /// Body is compressed (appends only; the blob carries its own
    /// compression tag, this flag is informational).
    pub const COMPRESSED: u8 = 1 << 0;
}

/// Message kind tags. The numeric values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    Ack = 2,
    Append = 3,
    Appended = 4,
    Gossip = 5,
    ConfigChanged = 6,
    ShutdownNotice = 7,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<MessageType> {
        match v {
            1 => Some(MessageType::Hello),
            2 => Some(MessageType::Ack),
            3 => Some(MessageType::Append),
            4 => Some(MessageType::Appended),
            5 => Some(MessageType::Gossip),
            6 => Some(MessageType::ConfigChanged),
            7 => Some(MessageType::ShutdownNotice),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Ack => "ACK",
            MessageType::Append => "APPEND",
            MessageType::Appended => "APPENDED",
            MessageType::Gossip => "GOSSIP",
            MessageType::ConfigChanged => "CONFIG_CHANGED",
            MessageType::ShutdownNotice => "SHUTDOWN",
        }
    }

    /// Message kinds permitted on a gossip connection.
    pub fn allowed_on_gossip(&self) -> bool {
        matches!(
            self,
            MessageType::Hello
                | MessageType::Ack
                | MessageType::Gossip
                | MessageType::ConfigChanged
                | MessageType::ShutdownNotice
        )
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, MessageType::Hello | MessageType::Ack)
    }
}

/// Shared prelude of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub flags: u8,
    pub size: u32,
    pub checksum: u32,
}

/// First message on every connection, sent by the initiating side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub protocol_version: u16,
    pub csid: Option<String>,
    pub client_location: Option<String>,
    /// Set when the connecting peer is itself a cluster node.
    pub source_node: Option<NodeId>,
}

/// Handshake reply; carries the id the server assigned to this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMessage {
    pub protocol_version: u16,
    pub your_name_at_peer: ClientId,
    pub status: Status,
}

/// One batched write from a client to a sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendMessage {
    pub log_id: LogId,
    /// Opaque batch blob produced by the buffered-writer encoder.
    pub blob: Bytes,
    pub record_count: u32,
}

/// Sequencer reply to an `Append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedMessage {
    pub log_id: LogId,
    pub status: Status,
    /// Sequence number assigned to the first record of the batch.
    pub first_seq: u64,
    /// Where to go instead, when `status` is `Redirected`/`Preempted`.
    pub redirect: Option<NodeId>,
}

/// Failure-detector state exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GossipMessage {
    pub entries: Vec<(NodeIndex, u32)>,
}

/// Notifies peers that a new nodes-configuration version exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigChangedMessage {
    pub version: u64,
}

/// Tagged message variant over all known kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(HelloMessage),
    Ack(AckMessage),
    Append(AppendMessage),
    Appended(AppendedMessage),
    Gossip(GossipMessage),
    ConfigChanged(ConfigChangedMessage),
    ShutdownNotice,
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Ack(_) => MessageType::Ack,
            Message::Append(_) => MessageType::Append,
            Message::Appended(_) => MessageType::Appended,
            Message::Gossip(_) => MessageType::Gossip,
            Message::ConfigChanged(_) => MessageType::ConfigChanged,
            Message::ShutdownNotice => MessageType::ShutdownNotice,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Message::Hello(_) | Message::Ack(_) => Priority::Max,
            Message::Gossip(_) | Message::ConfigChanged(_) => Priority::Max,
            Message::Append(_) | Message::Appended(_) => Priority::ClientHigh,
            Message::ShutdownNotice => Priority::Max,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Message::Hello(m) => {
                buf.put_u16(m.protocol_version);
                put_opt_str(buf, m.csid.as_deref());
                put_opt_str(buf, m.client_location.as_deref());
                match m.source_node {
                    Some(node) => {
                        buf.put_u8(1);
                        buf.put_u16(node.index);
                        buf.put_u32(node.generation);
                    }
                    None => buf.put_u8(0),
                }
            }
            Message::Ack(m) => {
                buf.put_u16(m.protocol_version);
                buf.put_i32(m.your_name_at_peer.0);
                buf.put_u8(status_to_wire(m.status));
            }
            Message::Append(m) => {
                buf.put_u64(m.log_id.0);
                buf.put_u32(m.record_count);
                put_varint_u64(buf, m.blob.len() as u64);
                buf.put_slice(&m.blob);
            }
            Message::Appended(m) => {
                buf.put_u64(m.log_id.0);
                buf.put_u8(status_to_wire(m.status));
                buf.put_u64(m.first_seq);
                match m.redirect {
                    Some(node) => {
                        buf.put_u8(1);
                        buf.put_u16(node.index);
                        buf.put_u32(node.generation);
                    }
                    None => buf.put_u8(0),
                }
            }
            Message::Gossip(m) => {
                put_varint_u64(buf, m.entries.len() as u64);
                for (idx, beat) in &m.entries {
                    buf.put_u16(*idx);
                    buf.put_u32(*beat);
                }
            }
            Message::ConfigChanged(m) => {
                buf.put_u64(m.version);
            }
            Message::ShutdownNotice => {}
        }
    }

    fn decode_body(msg_type: MessageType, buf: &mut Bytes) -> Result<Message, Status> {
        match msg_type {
            MessageType::Hello => {
                let protocol_version = get_u16(buf)?;
                let csid = get_opt_str(buf)?;
                let client_location = get_opt_str(buf)?;
                let source_node = match get_u8(buf)? {
                    0 => None,
                    1 => Some(NodeId::new(get_u16(buf)?, get_u32(buf)?)),
                    _ => return Err(Status::BadMsg),
                };
                Ok(Message::Hello(HelloMessage {
                    protocol_version,
                    csid,
                    client_location,
                    source_node,
                }))
            }
            MessageType::Ack => Ok(Message::Ack(AckMessage {
                protocol_version: get_u16(buf)?,
                your_name_at_peer: ClientId(get_i32(buf)?),
                status: status_from_wire(get_u8(buf)?)?,
            })),
            MessageType::Append => {
                let log_id = LogId(get_u64(buf)?);
                let record_count = get_u32(buf)?;
                let len = get_varint_u64(buf)? as usize;
                if buf.remaining() < len {
                    return Err(Status::BadMsg);
                }
                let blob = buf.split_to(len);
                Ok(Message::Append(AppendMessage {
                    log_id,
                    blob,
                    record_count,
                }))
            }
            MessageType::Appended => {
                let log_id = LogId(get_u64(buf)?);
                let status = status_from_wire(get_u8(buf)?)?;
                let first_seq = get_u64(buf)?;
                let redirect = match get_u8(buf)? {
                    0 => None,
                    1 => Some(NodeId::new(get_u16(buf)?, get_u32(buf)?)),
                    _ => return Err(Status::BadMsg),
                };
                Ok(Message::Appended(AppendedMessage {
                    log_id,
                    status,
                    first_seq,
                    redirect,
                }))
            }
            MessageType::Gossip => {
                let count = get_varint_u64(buf)? as usize;
                if count > buf.remaining() {
                    return Err(Status::BadMsg);
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push((get_u16(buf)?, get_u32(buf)?));
                }
                Ok(Message::Gossip(GossipMessage { entries }))
            }
            MessageType::ConfigChanged => Ok(Message::ConfigChanged(ConfigChangedMessage {
                version: get_u64(buf)?,
            })),
            MessageType::ShutdownNotice => Ok(Message::ShutdownNotice),
        }
    }

    /// Serialize into one wire frame (header + body). The returned cost
    /// is what the connection accounts against its outbuf budget.
    pub fn encode(&self) -> Result<Bytes, Status> {
        let mut body = BytesMut::with_capacity(64);
        self.encode_body(&mut body);
        if body.len() > MAX_MESSAGE_LEN {
            return Err(Status::TooBig);
        }

        let checksum = crc32fast::hash(&body);
        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        frame.put_u8(self.msg_type() as u8);
        frame.put_u8(0); // flags
        frame.put_u16(0); // reserved
        frame.put_u32(body.len() as u32);
        frame.put_u32(checksum);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Serialized size without building the frame; used for cost
    /// accounting at registration time, before the real serialization.
    pub fn cost(&self) -> usize {
        let mut body = BytesMut::with_capacity(64);
        self.encode_body(&mut body);
        HEADER_LEN + body.len()
    }

    /// Parse one frame produced by `encode`.
    pub fn decode(mut frame: Bytes) -> Result<Message, Status> {
        if frame.len() < HEADER_LEN {
            return Err(Status::BadMsg);
        }
        let type_byte = frame.get_u8();
        let _flags = frame.get_u8();
        let _reserved = frame.get_u16();
        let size = frame.get_u32() as usize;
        let checksum = frame.get_u32();

        let msg_type = MessageType::from_u8(type_byte).ok_or(Status::BadMsg)?;
        if frame.remaining() != size {
            return Err(Status::BadMsg);
        }
        if crc32fast::hash(&frame) != checksum {
            return Err(Status::ChecksumMismatch);
        }
        Message::decode_body(msg_type, &mut frame)
    }
}

/// Length-prefixed frame codec for the stream transport. Each frame is
/// `u32 length` followed by that many bytes (header + body).
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_MESSAGE_LEN + HEADER_LEN,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Bytes>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = (&src[..4]).get_u32() as usize;
        if length > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", length),
            ));
        }
        let total = 4 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> std::io::Result<()> {
        if item.len() > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", item.len()),
            ));
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

// Varint and checked-read helpers. Wire data is untrusted, so every read
// is bounds-checked and short buffers surface as BadMsg.

pub fn put_varint_u64(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn get_varint_u64(buf: &mut impl Buf) -> Result<u64, Status> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(Status::BadMsg);
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Status::BadMsg);
        }
    }
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            put_varint_u64(buf, s.len() as u64 + 1);
            buf.put_slice(s.as_bytes());
        }
        None => put_varint_u64(buf, 0),
    }
}

fn get_opt_str(buf: &mut Bytes) -> Result<Option<String>, Status> {
    let tag = get_varint_u64(buf)?;
    if tag == 0 {
        return Ok(None);
    }
    let len = (tag - 1) as usize;
    if buf.remaining() < len {
        return Err(Status::BadMsg);
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| Status::BadMsg)
}

fn get_u8(buf: &mut impl Buf) -> Result<u8, Status> {
    if buf.remaining() < 1 {
        return Err(Status::BadMsg);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut impl Buf) -> Result<u16, Status> {
    if buf.remaining() < 2 {
        return Err(Status::BadMsg);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut impl Buf) -> Result<u32, Status> {
    if buf.remaining() < 4 {
        return Err(Status::BadMsg);
    }
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut impl Buf) -> Result<i32, Status> {
    if buf.remaining() < 4 {
        return Err(Status::BadMsg);
    }
    Ok(buf.get_i32())
}

fn get_u64(buf: &mut impl Buf) -> Result<u64, Status> {
    if buf.remaining() < 8 {
        return Err(Status::BadMsg);
    }
    Ok(buf.get_u64())
}

// Statuses that actually travel on the wire get stable small tags.
fn status_to_wire(status: Status) -> u8 {
    match status {
        Status::Ok => 0,
        Status::Timedout => 1,
        Status::Shutdown => 2,
        Status::NoBufs => 3,
        Status::TooBig => 4,
        Status::Preempted => 5,
        Status::Redirected => 6,
        Status::NotReady => 7,
        Status::Disabled => 8,
        Status::Again => 9,
        Status::ProtoNoSupport => 10,
        Status::Access => 11,
        _ => 12,
    }
}

fn status_from_wire(tag: u8) -> Result<Status, Status> {
    Ok(match tag {
        0 => Status::Ok,
        1 => Status::Timedout,
        2 => Status::Shutdown,
        3 => Status::NoBufs,
        4 => Status::TooBig,
        5 => Status::Preempted,
        6 => Status::Redirected,
        7 => Status::NotReady,
        8 => Status::Disabled,
        9 => Status::Again,
        10 => Status::ProtoNoSupport,
        11 => Status::Access,
        12 => Status::Internal,
        _ => return Err(Status::BadMsg),
    })
}
