//! SeqLog Core - Shared Types and Wire Protocol
//!
//! This crate holds the types every other SeqLog crate builds on:
//!
//! - **Identity**: `NodeId` (index + generation), `ClientId`, and the
//!   `Address` union used as the opaque recipient key everywhere a peer
//!   is named.
//! - **Status**: the flat error/status enumeration carried through the
//!   whole system, from socket errors to admin responses.
//! - **Location**: dot-separated node locations (`region.dc.cluster.row.rack`)
//!   and the `LocationScope` ladder used by traffic shaping and
//!   replication properties.
//! - **Wire**: the framed message protocol between peers - a fixed
//!   prelude (`type`, `size`, `flags`, CRC32 checksum) followed by a
//!   per-kind binary body, plus a length-prefixed frame codec.
//!
//! Nothing in here does I/O; the crate is pure data and codecs so it can
//! be depended on from both client and server builds.

pub mod location;
pub mod status;
pub mod types;
pub mod wire;

pub use location::{LocationScope, NodeLocation};
pub use status::Status;
pub use types::{
    Address, ClientId, Generation, LogId, NodeId, NodeIndex, PeerType, Priority, ShardId,
    TrafficClass,
};
pub use wire::{FrameCodec, Message, MessageHeader, MessageType, HEADER_LEN, MAX_MESSAGE_LEN};
