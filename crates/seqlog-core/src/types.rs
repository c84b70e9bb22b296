//! Identity Types
//!
//! Every peer in a SeqLog cluster is named by an `Address`: either a
//! cluster node (`NodeId` = slot index + generation) or an inbound client
//! session (`ClientId`, unique within one worker's lifetime). Addresses
//! are small, copyable and hashable, and are the only key the connection
//! layer routes by.
//!
//! The generation in a `NodeId` distinguishes successive occupancies of
//! the same slot: when hardware is replaced, the index stays and the
//! generation is bumped, so stale connections to the previous occupant
//! can be detected and torn down.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a node slot in the cluster, dense and small.
pub type NodeIndex = u16;

/// Generation counter distinguishing occupancies of one slot.
pub type Generation = u32;

/// Log identifier. Each log is an independent ordered record sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LogId(pub u64);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A cluster peer: slot index plus generation.
///
/// A generation of 0 means "whatever generation the configuration
/// currently has" and is resolved at connect time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId {
    pub index: NodeIndex,
    pub generation: Generation,
}

impl NodeId {
    pub fn new(index: NodeIndex, generation: Generation) -> Self {
        Self { index, generation }
    }

    /// NodeId with an unresolved generation.
    pub fn any_generation(index: NodeIndex) -> Self {
        Self {
            index,
            generation: 0,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.index)?;
        if self.generation > 0 {
            write!(f, ":G{}", self.generation)?;
        }
        Ok(())
    }
}

/// Worker-local identifier of an inbound client session.
///
/// Ids are issued by the worker's allocator when a connection is
/// accepted and released back when the connection is reclaimed; a valid
/// id is always positive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClientId(pub i32);

impl ClientId {
    pub const INVALID: ClientId = ClientId(0);

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Tagged peer identity: a cluster node or an inbound client session.
///
/// Equality and hashing cover the full tagged contents, so `Node(3, 2)`
/// and `Node(3, 4)` are different addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    Node(NodeId),
    Client(ClientId),
}

impl Address {
    pub fn is_client(&self) -> bool {
        matches!(self, Address::Client(_))
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Address::Node(_))
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Address::Node(id) => Some(*id),
            Address::Client(_) => None,
        }
    }

    pub fn as_client(&self) -> Option<ClientId> {
        match self {
            Address::Client(id) => Some(*id),
            Address::Node(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Node(id) => write!(f, "{}", id),
            Address::Client(id) => write!(f, "{}", id),
        }
    }
}

impl From<NodeId> for Address {
    fn from(id: NodeId) -> Self {
        Address::Node(id)
    }
}

impl From<ClientId> for Address {
    fn from(id: ClientId) -> Self {
        Address::Client(id)
    }
}

/// A storage slot: one shard of one node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ShardId {
    pub node: NodeIndex,
    pub shard: u16,
}

impl ShardId {
    pub fn new(node: NodeIndex, shard: u16) -> Self {
        Self { node, shard }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}:S{}", self.node, self.shard)
    }
}

/// Outgoing message priority, highest first. Each flow group keeps one
/// token bucket per priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Max = 0,
    ClientHigh = 1,
    ClientNormal = 2,
    ClientLow = 3,
    Background = 4,
}

impl Priority {
    pub const COUNT: usize = 5;

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn all() -> [Priority; Priority::COUNT] {
        [
            Priority::Max,
            Priority::ClientHigh,
            Priority::ClientNormal,
            Priority::ClientLow,
            Priority::Background,
        ]
    }
}

/// Coarse classification of traffic used by callers of the send path;
/// mapped onto a `Priority` for shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Handshake,
    Append,
    Read,
    Gossip,
    Rebuild,
    Background,
}

impl TrafficClass {
    pub fn priority(&self) -> Priority {
        match self {
            TrafficClass::Handshake => Priority::Max,
            TrafficClass::Append => Priority::ClientHigh,
            TrafficClass::Read => Priority::ClientNormal,
            TrafficClass::Gossip => Priority::Max,
            TrafficClass::Rebuild => Priority::ClientLow,
            TrafficClass::Background => Priority::Background,
        }
    }
}

/// Which side of the connection the peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerType {
    Client = 0,
    Node = 1,
}

impl PeerType {
    pub const COUNT: usize = 2;

    pub fn index(&self) -> usize {
        *self as usize
    }
}
