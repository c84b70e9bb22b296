//! Per-Node Service Discovery
//!
//! The static, rarely-changing part of a node's configuration: where to
//! reach it (data, gossip, SSL, admin and RPC addresses, optionally one
//! address per network priority), where it sits (location), and what it
//! does (roles). The dynamic state lives in the memberships.

use std::collections::BTreeMap;
use std::fmt;

use seqlog_core::NodeLocation;
use serde::{Deserialize, Serialize};

/// A reachable endpoint: TCP host/port or a unix domain socket path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketAddress {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

impl SocketAddress {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        SocketAddress::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        SocketAddress::Unix { path: path.into() }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Tcp { host, port } => write!(f, "{}:{}", host, port),
            SocketAddress::Unix { path } => write!(f, "unix://{}", path),
        }
    }
}

/// Network priority for the per-priority address map. Callers that know
/// their traffic matters less can be steered to a separate address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum NetworkPriority {
    High,
    Medium,
    Low,
}

/// Which subsystems a node participates in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet {
    pub sequencer: bool,
    pub storage: bool,
}

impl RoleSet {
    pub fn sequencer_only() -> Self {
        Self {
            sequencer: true,
            storage: false,
        }
    }

    pub fn storage_only() -> Self {
        Self {
            sequencer: false,
            storage: true,
        }
    }

    pub fn both() -> Self {
        Self {
            sequencer: true,
            storage: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.sequencer && !self.storage
    }
}

/// Everything needed to find and classify one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeServiceDiscovery {
    /// Human-readable unique name, e.g. the hostname.
    pub name: String,

    /// Software version the node registered with.
    pub version: Option<u64>,

    /// Default address for data traffic. Mandatory.
    pub data_address: SocketAddress,

    pub gossip_address: Option<SocketAddress>,
    pub ssl_address: Option<SocketAddress>,
    pub admin_address: Option<SocketAddress>,
    pub server_to_server_address: Option<SocketAddress>,
    pub server_rpc_address: Option<SocketAddress>,
    pub client_rpc_address: Option<SocketAddress>,

    /// Optional dedicated address per network priority.
    #[serde(default)]
    pub addresses_per_priority: BTreeMap<NetworkPriority, SocketAddress>,

    /// Failure-domain path; immutable once set.
    pub location: Option<NodeLocation>,

    pub roles: RoleSet,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl NodeServiceDiscovery {
    /// The address another cluster node should dial for data traffic.
    pub fn node_to_node_address(&self) -> &SocketAddress {
        self.server_to_server_address
            .as_ref()
            .unwrap_or(&self.data_address)
    }
}
