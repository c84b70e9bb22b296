//! Connection Descriptors
//!
//! `ConnectionInfo` is the immutable-ish descriptor of a live
//! connection: who the peer is, how we talk to it, and who it
//! authenticated as. The `is_active` token doubles as the liveness
//! handle other subsystems hold: the Sender flips it to false on close,
//! and a connection whose token still has outside holders after close
//! is a zombie that must not be reclaimed yet.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use seqlog_core::{Address, ClientId, NodeIndex};
use seqlog_membership::SocketAddress;

/// Transport security of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Plain,
    Ssl,
    None,
}

/// What an outgoing socket is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Data,
    Gossip,
}

/// What an accepted socket is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Data,
    Gossip,
}

/// Authenticated identity of the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalIdentity {
    pub principal: String,
    /// (identity type, identity value) pairs from the auth layer.
    pub identities: Vec<(String, String)>,
}

impl PrincipalIdentity {
    pub const UNAUTHENTICATED: &'static str = "unauthenticated";

    pub fn unauthenticated() -> Self {
        Self {
            principal: Self::UNAUTHENTICATED.to_string(),
            identities: Vec::new(),
        }
    }
}

/// Descriptor of one live connection. Mutated only through
/// `Sender::set_connection_info`.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer_name: Address,
    pub peer_address: SocketAddress,
    pub connection_type: ConnectionType,
    /// Negotiated protocol version; `None` until the handshake is done.
    pub protocol: Option<u16>,
    pub principal: Arc<PrincipalIdentity>,
    /// Client session id string, reported by clients at handshake.
    pub csid: Option<String>,
    /// Location string the client reported, for shaping-scope choice.
    pub client_location: Option<String>,
    /// When the peer is actually a cluster node connecting inbound.
    pub peer_node_idx: Option<NodeIndex>,
    /// The ClientId the peer assigned to us on its side.
    pub our_name_at_peer: Option<ClientId>,
    /// Liveness token; cleared exactly once on close. Holders keep the
    /// `Arc` to observe the transition.
    pub is_active: Arc<AtomicBool>,
}

impl ConnectionInfo {
    pub fn new(peer_name: Address, peer_address: SocketAddress, conn_type: ConnectionType) -> Self {
        Self {
            peer_name,
            peer_address,
            connection_type: conn_type,
            protocol: None,
            principal: Arc::new(PrincipalIdentity::unauthenticated()),
            csid: None,
            client_location: None,
            peer_node_idx: None,
            our_name_at_peer: None,
            is_active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_peer_client(&self) -> bool {
        self.peer_name.is_client() && self.peer_node_idx.is_none()
    }

    pub fn is_ssl(&self) -> bool {
        self.connection_type == ConnectionType::Ssl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_client_detection() {
        let mut info = ConnectionInfo::new(
            Address::Client(ClientId(1)),
            SocketAddress::tcp("10.0.0.9", 9999),
            ConnectionType::Plain,
        );
        assert!(info.is_peer_client());
        // An inbound connection from another cluster node is not a
        // client even though it is keyed by ClientId.
        info.peer_node_idx = Some(4);
        assert!(!info.is_peer_client());
    }
}
