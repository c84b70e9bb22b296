//! Server Settings
//!
//! The slice of a server's local settings that feeds node registration:
//! identity, the addresses it listens on (with the unix-socket /
//! TCP-port fallback the deployment tooling relies on), roles and
//! storage shape. Ports left at 0 and empty unix socket paths mean "not
//! configured".

use std::collections::BTreeMap;

use seqlog_core::NodeLocation;
use serde::{Deserialize, Serialize};

use crate::service_discovery::{NetworkPriority, RoleSet, SocketAddress};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Unique node name, typically the hostname.
    pub name: String,
    /// Software version to publish in service discovery.
    pub version: Option<u64>,

    /// Interface address used for every TCP listener.
    pub address: String,
    pub port: u16,
    pub unix_socket: String,

    pub gossip_port: u16,
    pub gossip_unix_socket: String,

    pub ssl_port: u16,
    pub ssl_unix_socket: String,

    pub admin_enabled: bool,
    pub admin_port: u16,
    pub admin_unix_socket: String,

    pub server_to_server_port: u16,
    pub server_to_server_unix_socket: String,

    pub server_rpc_port: u16,
    pub server_rpc_unix_socket: String,

    pub client_rpc_port: u16,
    pub client_rpc_unix_socket: String,

    /// Optional per-priority listeners; unix socket paths win over ports.
    #[serde(default)]
    pub ports_per_network_priority: BTreeMap<NetworkPriority, u16>,
    #[serde(default)]
    pub unix_addresses_per_network_priority: BTreeMap<NetworkPriority, String>,

    pub location: Option<NodeLocation>,
    pub roles: RoleSet,
    pub sequencer_weight: f64,
    pub storage_capacity: f64,
    pub num_shards: u16,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ServerSettings {
    /// Unix socket wins over TCP when both are configured; `None` when
    /// neither is.
    fn resolve(&self, unix_socket: &str, port: u16) -> Option<SocketAddress> {
        if !unix_socket.is_empty() {
            Some(SocketAddress::unix(unix_socket))
        } else if port > 0 {
            Some(SocketAddress::tcp(self.address.clone(), port))
        } else {
            None
        }
    }

    pub fn data_address(&self) -> Option<SocketAddress> {
        self.resolve(&self.unix_socket, self.port)
    }

    pub fn gossip_address(&self) -> Option<SocketAddress> {
        self.resolve(&self.gossip_unix_socket, self.gossip_port)
    }

    pub fn ssl_address(&self) -> Option<SocketAddress> {
        self.resolve(&self.ssl_unix_socket, self.ssl_port)
    }

    pub fn admin_address(&self) -> Option<SocketAddress> {
        if !self.admin_enabled {
            return None;
        }
        self.resolve(&self.admin_unix_socket, self.admin_port)
    }

    pub fn server_to_server_address(&self) -> Option<SocketAddress> {
        self.resolve(
            &self.server_to_server_unix_socket,
            self.server_to_server_port,
        )
    }

    pub fn server_rpc_address(&self) -> Option<SocketAddress> {
        self.resolve(&self.server_rpc_unix_socket, self.server_rpc_port)
    }

    pub fn client_rpc_address(&self) -> Option<SocketAddress> {
        self.resolve(&self.client_rpc_unix_socket, self.client_rpc_port)
    }

    /// The per-priority address map: unix addresses when configured,
    /// otherwise ports on the main interface.
    pub fn addresses_per_priority(&self) -> BTreeMap<NetworkPriority, SocketAddress> {
        if !self.unix_addresses_per_network_priority.is_empty() {
            self.unix_addresses_per_network_priority
                .iter()
                .map(|(p, path)| (*p, SocketAddress::unix(path.clone())))
                .collect()
        } else {
            self.ports_per_network_priority
                .iter()
                .map(|(p, port)| (*p, SocketAddress::tcp(self.address.clone(), *port)))
                .collect()
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: None,
            address: "127.0.0.1".to_string(),
            port: 0,
            unix_socket: String::new(),
            gossip_port: 0,
            gossip_unix_socket: String::new(),
            ssl_port: 0,
            ssl_unix_socket: String::new(),
            admin_enabled: false,
            admin_port: 0,
            admin_unix_socket: String::new(),
            server_to_server_port: 0,
            server_to_server_unix_socket: String::new(),
            server_rpc_port: 0,
            server_rpc_unix_socket: String::new(),
            client_rpc_port: 0,
            client_rpc_unix_socket: String::new(),
            ports_per_network_priority: BTreeMap::new(),
            unix_addresses_per_network_priority: BTreeMap::new(),
            location: None,
            roles: RoleSet::default(),
            sequencer_weight: 1.0,
            storage_capacity: 1.0,
            num_shards: 1,
            tags: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_socket_wins_over_port() {
        let settings = ServerSettings {
            name: "n0".into(),
            port: 4440,
            unix_socket: "/run/seqlog/data.sock".into(),
            ..Default::default()
        };
        assert_eq!(
            settings.data_address(),
            Some(SocketAddress::unix("/run/seqlog/data.sock"))
        );
    }

    #[test]
    fn test_unconfigured_address_is_none() {
        let settings = ServerSettings {
            name: "n0".into(),
            ..Default::default()
        };
        assert_eq!(settings.gossip_address(), None);
        assert_eq!(settings.data_address(), None);
    }

    #[test]
    fn test_admin_address_requires_flag() {
        let mut settings = ServerSettings {
            name: "n0".into(),
            admin_port: 6440,
            ..Default::default()
        };
        assert_eq!(settings.admin_address(), None);
        settings.admin_enabled = true;
        assert_eq!(
            settings.admin_address(),
            Some(SocketAddress::tcp("127.0.0.1", 6440))
        );
    }

    #[test]
    fn test_priority_map_prefers_unix() {
        let mut settings = ServerSettings {
            name: "n0".into(),
            ..Default::default()
        };
        settings
            .ports_per_network_priority
            .insert(NetworkPriority::Low, 5000);
        settings
            .unix_addresses_per_network_priority
            .insert(NetworkPriority::Low, "/run/low.sock".into());
        let map = settings.addresses_per_priority();
        assert_eq!(
            map.get(&NetworkPriority::Low),
            Some(&SocketAddress::unix("/run/low.sock"))
        );
    }
}
