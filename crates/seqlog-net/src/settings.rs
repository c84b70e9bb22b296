//! Network Layer Settings
//!
//! Everything the per-worker connection machinery is tuned by. One
//! immutable snapshot is taken at Sender construction; settings updates
//! swap the snapshot and the Sender re-evaluates SSL policy for open
//! connections.

use std::collections::BTreeMap;
use std::time::Duration;

use seqlog_core::{LocationScope, Priority, Status};

/// Per-priority shaping policy of one flow group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    /// Sustained bytes per second; negative means unlimited.
    pub bytes_per_sec: i64,
    /// Bucket capacity; bounds how large a burst can drain at once.
    pub burst_bytes: i64,
}

impl BucketPolicy {
    pub const UNLIMITED: BucketPolicy = BucketPolicy {
        bytes_per_sec: -1,
        burst_bytes: i64::MAX,
    };

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec < 0
    }
}

/// Shaping policy per location scope.
#[derive(Debug, Clone)]
pub struct ShapingConfig {
    policies: BTreeMap<LocationScope, [BucketPolicy; Priority::COUNT]>,
}

impl ShapingConfig {
    /// No shaping anywhere; every scope drains freely.
    pub fn unlimited() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    pub fn set_policy(
        &mut self,
        scope: LocationScope,
        policy: [BucketPolicy; Priority::COUNT],
    ) {
        self.policies.insert(scope, policy);
    }

    pub fn policy(&self, scope: LocationScope) -> [BucketPolicy; Priority::COUNT] {
        self.policies
            .get(&scope)
            .copied()
            .unwrap_or([BucketPolicy::UNLIMITED; Priority::COUNT])
    }
}

/// Error injection knobs for tests and failure drills.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorInjection {
    /// `Some(Status::...)`: inject this outcome on the send path.
    /// Supported: a drop (message silently lost) or a forced shaping
    /// event.
    pub status: Option<Status>,
    /// Chance in percent that an eligible message is affected.
    pub chance_percent: f64,
}

#[derive(Debug, Clone)]
pub struct NetSettings {
    /// This process is a server (affects idle-connection policy and the
    /// per-peer-type outbuf split).
    pub server: bool,

    /// Worker-wide cap on serialized-but-unsent bytes.
    pub outbufs_mb_max_per_thread: usize,
    /// Split the outbuf budget evenly between client and node peers.
    pub outbufs_limit_per_peer_type_enabled: bool,
    /// Per-connection floor below which the worker-wide limit does not
    /// reject sends.
    pub min_out_buf_bytes: usize,

    pub socket_health_check_period: Duration,
    /// Pending output older than this with no progress is "slow".
    pub socket_slow_threshold: Duration,
    /// Pending output older than this with no progress is stalled.
    pub socket_stall_threshold: Duration,
    pub idle_connection_keep_alive: Duration,
    /// Max slow-socket closures per health check pass.
    pub rate_limit_socket_closed: usize,
    /// Max idle-connection closures per health check pass.
    pub rate_limit_idle_connection_closed: usize,

    /// Links crossing this scope (or configured for SSL auth) use TLS.
    pub ssl_boundary: LocationScope,
    pub ssl_authentication: bool,
    pub send_to_gossip_port: bool,
    pub ssl_on_gossip_port: bool,

    pub protocol_version: u16,
    pub min_protocol_version: u16,

    pub shaping: ShapingConfig,
    pub error_injection: ErrorInjection,

    /// DSCP for inbound connections from peer cluster nodes.
    pub server_dscp_default: u8,
    /// Per-principal egress DSCP overrides.
    pub egress_dscp_per_principal: BTreeMap<String, u8>,
}

impl NetSettings {
    pub fn outbuf_limit_bytes(&self) -> usize {
        self.outbufs_mb_max_per_thread * 1024 * 1024
    }
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            server: false,
            outbufs_mb_max_per_thread: 512,
            outbufs_limit_per_peer_type_enabled: false,
            min_out_buf_bytes: 8 * 1024 * 1024,
            socket_health_check_period: Duration::from_secs(10),
            socket_slow_threshold: Duration::from_secs(30),
            socket_stall_threshold: Duration::from_secs(60),
            idle_connection_keep_alive: Duration::from_secs(300),
            rate_limit_socket_closed: 10,
            rate_limit_idle_connection_closed: 10,
            ssl_boundary: LocationScope::Root,
            ssl_authentication: false,
            send_to_gossip_port: true,
            ssl_on_gossip_port: false,
            protocol_version: 2,
            min_protocol_version: 1,
            shaping: ShapingConfig::unlimited(),
            error_injection: ErrorInjection::default(),
            server_dscp_default: 0,
            egress_dscp_per_principal: BTreeMap::new(),
        }
    }
}
