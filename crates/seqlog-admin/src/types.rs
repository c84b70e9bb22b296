//! Admin Request and Response Types
//!
//! The JSON bodies of the admin surface. These mirror the nodes
//! configuration closely but stay independent of it: the wire types
//! evolve with the API, the configuration with the cluster.

use std::collections::BTreeMap;

use seqlog_core::ShardId;
use seqlog_membership::{RoleSet, SocketAddress};
use serde::{Deserialize, Serialize};

use crate::failure_detector::PeerState;

/// Sentinel index meaning "pick a free index for me".
pub const ANY_NODE_IDX: i32 = -1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub capacity: f64,
    pub num_shards: u16,
}

/// One node as the admin surface sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_index: i32,
    pub name: String,
    pub data_address: SocketAddress,
    #[serde(default)]
    pub gossip_address: Option<SocketAddress>,
    #[serde(default)]
    pub ssl_address: Option<SocketAddress>,
    #[serde(default)]
    pub admin_address: Option<SocketAddress>,
    #[serde(default)]
    pub server_to_server_address: Option<SocketAddress>,
    /// Dot-separated location path.
    #[serde(default)]
    pub location: Option<String>,
    pub roles: RoleSet,
    #[serde(default)]
    pub sequencer: Option<SequencerConfig>,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddSingleNodeRequest {
    pub new_config: NodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNodesRequest {
    pub new_node_requests: Vec<AddSingleNodeRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNodesResponse {
    pub added_nodes: Vec<NodeConfig>,
    pub new_nodes_configuration_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSingleNodeRequest {
    /// Index of the node being updated; must match
    /// `new_config.node_index`.
    pub node_to_be_updated: i32,
    pub new_config: NodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNodesRequest {
    pub node_requests: Vec<UpdateSingleNodeRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNodesResponse {
    pub updated_nodes: Vec<NodeConfig>,
    pub new_nodes_configuration_version: u64,
}

/// Matches nodes by any combination of criteria; an empty filter
/// matches every node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodesFilter {
    #[serde(default)]
    pub node_indexes: Option<Vec<u16>>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveNodesRequest {
    pub node_filters: Vec<NodesFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveNodesResponse {
    pub removed_nodes: Vec<u16>,
    pub new_nodes_configuration_version: u64,
}

/// `-1` as the shard index selects every shard of the node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShardSelector {
    pub node_index: u16,
    pub shard_index: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkShardsAsProvisionedRequest {
    pub shards: Vec<ShardSelector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkShardsAsProvisionedResponse {
    pub updated_shards: Vec<ShardId>,
    pub new_nodes_configuration_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BumpGenerationRequest {
    pub node_filters: Vec<NodesFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BumpGenerationResponse {
    pub bumped_nodes: Vec<u16>,
    pub new_nodes_configuration_version: u64,
}

/// Scope name (`"node"`, `"rack"`, ...) to replication factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapClusterRequest {
    pub metadata_replication_property: BTreeMap<String, u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapClusterResponse {
    pub new_nodes_configuration_version: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetNodesConfigRequest {
    #[serde(default)]
    pub filter: NodesFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNodesConfigResponse {
    pub nodes: Vec<NodeConfig>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStateInfo {
    pub shard: ShardId,
    pub storage_state: String,
    pub metadata_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStateInfo {
    pub node_index: u16,
    pub peer_state: PeerState,
    pub generation: u32,
    pub sequencer_enabled: Option<bool>,
    pub shards: Vec<ShardStateInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNodesStateResponse {
    pub states: Vec<NodeStateInfo>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySettingOverrideRequest {
    pub name: String,
    pub value: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveSettingOverrideRequest {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SettingSource {
    Cli,
    Config,
    AdminOverride,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingInfo {
    pub current_value: String,
    pub default_value: String,
    /// Every source that carries a value for this setting.
    pub sources: BTreeMap<SettingSource, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetSettingsRequest {
    /// Restrict to these setting names; empty means all.
    #[serde(default)]
    pub settings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSettingsResponse {
    pub settings: BTreeMap<String, SettingInfo>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TakeSnapshotRequest {
    #[serde(default)]
    pub min_version: u64,
}
