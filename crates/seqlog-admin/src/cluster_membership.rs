//! Cluster Membership Mutations
//!
//! The admin-driven side of the nodes configuration: add, update and
//! remove nodes, mark shards provisioned, bump generations and
//! bootstrap the cluster. Every operation follows the same shape:
//!
//! 1. read the current configuration snapshot,
//! 2. validate the request against it, collecting per-node failures,
//! 3. build one atomic `NodesConfigurationUpdate`,
//! 4. apply locally and compare-and-swap into the versioned store,
//! 5. on version mismatch, refresh the snapshot and redo from step 1.
//!
//! Validation failures abort the whole operation with the full failure
//! list; nothing is committed partially.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use seqlog_core::{NodeIndex, ShardId};
use seqlog_membership::codec;
use seqlog_membership::{
    NodeServiceDiscovery, NodesConfiguration, NodesConfigurationUpdate, ReplicationProperty,
    SequencerMembershipUpdate, ServiceDiscoveryUpdate, StorageAttributes,
    StorageAttributesUpdate, StorageMembershipUpdate, StorageState, StorageStateTransition,
    UpdatableNodesConfiguration, UpdateOutcome, VersionedConfigStore,
};
use seqlog_core::LocationScope;
use seqlog_membership::sequencer::SequencerNodeUpdate;
use tracing::{info, warn};

use crate::error::{
    AdminError, ClusterMembershipFailureReason, ClusterMembershipOperationFailed,
};
use crate::failure_detector::{FailureDetector, PeerState};
use crate::types::*;

/// Bounded optimistic-concurrency retries against the store.
const MAX_COMMIT_ATTEMPTS: usize = 10;

pub struct ClusterMembershipHandler {
    holder: Arc<UpdatableNodesConfiguration>,
    store: Arc<dyn VersionedConfigStore>,
    detector: Arc<dyn FailureDetector>,
}

impl ClusterMembershipHandler {
    pub fn new(
        holder: Arc<UpdatableNodesConfiguration>,
        store: Arc<dyn VersionedConfigStore>,
        detector: Arc<dyn FailureDetector>,
    ) -> Self {
        Self {
            holder,
            store,
            detector,
        }
    }

    pub fn nodes_configuration(&self) -> Arc<NodesConfiguration> {
        self.holder.get()
    }

    // ---------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------

    pub async fn add_nodes(&self, request: AddNodesRequest) -> Result<AddNodesResponse, AdminError> {
        if request.new_node_requests.is_empty() {
            return Err(AdminError::InvalidRequest("no nodes to add".to_string()));
        }
        let (config, added) = self
            .commit_with_retry(|config| {
                let mut requests = request.new_node_requests.clone();
                let mut allocated = allocate_indices(config, requests.len());
                for req in &mut requests {
                    if req.new_config.node_index == ANY_NODE_IDX {
                        req.new_config.node_index =
                            allocated.pop_front().expect("allocated one per request") as i32;
                    }
                }

                validate_add_requests(&requests, config)?;

                let mut update = NodesConfigurationUpdate::default();
                let mut seq_update =
                    SequencerMembershipUpdate::new(config.sequencer_membership.version);
                let mut storage_update =
                    StorageMembershipUpdate::new(config.storage_membership.version);
                for req in &requests {
                    let cfg = &req.new_config;
                    let idx = cfg.node_index as NodeIndex;
                    update.service_discovery.push(ServiceDiscoveryUpdate::Add {
                        node: idx,
                        discovery: Box::new(discovery_from_config(cfg)?),
                    });
                    if cfg.roles.sequencer {
                        let weight = cfg.sequencer.as_ref().map(|s| s.weight).unwrap_or(1.0);
                        seq_update.add_node(
                            idx,
                            SequencerNodeUpdate::Add {
                                weight,
                                enabled: false,
                            },
                        );
                    }
                    if cfg.roles.storage {
                        let storage =
                            cfg.storage.as_ref().expect("validated storage config");
                        update
                            .storage_attributes
                            .push(StorageAttributesUpdate::Set {
                                node: idx,
                                attributes: StorageAttributes::new(
                                    storage.capacity,
                                    storage.num_shards,
                                ),
                            });
                        for shard in 0..storage.num_shards {
                            storage_update.add_shard(
                                ShardId::new(idx, shard),
                                StorageStateTransition::ProvisionShard,
                            );
                        }
                    }
                }
                if !seq_update.is_empty() {
                    update.sequencer_membership = Some(seq_update);
                }
                if !storage_update.is_empty() {
                    update.storage_membership = Some(storage_update);
                }
                Ok((update, requests.iter().map(|r| r.new_config.clone()).collect::<Vec<_>>()))
            })
            .await?;

        info!(
            added = added.len(),
            version = config.version,
            "added nodes to the configuration"
        );
        Ok(AddNodesResponse {
            added_nodes: added,
            new_nodes_configuration_version: config.version,
        })
    }

    pub async fn update_nodes(
        &self,
        request: UpdateNodesRequest,
    ) -> Result<UpdateNodesResponse, AdminError> {
        if request.node_requests.is_empty() {
            return Err(AdminError::InvalidRequest("no nodes to update".to_string()));
        }
        let (config, updated) = self
            .commit_with_retry(|config| {
                let mut failures = ClusterMembershipOperationFailed::default();
                for req in &request.node_requests {
                    if req.node_to_be_updated != req.new_config.node_index {
                        failures.push(
                            req.node_to_be_updated,
                            ClusterMembershipFailureReason::InvalidRequestNodesConfig,
                            format!(
                                "node_to_be_updated ({}) differs from new_config.node_index ({})",
                                req.node_to_be_updated, req.new_config.node_index
                            ),
                        );
                        continue;
                    }
                    if req.node_to_be_updated < 0
                        || !config.has_node(req.node_to_be_updated as NodeIndex)
                    {
                        failures.push(
                            req.node_to_be_updated,
                            ClusterMembershipFailureReason::NoMatchInConfig,
                            format!("N{} is not in the configuration", req.node_to_be_updated),
                        );
                    }
                }
                if !failures.is_empty() {
                    return Err(AdminError::OperationFailed(failures));
                }

                let mut update = NodesConfigurationUpdate::default();
                for req in &request.node_requests {
                    let cfg = &req.new_config;
                    let idx = cfg.node_index as NodeIndex;
                    update
                        .service_discovery
                        .push(ServiceDiscoveryUpdate::Update {
                            node: idx,
                            discovery: Box::new(discovery_from_config(cfg)?),
                        });
                    if let Some(storage) = &cfg.storage {
                        let mut attributes =
                            StorageAttributes::new(storage.capacity, storage.num_shards);
                        if let Some(current) = config.storage_attributes(idx) {
                            attributes.generation = current.generation;
                            attributes.exclude_from_nodesets = current.exclude_from_nodesets;
                        }
                        update
                            .storage_attributes
                            .push(StorageAttributesUpdate::Set {
                                node: idx,
                                attributes,
                            });
                    }
                }
                Ok((
                    update,
                    request
                        .node_requests
                        .iter()
                        .map(|r| r.new_config.clone())
                        .collect(),
                ))
            })
            .await?;

        Ok(UpdateNodesResponse {
            updated_nodes: updated,
            new_nodes_configuration_version: config.version,
        })
    }

    pub async fn remove_nodes(
        &self,
        request: RemoveNodesRequest,
    ) -> Result<RemoveNodesResponse, AdminError> {
        let detector = self.detector.clone();
        let (config, removed) = self
            .commit_with_retry(|config| {
                let matched = resolve_filters(config, &request.node_filters);

                let mut failures = ClusterMembershipOperationFailed::default();
                for idx in &matched {
                    // A node only leaves the configuration once failure
                    // detection agrees it is gone...
                    if detector.peer_state(*idx) != PeerState::Dead {
                        failures.push(
                            *idx as i32,
                            ClusterMembershipFailureReason::NotDead,
                            format!("N{} is still alive", idx),
                        );
                        continue;
                    }
                    // ... and all of its shards are empty and its
                    // sequencer is disabled.
                    let drained = config.storage_membership.is_node_drained(*idx);
                    let sequencer_enabled = config.sequencer_membership.is_enabled(*idx);
                    if !drained || sequencer_enabled {
                        failures.push(
                            *idx as i32,
                            ClusterMembershipFailureReason::NotDisabled,
                            format!("N{} still has enabled shards or sequencer", idx),
                        );
                    }
                }
                if !failures.is_empty() {
                    return Err(AdminError::OperationFailed(failures));
                }
                if matched.is_empty() {
                    // Filters matching nothing is not an error; there
                    // is just nothing to do.
                    return Ok((NodesConfigurationUpdate::default(), Vec::new()));
                }

                let mut update = NodesConfigurationUpdate::default();
                let mut seq_update =
                    SequencerMembershipUpdate::new(config.sequencer_membership.version);
                let mut storage_update =
                    StorageMembershipUpdate::new(config.storage_membership.version);
                for idx in &matched {
                    for (shard, _) in config.storage_membership.shard_states(*idx) {
                        storage_update.add_shard(
                            ShardId::new(*idx, shard),
                            StorageStateTransition::RemoveEmptyShard,
                        );
                    }
                    if config.sequencer_membership.has_node(*idx) {
                        seq_update.add_node(*idx, SequencerNodeUpdate::Remove);
                    }
                    if config.storage_attributes(*idx).is_some() {
                        update
                            .storage_attributes
                            .push(StorageAttributesUpdate::Remove { node: *idx });
                    }
                    update
                        .service_discovery
                        .push(ServiceDiscoveryUpdate::Remove { node: *idx });
                }
                if !seq_update.is_empty() {
                    update.sequencer_membership = Some(seq_update);
                }
                if !storage_update.is_empty() {
                    update.storage_membership = Some(storage_update);
                }
                Ok((update, matched))
            })
            .await?;

        info!(removed = ?removed, "removed nodes from the configuration");
        Ok(RemoveNodesResponse {
            removed_nodes: removed,
            new_nodes_configuration_version: config.version,
        })
    }

    pub async fn mark_shards_as_provisioned(
        &self,
        request: MarkShardsAsProvisionedRequest,
    ) -> Result<MarkShardsAsProvisionedResponse, AdminError> {
        let (config, updated) = self
            .commit_with_retry(|config| {
                let mut targets: BTreeSet<ShardId> = BTreeSet::new();
                for selector in &request.shards {
                    if selector.shard_index < 0 {
                        // All shards of the node.
                        for (shard, _) in
                            config.storage_membership.shard_states(selector.node_index)
                        {
                            targets.insert(ShardId::new(selector.node_index, shard));
                        }
                    } else {
                        targets.insert(ShardId::new(
                            selector.node_index,
                            selector.shard_index as u16,
                        ));
                    }
                }

                // Only shards actually in PROVISIONING move; the rest
                // are already past it, which keeps the call idempotent.
                let provisioning: Vec<ShardId> = targets
                    .into_iter()
                    .filter(|shard| {
                        config
                            .storage_membership
                            .shard_state(*shard)
                            .is_some_and(|s| s.storage_state == StorageState::Provisioning)
                    })
                    .collect();

                if provisioning.is_empty() {
                    return Ok((NodesConfigurationUpdate::default(), Vec::new()));
                }

                let mut storage_update =
                    StorageMembershipUpdate::new(config.storage_membership.version);
                for shard in &provisioning {
                    storage_update
                        .add_shard(*shard, StorageStateTransition::MarkShardProvisioned);
                }
                let update = NodesConfigurationUpdate {
                    storage_membership: Some(storage_update),
                    ..Default::default()
                };
                Ok((update, provisioning))
            })
            .await?;

        Ok(MarkShardsAsProvisionedResponse {
            updated_shards: updated,
            new_nodes_configuration_version: config.version,
        })
    }

    pub async fn bump_node_generation(
        &self,
        request: BumpGenerationRequest,
    ) -> Result<BumpGenerationResponse, AdminError> {
        let (config, bumped) = self
            .commit_with_retry(|config| {
                let matched: Vec<NodeIndex> = resolve_filters(config, &request.node_filters)
                    .into_iter()
                    .filter(|idx| config.storage_attributes(*idx).is_some())
                    .collect();
                if matched.is_empty() {
                    return Ok((NodesConfigurationUpdate::default(), Vec::new()));
                }
                let update = NodesConfigurationUpdate {
                    storage_attributes: matched
                        .iter()
                        .map(|idx| StorageAttributesUpdate::BumpGeneration { node: *idx })
                        .collect(),
                    ..Default::default()
                };
                Ok((update, matched))
            })
            .await?;

        Ok(BumpGenerationResponse {
            bumped_nodes: bumped,
            new_nodes_configuration_version: config.version,
        })
    }

    pub async fn bootstrap_cluster(
        &self,
        request: BootstrapClusterRequest,
    ) -> Result<BootstrapClusterResponse, AdminError> {
        let property = parse_replication_property(&request.metadata_replication_property)?;

        let (config, _) = self
            .commit_with_retry(|config| {
                if config.is_bootstrapped() {
                    return Err(AdminError::AlreadyBootstrapped);
                }
                // The metadata replication factor must be satisfiable
                // by the storage nodes we are about to enable.
                let storage_nodes = config.storage_membership.node_indexes().len();
                if (property.replication_factor() as usize) > storage_nodes {
                    return Err(AdminError::InvalidRequest(format!(
                        "replication factor {} exceeds the {} storage node(s)",
                        property.replication_factor(),
                        storage_nodes
                    )));
                }

                let mut update = NodesConfigurationUpdate {
                    metadata_replication_property: Some(property.clone()),
                    finalize_bootstrapping: true,
                    ..Default::default()
                };

                // Every empty shard starts serving.
                let mut storage_update =
                    StorageMembershipUpdate::new(config.storage_membership.version);
                for (shard, state) in config.storage_membership.all_shards() {
                    if state.storage_state == StorageState::None {
                        storage_update
                            .add_shard(*shard, StorageStateTransition::BootstrapEnableShard);
                    }
                }
                if !storage_update.is_empty() {
                    update.storage_membership = Some(storage_update);
                }

                // Every sequencer node starts sequencing.
                let mut seq_update =
                    SequencerMembershipUpdate::new(config.sequencer_membership.version);
                for idx in config.sequencer_membership.member_indexes() {
                    seq_update.add_node(idx, SequencerNodeUpdate::SetEnabled(true));
                }
                if !seq_update.is_empty() {
                    update.sequencer_membership = Some(seq_update);
                }

                Ok((update, Vec::<NodeIndex>::new()))
            })
            .await?;

        info!(version = config.version, "cluster bootstrapped");
        Ok(BootstrapClusterResponse {
            new_nodes_configuration_version: config.version,
        })
    }

    pub fn get_nodes_config(&self, filter: &NodesFilter) -> GetNodesConfigResponse {
        let config = self.holder.get();
        let nodes = resolve_filters(&config, std::slice::from_ref(filter))
            .into_iter()
            .filter_map(|idx| node_config_from_discovery(&config, idx))
            .collect();
        GetNodesConfigResponse {
            nodes,
            version: config.version,
        }
    }

    pub fn get_nodes_state(&self, filter: &NodesFilter) -> GetNodesStateResponse {
        let config = self.holder.get();
        let states = resolve_filters(&config, std::slice::from_ref(filter))
            .into_iter()
            .map(|idx| {
                let shards = config
                    .storage_membership
                    .shard_states(idx)
                    .into_iter()
                    .map(|(shard, state)| ShardStateInfo {
                        shard: ShardId::new(idx, shard),
                        storage_state: state.storage_state.to_string(),
                        metadata_state: format!("{:?}", state.metadata_state),
                    })
                    .collect();
                NodeStateInfo {
                    node_index: idx,
                    peer_state: self.detector.peer_state(idx),
                    generation: config.node_generation(idx).unwrap_or(1),
                    sequencer_enabled: config
                        .sequencer_membership
                        .node_state(idx)
                        .map(|s| s.enabled),
                    shards,
                }
            })
            .collect();
        GetNodesStateResponse {
            states,
            version: config.version,
        }
    }

    // ---------------------------------------------------------------
    // Optimistic commit
    // ---------------------------------------------------------------

    /// Build-and-commit loop. `build` sees the freshest snapshot on
    /// every attempt and returns the update plus the value to hand back
    /// on success. An empty update commits nothing and returns the
    /// current configuration unchanged.
    async fn commit_with_retry<T, F>(
        &self,
        mut build: F,
    ) -> Result<(Arc<NodesConfiguration>, T), AdminError>
    where
        F: FnMut(&NodesConfiguration) -> Result<(NodesConfigurationUpdate, T), AdminError>,
    {
        for _attempt in 0..MAX_COMMIT_ATTEMPTS {
            let config = self.holder.get();
            let (update, result) = build(&config)?;
            if update.is_empty() {
                return Ok((config, result));
            }

            let new_config = config.apply_update(&update).map_err(|e| {
                AdminError::NodesConfigurationManager {
                    status: e.status(),
                    message: e.to_string(),
                }
            })?;
            let serialized = codec::serialize(&new_config)
                .map_err(|e| AdminError::NodesConfigurationManager {
                    status: e.status(),
                    message: e.to_string(),
                })?;

            match self
                .store
                .update_config(serialized, config.version)
                .await
                .map_err(AdminError::Store)?
            {
                UpdateOutcome::Ok { .. } => {
                    let arc = Arc::new(new_config);
                    self.holder.update(arc.clone());
                    return Ok((arc, result));
                }
                UpdateOutcome::VersionMismatch { current } => {
                    warn!("version mismatch committing admin update; refreshing");
                    let blob = match current {
                        Some(blob) => blob,
                        None => self.store.get_config().await.map_err(AdminError::Store)?,
                    };
                    let fresh = codec::deserialize(&blob).map_err(|e| {
                        AdminError::NodesConfigurationManager {
                            status: e.status(),
                            message: e.to_string(),
                        }
                    })?;
                    self.holder.update(Arc::new(fresh));
                }
            }
        }
        Err(AdminError::Store(seqlog_core::Status::VersionMismatch))
    }
}

// -------------------------------------------------------------------
// Helpers
// -------------------------------------------------------------------

fn allocate_indices(config: &NodesConfiguration, count: usize) -> VecDeque<NodeIndex> {
    let mut out = VecDeque::with_capacity(count);
    let mut candidate: NodeIndex = 0;
    while out.len() < count {
        if !config.has_node(candidate) {
            out.push_back(candidate);
        }
        candidate += 1;
    }
    out
}

fn validate_add_requests(
    requests: &[AddSingleNodeRequest],
    config: &NodesConfiguration,
) -> Result<(), AdminError> {
    let mut failures = ClusterMembershipOperationFailed::default();

    let mut seen_indexes: HashSet<i32> = HashSet::new();
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut seen_addresses: HashSet<String> = HashSet::new();
    for (_, sd) in config.all_service_discovery() {
        seen_names.insert(sd.name.clone());
        seen_addresses.insert(sd.data_address.to_string());
    }

    for req in requests {
        let cfg = &req.new_config;
        let idx = cfg.node_index;

        if idx < 0 {
            failures.push(
                idx,
                ClusterMembershipFailureReason::InvalidRequestNodesConfig,
                "node index was not resolved".to_string(),
            );
            continue;
        }
        if cfg.roles.is_empty() {
            failures.push(
                idx,
                ClusterMembershipFailureReason::InvalidRequestNodesConfig,
                format!("N{} has no roles", idx),
            );
            continue;
        }
        if cfg.roles.storage && cfg.storage.is_none() {
            failures.push(
                idx,
                ClusterMembershipFailureReason::InvalidRequestNodesConfig,
                format!("N{} has the storage role but no storage config", idx),
            );
            continue;
        }
        if cfg.location.is_some()
            && cfg
                .location
                .as_deref()
                .unwrap_or_default()
                .parse::<seqlog_core::NodeLocation>()
                .is_err()
        {
            failures.push(
                idx,
                ClusterMembershipFailureReason::InvalidRequestNodesConfig,
                format!("N{} has a malformed location", idx),
            );
            continue;
        }

        if config.has_node(idx as NodeIndex) || !seen_indexes.insert(idx) {
            failures.push(
                idx,
                ClusterMembershipFailureReason::AlreadyExists,
                format!("N{} already exists", idx),
            );
            continue;
        }
        if !seen_names.insert(cfg.name.clone()) {
            failures.push(
                idx,
                ClusterMembershipFailureReason::AlreadyExists,
                format!("N{} has a duplicate name '{}'", idx, cfg.name),
            );
            continue;
        }
        if !seen_addresses.insert(cfg.data_address.to_string()) {
            failures.push(
                idx,
                ClusterMembershipFailureReason::AlreadyExists,
                format!("N{} has a duplicate address '{}'", idx, cfg.data_address),
            );
            continue;
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(AdminError::OperationFailed(failures))
    }
}

fn discovery_from_config(cfg: &NodeConfig) -> Result<NodeServiceDiscovery, AdminError> {
    let location = match &cfg.location {
        Some(path) => Some(path.parse().map_err(|_| {
            AdminError::InvalidRequest(format!("malformed location '{}'", path))
        })?),
        None => None,
    };
    Ok(NodeServiceDiscovery {
        name: cfg.name.clone(),
        version: None,
        data_address: cfg.data_address.clone(),
        gossip_address: cfg.gossip_address.clone(),
        ssl_address: cfg.ssl_address.clone(),
        admin_address: cfg.admin_address.clone(),
        server_to_server_address: cfg.server_to_server_address.clone(),
        server_rpc_address: None,
        client_rpc_address: None,
        addresses_per_priority: Default::default(),
        location,
        roles: cfg.roles,
        tags: cfg.tags.clone(),
    })
}

fn node_config_from_discovery(config: &NodesConfiguration, idx: NodeIndex) -> Option<NodeConfig> {
    let sd = config.service_discovery(idx)?;
    Some(NodeConfig {
        node_index: idx as i32,
        name: sd.name.clone(),
        data_address: sd.data_address.clone(),
        gossip_address: sd.gossip_address.clone(),
        ssl_address: sd.ssl_address.clone(),
        admin_address: sd.admin_address.clone(),
        server_to_server_address: sd.server_to_server_address.clone(),
        location: sd.location.as_ref().map(|l| l.to_string()),
        roles: sd.roles,
        sequencer: config
            .sequencer_membership
            .node_state(idx)
            .map(|s| SequencerConfig { weight: s.weight }),
        storage: config.storage_attributes(idx).map(|a| StorageConfig {
            capacity: a.capacity,
            num_shards: a.num_shards,
        }),
        tags: sd.tags.clone(),
    })
}

/// Union of nodes matched by the filters; an empty filter list or an
/// all-default filter matches everything.
fn resolve_filters(config: &NodesConfiguration, filters: &[NodesFilter]) -> Vec<NodeIndex> {
    let mut matched: BTreeSet<NodeIndex> = BTreeSet::new();
    for filter in filters {
        for (idx, sd) in config.all_service_discovery() {
            if let Some(indexes) = &filter.node_indexes {
                if !indexes.contains(idx) {
                    continue;
                }
            }
            if let Some(name) = &filter.name {
                if &sd.name != name {
                    continue;
                }
            }
            if let Some(prefix) = &filter.location_prefix {
                let location = sd.location.as_ref().map(|l| l.to_string()).unwrap_or_default();
                if !location.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            matched.insert(*idx);
        }
    }
    matched.into_iter().collect()
}

fn parse_replication_property(
    raw: &std::collections::BTreeMap<String, u8>,
) -> Result<ReplicationProperty, AdminError> {
    if raw.is_empty() {
        return Err(AdminError::InvalidRequest(
            "empty replication property".to_string(),
        ));
    }
    let mut property = ReplicationProperty::new();
    for (scope_name, factor) in raw {
        let scope = match scope_name.to_ascii_lowercase().as_str() {
            "node" => LocationScope::Node,
            "rack" => LocationScope::Rack,
            "row" => LocationScope::Row,
            "cluster" => LocationScope::Cluster,
            "datacenter" | "dc" => LocationScope::DataCenter,
            "region" => LocationScope::Region,
            "root" => LocationScope::Root,
            other => {
                return Err(AdminError::InvalidRequest(format!(
                    "unknown location scope '{}'",
                    other
                )))
            }
        };
        property.set_factor(scope, *factor).map_err(|e| {
            AdminError::InvalidRequest(e.to_string())
        })?;
    }
    Ok(property)
}
