//! The Nodes Configuration
//!
//! One immutable value describing the whole cluster: service discovery,
//! storage attributes, sequencer membership, storage membership and the
//! metadata replication property, all under a single strictly-monotonic
//! version.
//!
//! `apply_update` is all-or-nothing: a single `NodesConfigurationUpdate`
//! may carry changes for every section, and if any one of them fails
//! validation the whole update is rejected with the first error and the
//! original value is untouched. On success the returned configuration
//! has `version = old.version + 1` and a fresh change timestamp.

use std::collections::BTreeMap;

use seqlog_core::{Generation, NodeId, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MembershipError, Result};
use crate::property::ReplicationProperty;
use crate::sequencer::{SequencerMembership, SequencerMembershipUpdate};
use crate::service_discovery::NodeServiceDiscovery;
use crate::storage::{StorageMembership, StorageMembershipUpdate};

/// Slow-changing per-node storage attributes, separate from the
/// per-shard membership state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageAttributes {
    /// Bumped when a node slot is re-occupied, so peers can tell a new
    /// occupant from the previous one.
    pub generation: Generation,
    /// Relative storage capacity used by placement.
    pub capacity: f64,
    pub num_shards: u16,
    pub exclude_from_nodesets: bool,
}

impl StorageAttributes {
    pub fn new(capacity: f64, num_shards: u16) -> Self {
        Self {
            generation: 1,
            capacity,
            num_shards,
            exclude_from_nodesets: false,
        }
    }
}

/// Service discovery changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceDiscoveryUpdate {
    Add {
        node: NodeIndex,
        discovery: Box<NodeServiceDiscovery>,
    },
    Update {
        node: NodeIndex,
        discovery: Box<NodeServiceDiscovery>,
    },
    Remove {
        node: NodeIndex,
    },
}

/// Storage attribute changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageAttributesUpdate {
    Set {
        node: NodeIndex,
        attributes: StorageAttributes,
    },
    BumpGeneration {
        node: NodeIndex,
    },
    Remove {
        node: NodeIndex,
    },
}

/// One atomic configuration change. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodesConfigurationUpdate {
    pub service_discovery: Vec<ServiceDiscoveryUpdate>,
    pub storage_attributes: Vec<StorageAttributesUpdate>,
    pub sequencer_membership: Option<SequencerMembershipUpdate>,
    pub storage_membership: Option<StorageMembershipUpdate>,
    pub metadata_replication_property: Option<ReplicationProperty>,
    /// Clears the bootstrapping flag on both memberships. Legal only
    /// while both are still bootstrapping.
    pub finalize_bootstrapping: bool,
}

impl NodesConfigurationUpdate {
    pub fn is_empty(&self) -> bool {
        self.service_discovery.is_empty()
            && self.storage_attributes.is_empty()
            && self.sequencer_membership.is_none()
            && self.storage_membership.is_none()
            && self.metadata_replication_property.is_none()
            && !self.finalize_bootstrapping
    }
}

/// The versioned cluster membership snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodesConfiguration {
    pub version: u64,
    /// Milliseconds since the epoch of the last successful update.
    pub last_change_timestamp: i64,
    service_discovery: BTreeMap<NodeIndex, NodeServiceDiscovery>,
    storage_attributes: BTreeMap<NodeIndex, StorageAttributes>,
    pub sequencer_membership: SequencerMembership,
    pub storage_membership: StorageMembership,
    pub metadata_replication_property: ReplicationProperty,
}

impl NodesConfiguration {
    /// Empty configuration of a cluster that is still being assembled.
    pub fn new_bootstrapping() -> Self {
        Self {
            version: 0,
            last_change_timestamp: 0,
            service_discovery: BTreeMap::new(),
            storage_attributes: BTreeMap::new(),
            sequencer_membership: SequencerMembership::new_bootstrapping(),
            storage_membership: StorageMembership::new_bootstrapping(),
            metadata_replication_property: ReplicationProperty::new(),
        }
    }

    pub fn service_discovery(&self, node: NodeIndex) -> Option<&NodeServiceDiscovery> {
        self.service_discovery.get(&node)
    }

    pub fn all_service_discovery(
        &self,
    ) -> impl Iterator<Item = (&NodeIndex, &NodeServiceDiscovery)> {
        self.service_discovery.iter()
    }

    pub fn storage_attributes(&self, node: NodeIndex) -> Option<&StorageAttributes> {
        self.storage_attributes.get(&node)
    }

    pub fn cluster_size(&self) -> usize {
        self.service_discovery.len()
    }

    pub fn has_node(&self, node: NodeIndex) -> bool {
        self.service_discovery.contains_key(&node)
    }

    /// Generation-qualified id of a node, or `None` when it is not in
    /// the configuration. Nodes without storage attributes have
    /// generation 1.
    pub fn node_id(&self, node: NodeIndex) -> Option<NodeId> {
        if !self.has_node(node) {
            return None;
        }
        let generation = self
            .storage_attributes
            .get(&node)
            .map(|a| a.generation)
            .unwrap_or(1);
        Some(NodeId::new(node, generation))
    }

    pub fn node_generation(&self, node: NodeIndex) -> Option<Generation> {
        self.node_id(node).map(|id| id.generation)
    }

    /// Both memberships still bootstrapping.
    pub fn is_bootstrapping(&self) -> bool {
        self.sequencer_membership.bootstrapping && self.storage_membership.bootstrapping
    }

    /// Neither membership bootstrapping; the finalize update ran.
    pub fn is_bootstrapped(&self) -> bool {
        !self.sequencer_membership.bootstrapping && !self.storage_membership.bootstrapping
    }

    pub fn max_node_index(&self) -> Option<NodeIndex> {
        self.service_discovery.keys().next_back().copied()
    }

    /// Apply an update, producing the next configuration value.
    pub fn apply_update(&self, update: &NodesConfigurationUpdate) -> Result<NodesConfiguration> {
        if update.is_empty() {
            return Err(MembershipError::Uptodate);
        }

        let mut next = self.clone();

        if let Some(seq_update) = &update.sequencer_membership {
            next.sequencer_membership = next.sequencer_membership.apply_update(seq_update)?;
        }
        if let Some(storage_update) = &update.storage_membership {
            next.storage_membership = next.storage_membership.apply_update(storage_update)?;
        }
        if let Some(property) = &update.metadata_replication_property {
            if property.is_empty() {
                return Err(MembershipError::InvalidParam(
                    "empty metadata replication property".to_string(),
                ));
            }
            next.metadata_replication_property = property.clone();
        }
        for attr_update in &update.storage_attributes {
            next.apply_storage_attributes_update(attr_update)?;
        }
        for sd_update in &update.service_discovery {
            next.apply_service_discovery_update(sd_update)?;
        }
        if update.finalize_bootstrapping {
            if !next.sequencer_membership.bootstrapping || !next.storage_membership.bootstrapping {
                return Err(MembershipError::InvalidParam(
                    "cluster is not bootstrapping".to_string(),
                ));
            }
            next.sequencer_membership.bootstrapping = false;
            next.storage_membership.bootstrapping = false;
        }

        next.validate()?;
        next.version = self.version + 1;
        next.last_change_timestamp = chrono::Utc::now().timestamp_millis();
        info!(
            version = next.version,
            nodes = next.cluster_size(),
            "nodes configuration updated"
        );
        Ok(next)
    }

    fn apply_service_discovery_update(&mut self, update: &ServiceDiscoveryUpdate) -> Result<()> {
        match update {
            ServiceDiscoveryUpdate::Add { node, discovery } => {
                if self.service_discovery.contains_key(node) {
                    return Err(MembershipError::AlreadyExists(format!("N{}", node)));
                }
                if discovery.roles.is_empty() {
                    return Err(MembershipError::InvalidParam(format!(
                        "N{} has no roles",
                        node
                    )));
                }
                self.service_discovery.insert(*node, (**discovery).clone());
                Ok(())
            }
            ServiceDiscoveryUpdate::Update { node, discovery } => {
                let current = self.service_discovery.get(node).ok_or_else(|| {
                    MembershipError::NoMatchInConfig(format!("N{}", node))
                })?;
                // Location is the one immutable attribute: placement
                // decisions already made depend on it.
                if current.location != discovery.location {
                    return Err(MembershipError::InvalidParam(format!(
                        "N{}: location cannot change",
                        node
                    )));
                }
                self.service_discovery.insert(*node, (**discovery).clone());
                Ok(())
            }
            ServiceDiscoveryUpdate::Remove { node } => {
                if self.service_discovery.remove(node).is_none() {
                    return Err(MembershipError::NoMatchInConfig(format!("N{}", node)));
                }
                Ok(())
            }
        }
    }

    fn apply_storage_attributes_update(&mut self, update: &StorageAttributesUpdate) -> Result<()> {
        match update {
            StorageAttributesUpdate::Set { node, attributes } => {
                if attributes.num_shards == 0 {
                    return Err(MembershipError::InvalidParam(format!(
                        "N{}: storage node needs at least one shard",
                        node
                    )));
                }
                self.storage_attributes.insert(*node, attributes.clone());
                Ok(())
            }
            StorageAttributesUpdate::BumpGeneration { node } => {
                let attrs = self.storage_attributes.get_mut(node).ok_or_else(|| {
                    MembershipError::NoMatchInConfig(format!("N{}", node))
                })?;
                attrs.generation += 1;
                Ok(())
            }
            StorageAttributesUpdate::Remove { node } => {
                if self.storage_attributes.remove(node).is_none() {
                    return Err(MembershipError::NoMatchInConfig(format!("N{}", node)));
                }
                Ok(())
            }
        }
    }

    /// Cross-section consistency: every membership member must have
    /// service discovery, and storage members need storage attributes.
    fn validate(&self) -> Result<()> {
        for node in self.sequencer_membership.member_indexes() {
            if !self.service_discovery.contains_key(&node) {
                return Err(MembershipError::InvalidParam(format!(
                    "sequencer member N{} has no service discovery",
                    node
                )));
            }
        }
        for node in self.storage_membership.node_indexes() {
            if !self.service_discovery.contains_key(&node) {
                return Err(MembershipError::InvalidParam(format!(
                    "storage member N{} has no service discovery",
                    node
                )));
            }
            if !self.storage_attributes.contains_key(&node) {
                return Err(MembershipError::InvalidParam(format!(
                    "storage member N{} has no storage attributes",
                    node
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::SequencerNodeUpdate;
    use crate::service_discovery::{RoleSet, SocketAddress};
    use crate::storage::StorageStateTransition;
    use seqlog_core::ShardId;

    fn discovery(name: &str, port: u16) -> NodeServiceDiscovery {
        NodeServiceDiscovery {
            name: name.to_string(),
            version: None,
            data_address: SocketAddress::tcp("10.0.0.1", port),
            gossip_address: None,
            ssl_address: None,
            admin_address: None,
            server_to_server_address: None,
            server_rpc_address: None,
            client_rpc_address: None,
            addresses_per_priority: BTreeMap::new(),
            location: None,
            roles: RoleSet::both(),
            tags: BTreeMap::new(),
        }
    }

    fn add_node_update(nc: &NodesConfiguration, node: NodeIndex) -> NodesConfigurationUpdate {
        let mut update = NodesConfigurationUpdate {
            service_discovery: vec![ServiceDiscoveryUpdate::Add {
                node,
                discovery: Box::new(discovery(&format!("node{}", node), 4440 + node)),
            }],
            storage_attributes: vec![StorageAttributesUpdate::Set {
                node,
                attributes: StorageAttributes::new(1.0, 2),
            }],
            ..Default::default()
        };
        let mut seq = SequencerMembershipUpdate::new(nc.sequencer_membership.version);
        seq.add_node(
            node,
            SequencerNodeUpdate::Add {
                weight: 1.0,
                enabled: false,
            },
        );
        update.sequencer_membership = Some(seq);
        let mut storage = StorageMembershipUpdate::new(nc.storage_membership.version);
        for shard in 0..2 {
            storage.add_shard(
                ShardId::new(node, shard),
                StorageStateTransition::ProvisionShard,
            );
        }
        update.storage_membership = Some(storage);
        update
    }

    #[test]
    fn test_version_increments_by_one() {
        let nc = NodesConfiguration::new_bootstrapping();
        let nc1 = nc.apply_update(&add_node_update(&nc, 0)).unwrap();
        assert_eq!(nc1.version, 1);
        assert_eq!(nc1.cluster_size(), 1);
        let nc2 = nc1.apply_update(&add_node_update(&nc1, 1)).unwrap();
        assert_eq!(nc2.version, 2);
    }

    #[test]
    fn test_empty_update_is_uptodate() {
        let nc = NodesConfiguration::new_bootstrapping();
        let err = nc
            .apply_update(&NodesConfigurationUpdate::default())
            .unwrap_err();
        assert!(matches!(err, MembershipError::Uptodate));
    }

    #[test]
    fn test_failed_update_leaves_original_untouched() {
        let nc = NodesConfiguration::new_bootstrapping();
        let nc = nc.apply_update(&add_node_update(&nc, 0)).unwrap();
        let before = nc.clone();

        // Adding the same node again fails on service discovery.
        let err = nc.apply_update(&add_node_update(&nc, 0)).unwrap_err();
        assert!(matches!(
            err,
            MembershipError::AlreadyExists(_) | MembershipError::VersionMismatch { .. }
        ));
        assert_eq!(nc, before);
    }

    #[test]
    fn test_location_is_immutable() {
        let nc = NodesConfiguration::new_bootstrapping();
        let nc = nc.apply_update(&add_node_update(&nc, 0)).unwrap();

        let mut changed = discovery("node0", 4440);
        changed.location = Some("r1.d1".parse().unwrap());
        let update = NodesConfigurationUpdate {
            service_discovery: vec![ServiceDiscoveryUpdate::Update {
                node: 0,
                discovery: Box::new(changed),
            }],
            ..Default::default()
        };
        let err = nc.apply_update(&update).unwrap_err();
        assert!(matches!(err, MembershipError::InvalidParam(_)));
    }

    #[test]
    fn test_bump_generation() {
        let nc = NodesConfiguration::new_bootstrapping();
        let nc = nc.apply_update(&add_node_update(&nc, 0)).unwrap();
        let nc = nc.apply_update(&add_node_update(&nc, 1)).unwrap();
        assert_eq!(nc.node_generation(0), Some(1));

        let update = NodesConfigurationUpdate {
            storage_attributes: vec![StorageAttributesUpdate::BumpGeneration { node: 0 }],
            ..Default::default()
        };
        let bumped = nc.apply_update(&update).unwrap();
        assert_eq!(bumped.node_generation(0), Some(2));
        // No other node's generation moves.
        assert_eq!(bumped.node_generation(1), Some(1));
    }

    #[test]
    fn test_membership_member_requires_service_discovery() {
        let nc = NodesConfiguration::new_bootstrapping();
        let mut seq = SequencerMembershipUpdate::new(0);
        seq.add_node(
            9,
            SequencerNodeUpdate::Add {
                weight: 1.0,
                enabled: true,
            },
        );
        let update = NodesConfigurationUpdate {
            sequencer_membership: Some(seq),
            ..Default::default()
        };
        let err = nc.apply_update(&update).unwrap_err();
        assert!(matches!(err, MembershipError::InvalidParam(_)));
    }

    #[test]
    fn test_finalize_bootstrapping_once() {
        let nc = NodesConfiguration::new_bootstrapping();
        let nc = nc.apply_update(&add_node_update(&nc, 0)).unwrap();
        assert!(nc.is_bootstrapping());

        let update = NodesConfigurationUpdate {
            finalize_bootstrapping: true,
            ..Default::default()
        };
        let nc = nc.apply_update(&update).unwrap();
        assert!(nc.is_bootstrapped());

        let err = nc.apply_update(&update).unwrap_err();
        assert!(matches!(err, MembershipError::InvalidParam(_)));
    }
}
