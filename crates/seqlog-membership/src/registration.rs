//! Node Self-Registration
//!
//! A starting server either inserts itself into the nodes configuration
//! (`register_self`, picking a free index from the allocator) or
//! refreshes its existing entry (`update_self`). Both build an update
//! from local `ServerSettings`, apply it to the current snapshot and
//! commit the result to the versioned store.
//!
//! Only `VersionMismatch` is retried: the handler installs the winner's
//! configuration into the local holder, rebuilds the update against it
//! and tries again, up to a bounded number of attempts with jittered
//! exponential backoff. Every other store status is returned to the
//! caller unchanged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use seqlog_core::{NodeIndex, Status};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::codec;
use crate::error::MembershipError;
use crate::nodes_config::{
    NodesConfiguration, NodesConfigurationUpdate, ServiceDiscoveryUpdate, StorageAttributes,
    StorageAttributesUpdate,
};
use crate::sequencer::{SequencerMembershipUpdate, SequencerNodeUpdate};
use crate::service_discovery::NodeServiceDiscovery;
use crate::settings::ServerSettings;
use crate::storage::{StorageMembershipUpdate, StorageStateTransition};
use crate::store::{UpdatableNodesConfiguration, UpdateOutcome, VersionedConfigStore};
use seqlog_core::ShardId;

const MAX_REGISTRATION_ATTEMPTS: usize = 10;
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const BACKOFF_JITTER: f64 = 0.25;

/// Hands out the lowest free node indices given current service
/// discovery. Indices freed by removed nodes are reused.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeIndicesAllocator;

impl NodeIndicesAllocator {
    pub fn allocate(&self, config: &NodesConfiguration, count: usize) -> VecDeque<NodeIndex> {
        let mut out = VecDeque::with_capacity(count);
        let mut candidate: NodeIndex = 0;
        while out.len() < count {
            if !config.has_node(candidate) {
                out.push_back(candidate);
            }
            candidate = candidate.checked_add(1).expect("node index space exhausted");
        }
        out
    }
}

pub struct NodeRegistrationHandler {
    settings: ServerSettings,
    holder: Arc<UpdatableNodesConfiguration>,
    store: Arc<dyn VersionedConfigStore>,
}

impl NodeRegistrationHandler {
    pub fn new(
        settings: ServerSettings,
        holder: Arc<UpdatableNodesConfiguration>,
        store: Arc<dyn VersionedConfigStore>,
    ) -> Self {
        Self {
            settings,
            holder,
            store,
        }
    }

    /// Insert this node into the configuration and return the index it
    /// got. Retries with a freshly allocated index after each version
    /// mismatch, since the collision may have been another node taking
    /// the same slot.
    pub async fn register_self(
        &self,
        allocator: NodeIndicesAllocator,
    ) -> Result<NodeIndex, Status> {
        let mut last_status = Status::Internal;
        for attempt in 0..MAX_REGISTRATION_ATTEMPTS {
            let config = self.holder.get();
            let my_idx = allocator
                .allocate(&config, 1)
                .pop_front()
                .expect("allocator returned no index");
            info!(node = my_idx, attempt, "registering in the nodes configuration");

            let update = self.build_self_update(&config, my_idx, false)?;
            match self.commit(&config, update).await {
                Ok(()) => return Ok(my_idx),
                Err(Status::VersionMismatch) => {
                    last_status = Status::VersionMismatch;
                    self.backoff(attempt).await;
                }
                Err(status) => return Err(status),
            }
        }
        Err(last_status)
    }

    /// Refresh this node's own entry at a known index.
    pub async fn update_self(&self, my_idx: NodeIndex) -> Result<(), Status> {
        let mut last_status = Status::Internal;
        for attempt in 0..MAX_REGISTRATION_ATTEMPTS {
            let config = self.holder.get();
            info!(node = my_idx, attempt, "updating own nodes configuration entry");

            let update = self.build_self_update(&config, my_idx, true)?;
            match self.commit(&config, update).await {
                Ok(()) => return Ok(()),
                Err(Status::VersionMismatch) => {
                    last_status = Status::VersionMismatch;
                    self.backoff(attempt).await;
                }
                Err(status) => return Err(status),
            }
        }
        Err(last_status)
    }

    fn build_self_update(
        &self,
        config: &NodesConfiguration,
        my_idx: NodeIndex,
        is_update: bool,
    ) -> Result<NodesConfigurationUpdate, Status> {
        let settings = &self.settings;
        let data_address = settings.data_address().ok_or(Status::InvalidParam)?;
        if settings.roles.is_empty() {
            return Err(Status::InvalidParam);
        }
        if settings.roles.storage && settings.num_shards == 0 {
            return Err(Status::InvalidParam);
        }

        let discovery = NodeServiceDiscovery {
            name: settings.name.clone(),
            version: settings.version,
            data_address,
            gossip_address: settings.gossip_address(),
            ssl_address: settings.ssl_address(),
            admin_address: settings.admin_address(),
            server_to_server_address: settings.server_to_server_address(),
            server_rpc_address: settings.server_rpc_address(),
            client_rpc_address: settings.client_rpc_address(),
            addresses_per_priority: settings.addresses_per_priority(),
            location: settings.location.clone(),
            roles: settings.roles,
            tags: settings.tags.clone(),
        };

        let mut update = NodesConfigurationUpdate::default();
        if is_update {
            if !config.has_node(my_idx) {
                return Err(Status::NoMatchInConfig);
            }
            update.service_discovery.push(ServiceDiscoveryUpdate::Update {
                node: my_idx,
                discovery: Box::new(discovery),
            });
            // Membership state stays as-is on a self-update; only the
            // static attributes may move.
            if settings.roles.storage {
                let mut attributes = StorageAttributes::new(
                    settings.storage_capacity,
                    settings.num_shards,
                );
                if let Some(current) = config.storage_attributes(my_idx) {
                    attributes.generation = current.generation;
                    attributes.exclude_from_nodesets = current.exclude_from_nodesets;
                }
                update
                    .storage_attributes
                    .push(StorageAttributesUpdate::Set {
                        node: my_idx,
                        attributes,
                    });
            }
        } else {
            update.service_discovery.push(ServiceDiscoveryUpdate::Add {
                node: my_idx,
                discovery: Box::new(discovery),
            });
            if settings.roles.sequencer {
                let mut seq =
                    SequencerMembershipUpdate::new(config.sequencer_membership.version);
                seq.add_node(
                    my_idx,
                    SequencerNodeUpdate::Add {
                        weight: settings.sequencer_weight,
                        enabled: false,
                    },
                );
                update.sequencer_membership = Some(seq);
            }
            if settings.roles.storage {
                update
                    .storage_attributes
                    .push(StorageAttributesUpdate::Set {
                        node: my_idx,
                        attributes: StorageAttributes::new(
                            settings.storage_capacity,
                            settings.num_shards,
                        ),
                    });
                let mut storage = StorageMembershipUpdate::new(config.storage_membership.version);
                for shard in 0..settings.num_shards {
                    storage.add_shard(
                        ShardId::new(my_idx, shard),
                        StorageStateTransition::ProvisionShard,
                    );
                }
                update.storage_membership = Some(storage);
            }
        }
        Ok(update)
    }

    /// Apply locally, serialize, and compare-and-swap into the store.
    /// On a mismatch the fresh configuration is installed into the
    /// holder before `VersionMismatch` is returned for the retry loop.
    async fn commit(
        &self,
        config: &NodesConfiguration,
        update: NodesConfigurationUpdate,
    ) -> Result<(), Status> {
        if update.is_empty() {
            return Err(Status::Uptodate);
        }
        let new_config = config.apply_update(&update).map_err(|e| e.status())?;
        let serialized = codec::serialize(&new_config).map_err(|e| e.status())?;

        match self.store.update_config(serialized, config.version).await? {
            UpdateOutcome::Ok { new_version } => {
                debug_assert_eq!(new_version, new_config.version);
                self.holder.update(Arc::new(new_config));
                Ok(())
            }
            UpdateOutcome::VersionMismatch { current } => {
                let blob = match current {
                    Some(blob) => blob,
                    // The store did not hand back the winner; fetch it.
                    None => self.store.get_config().await?,
                };
                match codec::deserialize(&blob) {
                    Ok(fresh) => {
                        info!(
                            old_version = config.version,
                            new_version = fresh.version,
                            "refreshed nodes configuration after version mismatch"
                        );
                        self.holder.update(Arc::new(fresh));
                        Err(Status::VersionMismatch)
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to decode refreshed configuration");
                        Err(e.status())
                    }
                }
            }
        }
    }

    async fn backoff(&self, attempt: usize) {
        let base = BACKOFF_MIN.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = base.min(BACKOFF_MAX.as_millis() as f64);
        // +/- 25% jitter so colliding registrants spread out.
        let jitter = 1.0 - BACKOFF_JITTER + rand::random::<f64>() * 2.0 * BACKOFF_JITTER;
        sleep(Duration::from_millis((capped * jitter) as u64)).await;
    }
}

/// Shared apply-and-commit helper for callers (admin handlers) that
/// rebuild their update per attempt. `build` sees the latest snapshot
/// each try; only version mismatches are retried.
pub async fn apply_to_store<F>(
    holder: &UpdatableNodesConfiguration,
    store: &dyn VersionedConfigStore,
    mut build: F,
) -> Result<Arc<NodesConfiguration>, MembershipError>
where
    F: FnMut(&NodesConfiguration) -> Result<NodesConfigurationUpdate, MembershipError>,
{
    let mut attempt = 0;
    loop {
        let config = holder.get();
        let update = build(&config)?;
        let new_config = config.apply_update(&update)?;
        let serialized = codec::serialize(&new_config)?;

        match store
            .update_config(serialized, config.version)
            .await
            .map_err(MembershipError::Store)?
        {
            UpdateOutcome::Ok { .. } => {
                let arc = Arc::new(new_config);
                holder.update(arc.clone());
                return Ok(arc);
            }
            UpdateOutcome::VersionMismatch { current } => {
                attempt += 1;
                if attempt >= MAX_REGISTRATION_ATTEMPTS {
                    return Err(MembershipError::VersionMismatch {
                        base: config.version,
                        current: 0,
                    });
                }
                let blob = match current {
                    Some(blob) => blob,
                    None => store.get_config().await.map_err(MembershipError::Store)?,
                };
                let fresh = codec::deserialize(&blob)?;
                holder.update(Arc::new(fresh));
            }
        }
    }
}
