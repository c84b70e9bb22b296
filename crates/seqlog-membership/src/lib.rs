//! SeqLog Membership - The Nodes Configuration
//!
//! Cluster membership is a single versioned, immutable value: the
//! `NodesConfiguration`. It says which nodes exist (service discovery),
//! which may run sequencers (sequencer membership), which store data and
//! in what per-shard state (storage membership), and how metadata is
//! replicated.
//!
//! All mutation goes through `NodesConfiguration::apply_update`, which
//! either returns a brand new configuration with `version + 1` or an
//! error with no side effects. Durability and cross-node agreement come
//! from a `VersionedConfigStore` with compare-and-swap semantics;
//! version mismatches are resolved by refreshing the local snapshot and
//! rebuilding the update.
//!
//! The `NodeRegistrationHandler` is the path a starting server uses to
//! insert or refresh its own entry, built from its `ServerSettings`.

pub mod codec;
pub mod error;
pub mod nodes_config;
pub mod property;
pub mod registration;
pub mod sequencer;
pub mod service_discovery;
pub mod settings;
pub mod storage;
pub mod store;

pub use error::{MembershipError, Result};
pub use nodes_config::{
    NodesConfiguration, NodesConfigurationUpdate, ServiceDiscoveryUpdate, StorageAttributes,
    StorageAttributesUpdate,
};
pub use property::ReplicationProperty;
pub use registration::{apply_to_store, NodeIndicesAllocator, NodeRegistrationHandler};
pub use sequencer::{SequencerMembership, SequencerMembershipUpdate, SequencerNodeState};
pub use service_discovery::{NetworkPriority, NodeServiceDiscovery, RoleSet, SocketAddress};
pub use settings::ServerSettings;
pub use storage::{
    shard_flags, MetaDataStorageState, ShardState, StorageMembership, StorageMembershipUpdate,
    StorageState, StorageStateTransition,
};
pub use store::{
    ConfigSource, InMemoryConfigStore, UpdatableNodesConfiguration, UpdateOutcome,
    VersionedConfigStore,
};
