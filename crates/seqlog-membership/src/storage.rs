//! Storage Membership
//!
//! The dynamic, per-shard half of the storage configuration. Every
//! shard `(node, shard_index)` carries a storage state, a metadata
//! state, flags, and the membership version since which that state has
//! been effective.
//!
//! Storage states and what they permit:
//!
//! | state          | can write to | should read from |
//! |----------------|--------------|------------------|
//! | PROVISIONING   | no           | no               |
//! | NONE           | no           | no               |
//! | READ_ONLY      | no           | yes              |
//! | READ_WRITE     | yes          | yes              |
//! | DATA_MIGRATION | no           | yes              |
//! | DISABLED       | no           | no               |
//!
//! Transitions are named operations with a fixed source state; an update
//! naming a transition whose source doesn't match the shard's current
//! state is rejected and the whole membership update fails. Updates are
//! conditioned on the membership version they were computed against.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use seqlog_core::{NodeIndex, ShardId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MembershipError, Result};

/// Per-shard storage state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageState {
    /// Newly added, local storage health not yet acknowledged. Treated
    /// like NONE; the only exit is `MarkShardProvisioned`.
    Provisioning,
    /// Empty; not part of any copyset.
    None,
    /// Readable but closed to new writes.
    ReadOnly,
    /// Fully serving; the healthy steady state.
    ReadWrite,
    /// Read-only while existing copies are migrated elsewhere.
    DataMigration,
    /// Administratively removed from service; terminal short of removal.
    Disabled,
}

impl StorageState {
    /// Writers may pick this shard for new record copies.
    pub fn can_write_to(&self) -> bool {
        matches!(self, StorageState::ReadWrite)
    }

    /// Readers must consult this shard before declaring data loss.
    pub fn should_read_from(&self) -> bool {
        matches!(
            self,
            StorageState::ReadWrite | StorageState::ReadOnly | StorageState::DataMigration
        )
    }

    /// Empty states that make a shard eligible for removal.
    pub fn is_empty_state(&self) -> bool {
        matches!(self, StorageState::None | StorageState::Disabled)
    }
}

impl fmt::Display for StorageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageState::Provisioning => "PROVISIONING",
            StorageState::None => "NONE",
            StorageState::ReadOnly => "READ_ONLY",
            StorageState::ReadWrite => "READ_WRITE",
            StorageState::DataMigration => "DATA_MIGRATION",
            StorageState::Disabled => "DISABLED",
        };
        write!(f, "{}", name)
    }
}

/// Whether the shard also stores cluster metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaDataStorageState {
    None,
    MetaData,
}

/// Bit flags attached to a shard state.
pub mod shard_flags {
    pub type Type = u32;

    pub const NONE: Type = 0;

    /// The shard permanently lost copies; it must reject writes and
    /// never answer "no record" to readers.
    pub const UNRECOVERABLE: Type = 1 << 0;
}


/// State of one shard within the membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub storage_state: StorageState,
    pub metadata_state: MetaDataStorageState,
    pub flags: shard_flags::Type,
    /// Membership version since which this state is effective.
    pub since_version: u64,
    /// Set by a human operator; maintenance automation must not undo it.
    pub manual_override: bool,
}

impl ShardState {
    fn new(storage_state: StorageState, since_version: u64) -> Self {
        Self {
            storage_state,
            metadata_state: MetaDataStorageState::None,
            flags: shard_flags::NONE,
            since_version,
            manual_override: false,
        }
    }
}

/// Named shard transitions. Each has exactly one legal source state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageStateTransition {
    /// (new shard) -> PROVISIONING
    ProvisionShard,
    /// PROVISIONING -> NONE
    MarkShardProvisioned,
    /// NONE -> READ_WRITE; only while the membership is bootstrapping.
    BootstrapEnableShard,
    /// NONE -> READ_ONLY
    EnablingRead,
    /// READ_ONLY -> READ_WRITE
    EnableWrite,
    /// READ_WRITE -> READ_ONLY
    DisablingWrite,
    /// READ_ONLY -> DATA_MIGRATION
    StartDataMigration,
    /// DATA_MIGRATION -> NONE
    DataMigrationCompleted,
    /// READ_ONLY -> DISABLED
    DisablingRead,
    /// NONE | DISABLED -> (shard removed)
    RemoveEmptyShard,
    /// Metadata: NONE -> METADATA; storage state must be READ_WRITE.
    PromoteMetadata,
    /// Metadata: METADATA -> NONE
    DemoteMetadata,
    /// Set the UNRECOVERABLE flag.
    MarkUnrecoverable,
}

/// A batch of shard transitions conditioned on a base version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMembershipUpdate {
    pub base_version: u64,
    pub shard_updates: BTreeMap<ShardId, StorageStateTransition>,
}

impl StorageMembershipUpdate {
    pub fn new(base_version: u64) -> Self {
        Self {
            base_version,
            shard_updates: BTreeMap::new(),
        }
    }

    pub fn add_shard(&mut self, shard: ShardId, transition: StorageStateTransition) {
        self.shard_updates.insert(shard, transition);
    }

    pub fn is_empty(&self) -> bool {
        self.shard_updates.is_empty()
    }
}

/// The collection of storage shards and their states. Immutable; every
/// update produces a new value with `version + 1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageMembership {
    pub version: u64,
    /// Set while the cluster is being assembled; cleared exactly once by
    /// the finalize-bootstrapping update.
    pub bootstrapping: bool,
    shards: BTreeMap<ShardId, ShardState>,
    /// Index of shards whose metadata state is not NONE.
    metadata_shards: BTreeSet<ShardId>,
}

impl StorageMembership {
    pub fn new_bootstrapping() -> Self {
        Self {
            version: 0,
            bootstrapping: true,
            shards: BTreeMap::new(),
            metadata_shards: BTreeSet::new(),
        }
    }

    pub fn shard_state(&self, shard: ShardId) -> Option<&ShardState> {
        self.shards.get(&shard)
    }

    /// All shard states of one node; empty when the node has none.
    pub fn shard_states(&self, node: NodeIndex) -> BTreeMap<u16, ShardState> {
        self.shards
            .range(ShardId::new(node, 0)..=ShardId::new(node, u16::MAX))
            .map(|(shard, state)| (shard.shard, *state))
            .collect()
    }

    pub fn has_node(&self, node: NodeIndex) -> bool {
        !self.shard_states(node).is_empty()
    }

    pub fn can_write_to_shard(&self, shard: ShardId) -> bool {
        self.shards
            .get(&shard)
            .is_some_and(|s| s.storage_state.can_write_to() && s.flags == shard_flags::NONE)
    }

    pub fn should_read_from_shard(&self, shard: ShardId) -> bool {
        self.shards
            .get(&shard)
            .is_some_and(|s| s.storage_state.should_read_from())
    }

    /// Intersection of `storage_set` with shards writers may use.
    pub fn writer_view(&self, storage_set: &[ShardId]) -> Vec<ShardId> {
        storage_set
            .iter()
            .copied()
            .filter(|s| self.can_write_to_shard(*s))
            .collect()
    }

    /// Intersection of `storage_set` with shards readers must consult.
    pub fn reader_view(&self, storage_set: &[ShardId]) -> Vec<ShardId> {
        storage_set
            .iter()
            .copied()
            .filter(|s| self.should_read_from_shard(*s))
            .collect()
    }

    pub fn metadata_shards(&self) -> &BTreeSet<ShardId> {
        &self.metadata_shards
    }

    pub fn all_shards(&self) -> impl Iterator<Item = (&ShardId, &ShardState)> {
        self.shards.iter()
    }

    pub fn node_indexes(&self) -> BTreeSet<NodeIndex> {
        self.shards.keys().map(|s| s.node).collect()
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Every shard of `node` is in an empty state (or the node has no
    /// shards at all).
    pub fn is_node_drained(&self, node: NodeIndex) -> bool {
        self.shard_states(node)
            .values()
            .all(|s| s.storage_state.is_empty_state())
    }

    /// Apply a batch of transitions, all-or-nothing.
    pub fn apply_update(&self, update: &StorageMembershipUpdate) -> Result<StorageMembership> {
        if update.base_version != self.version {
            return Err(MembershipError::VersionMismatch {
                base: update.base_version,
                current: self.version,
            });
        }
        if update.is_empty() {
            return Err(MembershipError::InvalidParam(
                "empty storage membership update".to_string(),
            ));
        }

        let mut next = self.clone();
        next.version = self.version + 1;
        for (shard, transition) in &update.shard_updates {
            next.apply_transition(*shard, *transition)?;
        }
        debug!(
            version = next.version,
            transitions = update.shard_updates.len(),
            "applied storage membership update"
        );
        Ok(next)
    }

    fn apply_transition(
        &mut self,
        shard: ShardId,
        transition: StorageStateTransition,
    ) -> Result<()> {
        use StorageStateTransition::*;

        let since = self.version;
        match transition {
            ProvisionShard => {
                if self.shards.contains_key(&shard) {
                    return Err(MembershipError::AlreadyExists(shard.to_string()));
                }
                self.shards
                    .insert(shard, ShardState::new(StorageState::Provisioning, since));
                return Ok(());
            }
            RemoveEmptyShard => {
                let state = self.expect_shard(shard)?;
                if !state.storage_state.is_empty_state() {
                    return Err(MembershipError::InvalidParam(format!(
                        "{} is {} and cannot be removed",
                        shard, state.storage_state
                    )));
                }
                self.shards.remove(&shard);
                self.metadata_shards.remove(&shard);
                return Ok(());
            }
            _ => {}
        }

        let state = self.expect_shard(shard)?;
        let mut new_state = *state;
        match transition {
            MarkShardProvisioned => {
                Self::require_source(shard, state, StorageState::Provisioning)?;
                new_state.storage_state = StorageState::None;
            }
            BootstrapEnableShard => {
                if !self.bootstrapping {
                    return Err(MembershipError::InvalidParam(format!(
                        "{}: bootstrap-enable outside of bootstrapping",
                        shard
                    )));
                }
                Self::require_source(shard, state, StorageState::None)?;
                new_state.storage_state = StorageState::ReadWrite;
            }
            EnablingRead => {
                Self::require_source(shard, state, StorageState::None)?;
                new_state.storage_state = StorageState::ReadOnly;
            }
            EnableWrite => {
                Self::require_source(shard, state, StorageState::ReadOnly)?;
                new_state.storage_state = StorageState::ReadWrite;
            }
            DisablingWrite => {
                Self::require_source(shard, state, StorageState::ReadWrite)?;
                new_state.storage_state = StorageState::ReadOnly;
            }
            StartDataMigration => {
                Self::require_source(shard, state, StorageState::ReadOnly)?;
                new_state.storage_state = StorageState::DataMigration;
            }
            DataMigrationCompleted => {
                Self::require_source(shard, state, StorageState::DataMigration)?;
                new_state.storage_state = StorageState::None;
                // Migration emptied the shard; the flag is moot now.
                new_state.flags &= !shard_flags::UNRECOVERABLE;
            }
            DisablingRead => {
                Self::require_source(shard, state, StorageState::ReadOnly)?;
                new_state.storage_state = StorageState::Disabled;
            }
            PromoteMetadata => {
                if state.metadata_state != MetaDataStorageState::None {
                    return Err(MembershipError::InvalidParam(format!(
                        "{} already stores metadata",
                        shard
                    )));
                }
                Self::require_source(shard, state, StorageState::ReadWrite)?;
                new_state.metadata_state = MetaDataStorageState::MetaData;
                self.metadata_shards.insert(shard);
            }
            DemoteMetadata => {
                if state.metadata_state != MetaDataStorageState::MetaData {
                    return Err(MembershipError::InvalidParam(format!(
                        "{} does not store metadata",
                        shard
                    )));
                }
                new_state.metadata_state = MetaDataStorageState::None;
                self.metadata_shards.remove(&shard);
            }
            MarkUnrecoverable => {
                if state.flags & shard_flags::UNRECOVERABLE != 0 {
                    return Err(MembershipError::InvalidParam(format!(
                        "{} is already unrecoverable",
                        shard
                    )));
                }
                new_state.flags |= shard_flags::UNRECOVERABLE;
            }
            ProvisionShard | RemoveEmptyShard => unreachable!(),
        }
        new_state.since_version = since;
        self.shards.insert(shard, new_state);
        Ok(())
    }

    fn expect_shard(&self, shard: ShardId) -> Result<&ShardState> {
        self.shards
            .get(&shard)
            .ok_or_else(|| MembershipError::NoMatchInConfig(shard.to_string()))
    }

    fn require_source(shard: ShardId, state: &ShardState, source: StorageState) -> Result<()> {
        if state.storage_state != source {
            return Err(MembershipError::InvalidParam(format!(
                "{} is {}, transition requires {}",
                shard, state.storage_state, source
            )));
        }
        Ok(())
    }
}
