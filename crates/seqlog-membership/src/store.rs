//! Versioned Config Store
//!
//! The externally-durable home of the serialized nodes configuration.
//! The store is a compare-and-swap register: an update names the base
//! version it was computed against and fails with `VersionMismatch` when
//! someone else got there first. The mismatch reply *may* carry the
//! winner's blob so the caller can refresh without a second round-trip.
//!
//! `UpdatableNodesConfiguration` is the process-local holder: an
//! atomically swapped `Arc` snapshot that readers clone at operation
//! start.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use seqlog_core::Status;
use tokio::sync::Mutex;
use tracing::debug;

use crate::nodes_config::NodesConfiguration;

/// Result of a conditional store update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The update was committed at `new_version`.
    Ok { new_version: u64 },
    /// Someone else updated first. `current` carries their blob when
    /// the store can provide it cheaply.
    VersionMismatch { current: Option<Bytes> },
}

/// Compare-and-swap store for the serialized configuration.
#[async_trait]
pub trait VersionedConfigStore: Send + Sync {
    /// Commit `bytes` iff the stored version equals `base_version`.
    async fn update_config(&self, bytes: Bytes, base_version: u64)
        -> Result<UpdateOutcome, Status>;

    /// Fetch the current blob.
    async fn get_config(&self) -> Result<Bytes, Status>;
}

/// Async source of auxiliary config files, keyed by path. Used by debug
/// tooling to fetch configs from wherever the deployment keeps them.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get_config(&self, path: &str) -> Result<Bytes, Status>;
}

/// In-process store, used by tests and single-node deployments.
pub struct InMemoryConfigStore {
    state: Mutex<(u64, Bytes)>,
    /// When set, mismatch replies do not carry the current blob, forcing
    /// callers down the explicit `get_config` path.
    withhold_read_back: bool,
}

impl InMemoryConfigStore {
    pub fn new(initial_version: u64, initial: Bytes) -> Self {
        Self {
            state: Mutex::new((initial_version, initial)),
            withhold_read_back: false,
        }
    }

    pub fn new_withholding_read_back(initial_version: u64, initial: Bytes) -> Self {
        Self {
            state: Mutex::new((initial_version, initial)),
            withhold_read_back: true,
        }
    }
}

#[async_trait]
impl VersionedConfigStore for InMemoryConfigStore {
    async fn update_config(
        &self,
        bytes: Bytes,
        base_version: u64,
    ) -> Result<UpdateOutcome, Status> {
        let mut state = self.state.lock().await;
        if state.0 != base_version {
            debug!(
                base = base_version,
                current = state.0,
                "config store version mismatch"
            );
            let current = (!self.withhold_read_back).then(|| state.1.clone());
            return Ok(UpdateOutcome::VersionMismatch { current });
        }
        state.0 += 1;
        state.1 = bytes;
        Ok(UpdateOutcome::Ok {
            new_version: state.0,
        })
    }

    async fn get_config(&self) -> Result<Bytes, Status> {
        Ok(self.state.lock().await.1.clone())
    }
}

/// Process-local holder of the current configuration snapshot.
///
/// Readers get an `Arc` clone; writers swap the pointer. The snapshot a
/// reader holds stays valid and immutable for as long as it keeps it.
#[derive(Default)]
pub struct UpdatableNodesConfiguration {
    current: RwLock<Arc<NodesConfiguration>>,
}

impl UpdatableNodesConfiguration {
    pub fn new(config: NodesConfiguration) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn get(&self) -> Arc<NodesConfiguration> {
        self.current.read().expect("config holder poisoned").clone()
    }

    /// Install `config` if it is newer than what is held. Returns
    /// whether the swap happened.
    pub fn update(&self, config: Arc<NodesConfiguration>) -> bool {
        let mut guard = self.current.write().expect("config holder poisoned");
        if config.version <= guard.version && guard.version != 0 {
            return false;
        }
        *guard = config;
        true
    }
}
