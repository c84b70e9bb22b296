//! Snapshot Requests
//!
//! The log tree and the maintenance log are replicated state machines
//! owned elsewhere; the admin surface only asks them to take a
//! snapshot. The request names the minimum version the caller has
//! observed: a subsystem that has not caught up yet answers
//! `StaleVersion` rather than snapshotting old state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::info;

use crate::error::AdminError;

#[derive(Default)]
struct SnapshotTarget {
    version: AtomicU64,
    snapshots_taken: AtomicU64,
}

impl SnapshotTarget {
    fn take(&self, min_version: u64, ready: bool, what: &str) -> Result<(), AdminError> {
        if !ready {
            return Err(AdminError::NodeNotReady);
        }
        let current = self.version.load(Ordering::Acquire);
        if current < min_version {
            return Err(AdminError::StaleVersion {
                current,
                min: min_version,
            });
        }
        self.snapshots_taken.fetch_add(1, Ordering::AcqRel);
        info!(what, version = current, "snapshot requested");
        Ok(())
    }
}

#[derive(Default)]
pub struct SnapshotHandler {
    ready: AtomicBool,
    log_tree: SnapshotTarget,
    maintenance_log: SnapshotTarget,
}

impl SnapshotHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn note_log_tree_version(&self, version: u64) {
        self.log_tree.version.store(version, Ordering::Release);
    }

    pub fn note_maintenance_log_version(&self, version: u64) {
        self.maintenance_log
            .version
            .store(version, Ordering::Release);
    }

    pub fn take_log_tree_snapshot(&self, min_version: u64) -> Result<(), AdminError> {
        self.log_tree
            .take(min_version, self.ready.load(Ordering::Acquire), "log-tree")
    }

    pub fn take_maintenance_log_snapshot(&self, min_version: u64) -> Result<(), AdminError> {
        self.maintenance_log.take(
            min_version,
            self.ready.load(Ordering::Acquire),
            "maintenance-log",
        )
    }

    pub fn log_tree_snapshots_taken(&self) -> u64 {
        self.log_tree.snapshots_taken.load(Ordering::Acquire)
    }
}
