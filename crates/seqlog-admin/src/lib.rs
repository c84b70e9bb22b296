//! SeqLog Admin - The Control Plane
//!
//! The admin surface is a set of independent capability providers -
//! cluster membership mutation, settings overrides, snapshot requests -
//! composed behind one HTTP dispatcher. Each provider owns its own
//! state; the dispatcher only routes.
//!
//! All membership mutation happens under optimistic concurrency: a
//! handler reads the current nodes configuration, builds an update,
//! applies it locally and compare-and-swaps the result into the
//! versioned store, refreshing and rebuilding on version mismatch.
//! Per-node validation failures are collected into a single
//! `ClusterMembershipOperationFailed` so a caller sees every problem at
//! once.

pub mod api;
pub mod cluster_membership;
pub mod error;
pub mod failure_detector;
pub mod net_debug;
pub mod settings_override;
pub mod snapshot;
pub mod types;

pub use api::{admin_router, AdminState};
pub use cluster_membership::ClusterMembershipHandler;
pub use error::{
    AdminError, ClusterMembershipFailureReason, ClusterMembershipOperationFailed, FailedNode,
};
pub use failure_detector::{FailureDetector, PeerState, StaticFailureDetector};
pub use net_debug::{GetConnectionsDebugResponse, NetDebugHandle, WorkerConnections};
pub use settings_override::SettingsHandler;
pub use snapshot::SnapshotHandler;
