//! Admin Errors
//!
//! Cluster-membership requests cover many nodes at once; validation
//! problems are batched into one `ClusterMembershipOperationFailed`
//! carrying a `(node, reason)` list, so operators see the whole
//! picture instead of fixing nodes one by one.

use seqlog_core::Status;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMembershipFailureReason {
    AlreadyExists,
    InvalidRequestNodesConfig,
    NoMatchInConfig,
    NotDead,
    NotDisabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedNode {
    pub node_index: i32,
    pub reason: ClusterMembershipFailureReason,
    pub message: String,
}

#[derive(Debug, Clone, Default, Error, Serialize, Deserialize)]
#[error("cluster membership operation failed for {} node(s)", failed_nodes.len())]
pub struct ClusterMembershipOperationFailed {
    pub failed_nodes: Vec<FailedNode>,
}

impl ClusterMembershipOperationFailed {
    pub fn push(
        &mut self,
        node_index: i32,
        reason: ClusterMembershipFailureReason,
        message: impl Into<String>,
    ) {
        self.failed_nodes.push(FailedNode {
            node_index,
            reason,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failed_nodes.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    OperationFailed(#[from] ClusterMembershipOperationFailed),

    /// The underlying configuration update was rejected.
    #[error("nodes configuration manager error ({}): {message}", status.name())]
    NodesConfigurationManager { status: Status, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cluster is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("version {current} is below the requested minimum {min}")]
    StaleVersion { current: u64, min: u64 },

    #[error("node is not ready")]
    NodeNotReady,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config store error: {0}")]
    Store(Status),
}

impl AdminError {
    pub fn status(&self) -> Status {
        match self {
            AdminError::OperationFailed(_) => Status::Invalid,
            AdminError::NodesConfigurationManager { status, .. } => *status,
            AdminError::InvalidRequest(_) => Status::Invalid,
            AdminError::AlreadyBootstrapped => Status::AlreadyExists,
            AdminError::StaleVersion { .. } => Status::Stale,
            AdminError::NodeNotReady => Status::NotReady,
            AdminError::NotFound(_) => Status::NotFound,
            AdminError::Store(status) => *status,
        }
    }
}
