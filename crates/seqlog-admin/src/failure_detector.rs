//! Failure Detector Interface
//!
//! Node removal is gated on liveness: a node may only leave the
//! configuration once the failure detector reports it dead. The
//! detector itself (gossip-driven in production) is an external
//! collaborator; the static implementation serves tests and tooling.

use std::collections::BTreeSet;
use std::sync::Mutex;

use seqlog_core::NodeIndex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Alive,
    Dead,
    Unknown,
}

pub trait FailureDetector: Send + Sync {
    fn peer_state(&self, node: NodeIndex) -> PeerState;
}

/// Scriptable detector: everything is alive unless marked dead.
#[derive(Default)]
pub struct StaticFailureDetector {
    dead: Mutex<BTreeSet<NodeIndex>>,
}

impl StaticFailureDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dead(&self, node: NodeIndex) {
        self.dead.lock().expect("detector poisoned").insert(node);
    }

    pub fn mark_alive(&self, node: NodeIndex) {
        self.dead.lock().expect("detector poisoned").remove(&node);
    }
}

impl FailureDetector for StaticFailureDetector {
    fn peer_state(&self, node: NodeIndex) -> PeerState {
        if self.dead.lock().expect("detector poisoned").contains(&node) {
            PeerState::Dead
        } else {
            PeerState::Alive
        }
    }
}
