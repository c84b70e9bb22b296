//! Sequencer Membership
//!
//! Which nodes may run sequencers and with what weight. Weights steer
//! the placement of logs onto sequencer nodes; a disabled node keeps its
//! weight but receives no placements until re-enabled.

use std::collections::BTreeMap;

use seqlog_core::NodeIndex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MembershipError, Result};

/// Per-node sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequencerNodeState {
    /// Relative share of logs this node should sequence. Zero is legal
    /// and means "member, but never picked".
    pub weight: f64,
    pub enabled: bool,
    /// Keep the node out of new nodesets without disabling it.
    pub exclude_from_nodesets: bool,
}

/// One per-node change inside a membership update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SequencerNodeUpdate {
    Add { weight: f64, enabled: bool },
    Remove,
    SetWeight(f64),
    SetEnabled(bool),
    SetExcludeFromNodesets(bool),
}

/// Batch of per-node changes conditioned on a base version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequencerMembershipUpdate {
    pub base_version: u64,
    pub node_updates: BTreeMap<NodeIndex, SequencerNodeUpdate>,
}

impl SequencerMembershipUpdate {
    pub fn new(base_version: u64) -> Self {
        Self {
            base_version,
            node_updates: BTreeMap::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeIndex, update: SequencerNodeUpdate) {
        self.node_updates.insert(node, update);
    }

    pub fn is_empty(&self) -> bool {
        self.node_updates.is_empty()
    }
}

/// The sequencer membership value. Immutable; updates produce a new
/// value with `version + 1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequencerMembership {
    pub version: u64,
    pub bootstrapping: bool,
    nodes: BTreeMap<NodeIndex, SequencerNodeState>,
}

impl SequencerMembership {
    pub fn new_bootstrapping() -> Self {
        Self {
            version: 0,
            bootstrapping: true,
            nodes: BTreeMap::new(),
        }
    }

    pub fn node_state(&self, node: NodeIndex) -> Option<&SequencerNodeState> {
        self.nodes.get(&node)
    }

    pub fn has_node(&self, node: NodeIndex) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn is_enabled(&self, node: NodeIndex) -> bool {
        self.nodes.get(&node).is_some_and(|s| s.enabled)
    }

    pub fn member_indexes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.nodes.keys().copied()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn apply_update(&self, update: &SequencerMembershipUpdate) -> Result<SequencerMembership> {
        if update.base_version != self.version {
            return Err(MembershipError::VersionMismatch {
                base: update.base_version,
                current: self.version,
            });
        }
        if update.is_empty() {
            return Err(MembershipError::InvalidParam(
                "empty sequencer membership update".to_string(),
            ));
        }

        let mut next = self.clone();
        next.version = self.version + 1;
        for (node, node_update) in &update.node_updates {
            next.apply_node_update(*node, node_update)?;
        }
        debug!(
            version = next.version,
            changes = update.node_updates.len(),
            "applied sequencer membership update"
        );
        Ok(next)
    }

    fn apply_node_update(&mut self, node: NodeIndex, update: &SequencerNodeUpdate) -> Result<()> {
        match update {
            SequencerNodeUpdate::Add { weight, enabled } => {
                if self.nodes.contains_key(&node) {
                    return Err(MembershipError::AlreadyExists(format!("N{}", node)));
                }
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(MembershipError::InvalidParam(format!(
                        "N{}: sequencer weight {} out of range",
                        node, weight
                    )));
                }
                self.nodes.insert(
                    node,
                    SequencerNodeState {
                        weight: *weight,
                        enabled: *enabled,
                        exclude_from_nodesets: false,
                    },
                );
                Ok(())
            }
            SequencerNodeUpdate::Remove => {
                self.expect_node(node)?;
                self.nodes.remove(&node);
                Ok(())
            }
            SequencerNodeUpdate::SetWeight(weight) => {
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(MembershipError::InvalidParam(format!(
                        "N{}: sequencer weight {} out of range",
                        node, weight
                    )));
                }
                self.expect_node_mut(node)?.weight = *weight;
                Ok(())
            }
            SequencerNodeUpdate::SetEnabled(enabled) => {
                self.expect_node_mut(node)?.enabled = *enabled;
                Ok(())
            }
            SequencerNodeUpdate::SetExcludeFromNodesets(exclude) => {
                self.expect_node_mut(node)?.exclude_from_nodesets = *exclude;
                Ok(())
            }
        }
    }

    fn expect_node(&self, node: NodeIndex) -> Result<&SequencerNodeState> {
        self.nodes
            .get(&node)
            .ok_or_else(|| MembershipError::NoMatchInConfig(format!("N{}", node)))
    }

    fn expect_node_mut(&mut self, node: NodeIndex) -> Result<&mut SequencerNodeState> {
        self.nodes
            .get_mut(&node)
            .ok_or_else(|| MembershipError::NoMatchInConfig(format!("N{}", node)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(
        m: &SequencerMembership,
        node: NodeIndex,
        u: SequencerNodeUpdate,
    ) -> Result<SequencerMembership> {
        let mut update = SequencerMembershipUpdate::new(m.version);
        update.add_node(node, u);
        m.apply_update(&update)
    }

    #[test]
    fn test_add_and_remove() {
        let m = SequencerMembership::new_bootstrapping();
        let m = apply(
            &m,
            0,
            SequencerNodeUpdate::Add {
                weight: 1.0,
                enabled: true,
            },
        )
        .unwrap();
        assert!(m.is_enabled(0));
        assert_eq!(m.version, 1);

        let m = apply(&m, 0, SequencerNodeUpdate::Remove).unwrap();
        assert!(!m.has_node(0));
        assert_eq!(m.version, 2);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let m = SequencerMembership::new_bootstrapping();
        let m = apply(
            &m,
            0,
            SequencerNodeUpdate::Add {
                weight: 1.0,
                enabled: true,
            },
        )
        .unwrap();
        let err = apply(
            &m,
            0,
            SequencerNodeUpdate::Add {
                weight: 2.0,
                enabled: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MembershipError::AlreadyExists(_)));
    }

    #[test]
    fn test_negative_weight_rejected() {
        let m = SequencerMembership::new_bootstrapping();
        let err = apply(
            &m,
            0,
            SequencerNodeUpdate::Add {
                weight: -1.0,
                enabled: true,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MembershipError::InvalidParam(_)));
    }

    #[test]
    fn test_update_missing_node() {
        let m = SequencerMembership::new_bootstrapping();
        let err = apply(&m, 5, SequencerNodeUpdate::SetEnabled(true)).unwrap_err();
        assert!(matches!(err, MembershipError::NoMatchInConfig(_)));
    }

    #[test]
    fn test_stale_base_version() {
        let m = SequencerMembership::new_bootstrapping();
        let mut update = SequencerMembershipUpdate::new(3);
        update.add_node(
            0,
            SequencerNodeUpdate::Add {
                weight: 1.0,
                enabled: true,
            },
        );
        assert!(matches!(
            m.apply_update(&update).unwrap_err(),
            MembershipError::VersionMismatch { .. }
        ));
    }
}
