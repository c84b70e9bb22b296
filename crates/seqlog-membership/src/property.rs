//! Replication Properties
//!
//! A replication property states how many copies of a record must land
//! across failure domains of each scope, e.g. "3 copies, across 2 racks".
//! Stored biggest-scope-first so the strictest cross-domain requirement
//! is first.

use std::collections::BTreeMap;
use std::fmt;

use seqlog_core::LocationScope;
use serde::{Deserialize, Serialize};

use crate::error::{MembershipError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationProperty {
    /// Scope -> minimum distinct domains at that scope.
    factors: BTreeMap<LocationScope, u8>,
}

impl ReplicationProperty {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-scope property, e.g. 3 copies across nodes.
    pub fn with_factor(scope: LocationScope, factor: u8) -> Result<Self> {
        let mut p = Self::new();
        p.set_factor(scope, factor)?;
        Ok(p)
    }

    pub fn set_factor(&mut self, scope: LocationScope, factor: u8) -> Result<()> {
        if factor == 0 {
            return Err(MembershipError::InvalidParam(format!(
                "replication factor at {:?} must be positive",
                scope
            )));
        }
        self.factors.insert(scope, factor);
        Ok(())
    }

    pub fn factor_at(&self, scope: LocationScope) -> Option<u8> {
        self.factors.get(&scope).copied()
    }

    /// Total number of copies: the largest factor across scopes.
    pub fn replication_factor(&self) -> u8 {
        self.factors.values().copied().max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LocationScope, &u8)> {
        self.factors.iter()
    }
}

impl fmt::Display for ReplicationProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (scope, factor) in &self.factors {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{:?}:{}", scope, factor)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_factor_rejected() {
        assert!(ReplicationProperty::with_factor(LocationScope::Node, 0).is_err());
    }

    #[test]
    fn test_replication_factor_is_max() {
        let mut p = ReplicationProperty::new();
        p.set_factor(LocationScope::Node, 3).unwrap();
        p.set_factor(LocationScope::Rack, 2).unwrap();
        assert_eq!(p.replication_factor(), 3);
        assert_eq!(p.factor_at(LocationScope::Rack), Some(2));
    }
}
