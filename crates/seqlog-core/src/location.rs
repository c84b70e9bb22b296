//! Node Locations
//!
//! A node's location is a five-level path `region.dc.cluster.row.rack`,
//! written as a dot-separated string. Traffic shaping picks a flow group
//! by the *closest shared scope* between two locations, and replication
//! properties are expressed as "so many copies across scope X".
//!
//! Empty components are allowed on the right (a node may only know its
//! region and data center); `"region1.dc2"` parses with the remaining
//! levels unset.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::status::Status;

/// Scope ladder, smallest first. `Node` is "the peer is this very node"
/// and `Root` is "nothing shared at all".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum LocationScope {
    Node = 0,
    Rack = 1,
    Row = 2,
    Cluster = 3,
    DataCenter = 4,
    Region = 5,
    Root = 6,
}

impl LocationScope {
    pub const COUNT: usize = 7;

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Next scope up the ladder; `Root` saturates.
    pub fn next_greater(&self) -> LocationScope {
        match self {
            LocationScope::Node => LocationScope::Rack,
            LocationScope::Rack => LocationScope::Row,
            LocationScope::Row => LocationScope::Cluster,
            LocationScope::Cluster => LocationScope::DataCenter,
            LocationScope::DataCenter => LocationScope::Region,
            LocationScope::Region | LocationScope::Root => LocationScope::Root,
        }
    }

    pub fn all() -> [LocationScope; LocationScope::COUNT] {
        [
            LocationScope::Node,
            LocationScope::Rack,
            LocationScope::Row,
            LocationScope::Cluster,
            LocationScope::DataCenter,
            LocationScope::Region,
            LocationScope::Root,
        ]
    }
}

/// A parsed location path. Components are ordered biggest-scope first,
/// the way they are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeLocation {
    pub region: Option<String>,
    pub data_center: Option<String>,
    pub cluster: Option<String>,
    pub row: Option<String>,
    pub rack: Option<String>,
}

impl NodeLocation {
    pub fn is_empty(&self) -> bool {
        self.region.is_none()
    }

    fn component(&self, scope: LocationScope) -> Option<&str> {
        match scope {
            LocationScope::Region => self.region.as_deref(),
            LocationScope::DataCenter => self.data_center.as_deref(),
            LocationScope::Cluster => self.cluster.as_deref(),
            LocationScope::Row => self.row.as_deref(),
            LocationScope::Rack => self.rack.as_deref(),
            LocationScope::Node | LocationScope::Root => None,
        }
    }

    /// Smallest scope at which `self` and `other` share all components.
    ///
    /// Two identical full locations share `Rack`; locations differing in
    /// region (or with unknown regions) share only `Root`.
    pub fn closest_shared_scope(&self, other: &NodeLocation) -> LocationScope {
        let mut shared = LocationScope::Root;
        for scope in [
            LocationScope::Region,
            LocationScope::DataCenter,
            LocationScope::Cluster,
            LocationScope::Row,
            LocationScope::Rack,
        ] {
            match (self.component(scope), other.component(scope)) {
                (Some(a), Some(b)) if a == b => shared = scope,
                _ => break,
            }
        }
        shared
    }

    /// Whether the two locations differ at `boundary` or any bigger
    /// scope. Used for the SSL boundary decision: crossing the boundary
    /// means the link leaves the trusted domain.
    pub fn crosses_boundary(&self, other: &NodeLocation, boundary: LocationScope) -> bool {
        if boundary == LocationScope::Node {
            return true;
        }
        self.closest_shared_scope(other) > boundary
    }
}

impl FromStr for NodeLocation {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Status> {
        if s.is_empty() {
            return Ok(NodeLocation::default());
        }
        let mut parts = s.split('.');
        let mut take = || parts.next().filter(|p| !p.is_empty()).map(str::to_owned);
        let loc = NodeLocation {
            region: take(),
            data_center: take(),
            cluster: take(),
            row: take(),
            rack: take(),
        };
        if parts.next().is_some() {
            return Err(Status::InvalidParam);
        }
        Ok(loc)
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            &self.region,
            &self.data_center,
            &self.cluster,
            &self.row,
            &self.rack,
        ];
        let mut first = true;
        for part in parts.into_iter().flatten() {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", part)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_location() {
        let loc: NodeLocation = "us-east.dc1.cl0.row3.rack7".parse().expect("parse");
        assert_eq!(loc.region.as_deref(), Some("us-east"));
        assert_eq!(loc.rack.as_deref(), Some("rack7"));
        assert_eq!(loc.to_string(), "us-east.dc1.cl0.row3.rack7");
    }

    #[test]
    fn test_parse_partial_location() {
        let loc: NodeLocation = "us-east.dc1".parse().expect("parse");
        assert_eq!(loc.data_center.as_deref(), Some("dc1"));
        assert!(loc.cluster.is_none());
    }

    #[test]
    fn test_parse_too_many_components() {
        let res: Result<NodeLocation, _> = "a.b.c.d.e.f".parse();
        assert_eq!(res.unwrap_err(), Status::InvalidParam);
    }

    #[test]
    fn test_closest_shared_scope() {
        let a: NodeLocation = "r1.d1.c1.w1.k1".parse().unwrap();
        let b: NodeLocation = "r1.d1.c1.w1.k1".parse().unwrap();
        let c: NodeLocation = "r1.d1.c2.w9.k9".parse().unwrap();
        let d: NodeLocation = "r2.d1.c1.w1.k1".parse().unwrap();

        assert_eq!(a.closest_shared_scope(&b), LocationScope::Rack);
        assert_eq!(a.closest_shared_scope(&c), LocationScope::DataCenter);
        assert_eq!(a.closest_shared_scope(&d), LocationScope::Root);
    }

    #[test]
    fn test_crosses_boundary() {
        let a: NodeLocation = "r1.d1.c1.w1.k1".parse().unwrap();
        let c: NodeLocation = "r1.d2.c1.w1.k1".parse().unwrap();
        // Same region, different data center.
        assert!(!a.crosses_boundary(&c, LocationScope::Region));
        assert!(a.crosses_boundary(&c, LocationScope::DataCenter));
    }
}
