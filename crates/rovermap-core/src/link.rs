//! Typed graph edges between map nodes.
//!
//! A [`Link`] is a directed constraint `(from, to)` carrying an optional
//! relative transform, its information weights and a free-form user blob.
//! Links are stored on *both* endpoints: whenever a link is installed on
//! `from`, its [`inverse`][Link::inverse] is installed on `to`.
//!
//! [`LinkKind`] is a closed variant set; the behavioural differences between
//! kinds (who counts as a neighbour, who participates in graph reduction,
//! who transfers weight) are expressed as predicate methods rather than
//! dispatch.

use serde::{Deserialize, Serialize};

use crate::transform::Transform;

// ────────────────────────────────────────────────────────────────────────────
// LinkKind
// ────────────────────────────────────────────────────────────────────────────

/// The closed set of edge kinds in the map graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    /// Temporal successor within one mapping session.
    Neighbor,
    /// Neighbour chain synthesized when a node was collapsed by graph
    /// reduction.
    NeighborMerged,
    /// Appearance-based loop closure.
    GlobalClosure,
    /// Metric loop closure found in the local space (e.g. scan matching).
    LocalSpaceClosure,
    /// Placeholder closure used internally; never optimized or persisted as
    /// a real constraint.
    VirtualClosure,
    /// Unset.
    Undef,
}

impl LinkKind {
    /// Neighbour-chain kinds (temporal adjacency).
    pub fn is_neighbor(self) -> bool {
        matches!(self, LinkKind::Neighbor | LinkKind::NeighborMerged)
    }

    /// Loop-closure kinds: anything that is neither a neighbour nor unset.
    pub fn is_closure(self) -> bool {
        !self.is_neighbor() && self != LinkKind::Undef
    }

    /// Kinds eligible to trigger graph reduction when pointing at an older
    /// node.
    pub fn reduces(self) -> bool {
        self.is_closure() && self != LinkKind::VirtualClosure
    }
}

// ────────────────────────────────────────────────────────────────────────────
// LinkInfo
// ────────────────────────────────────────────────────────────────────────────

/// Information (inverse-covariance) weights of a link's transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub rotation: f32,
    pub translation: f32,
}

impl Default for LinkInfo {
    fn default() -> Self {
        Self {
            rotation: 1.0,
            translation: 1.0,
        }
    }
}

impl LinkInfo {
    pub fn new(rotation: f32, translation: f32) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from covariances (inverting each component; non-positive
    /// covariance yields the default weight of 1).
    pub fn from_covariance(rotation: f32, translation: f32) -> Self {
        let inv = |v: f32| if v > 0.0 { 1.0 / v } else { 1.0 };
        Self {
            rotation: inv(rotation),
            translation: inv(translation),
        }
    }

    /// Combined information of two chained constraints: the weaker component
    /// dominates.
    pub fn combined(self, other: Self) -> Self {
        Self {
            rotation: self.rotation.min(other.rotation),
            translation: self.translation.min(other.translation),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Link
// ────────────────────────────────────────────────────────────────────────────

/// A directed edge of the map graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub from: i32,
    pub to: i32,
    pub kind: LinkKind,
    /// Relative transform `from -> to`; `None` for non-metric links.
    pub transform: Option<Transform>,
    pub info: LinkInfo,
    /// Free-form payload attached to the constraint.
    pub user_data: Vec<u8>,
}

impl Link {
    pub fn new(from: i32, to: i32, kind: LinkKind, transform: Option<Transform>) -> Self {
        Self {
            from,
            to,
            kind,
            transform,
            info: LinkInfo::default(),
            user_data: Vec::new(),
        }
    }

    pub fn with_info(mut self, info: LinkInfo) -> Self {
        self.info = info;
        self
    }

    /// True when the link carries a usable transform.
    pub fn is_valid(&self) -> bool {
        self.transform.is_some()
    }

    /// The same constraint seen from the other endpoint: `from`/`to` swapped
    /// and the transform inverted.
    pub fn inverse(&self) -> Link {
        Link {
            from: self.to,
            to: self.from,
            kind: self.kind,
            transform: self.transform.as_ref().map(Transform::inverse),
            info: self.info,
            user_data: self.user_data.clone(),
        }
    }

    /// Chain this link with `other` (requiring `self.to == other.from`),
    /// yielding a direct constraint `self.from -> other.to` of the given
    /// kind with the composed transform.
    pub fn merge(&self, other: &Link, kind: LinkKind) -> Link {
        assert_eq!(
            self.to, other.from,
            "merge requires chained links ({} -> {} vs {} -> {})",
            self.from, self.to, other.from, other.to
        );
        let transform = match (&self.transform, &other.transform) {
            (Some(a), Some(b)) => Some(a.compose(b)),
            _ => None,
        };
        Link {
            from: self.from,
            to: other.to,
            kind,
            transform,
            info: self.info.combined(other.info),
            user_data: Vec::new(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
