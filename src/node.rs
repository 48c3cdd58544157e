//! Core identifier and node types.
//!
//! Every curriculum concept is a [`KnowledgeNode`] identified by a [`NodeId`].
//! Nodes are grouped into clusters ([`ClusterId`]) and learners are identified
//! by [`UserId`].

use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

/// Unique, niche-optimized identifier for a knowledge node.
///
/// Uses `NonZeroU64` so that `Option<NodeId>` is the same size as `NodeId`.
/// Ordering is by raw value, which is what every deterministic tie-break in
/// the crate relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(NonZeroU64);

impl NodeId {
    /// Create a `NodeId` from a raw `u64`.
    ///
    /// Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(NodeId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Identifier of a learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user:{}", self.0)
    }
}

/// Identifier of a cluster of related nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ClusterId(pub u64);

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cluster:{}", self.0)
    }
}

/// A single curriculum concept.
///
/// Nodes are immutable after creation except for `cluster`, which changes
/// when the graph is re-clustered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    /// Unique identifier.
    pub id: NodeId,
    /// Human-readable label, e.g. "Fractions: common denominators".
    #[serde(default)]
    pub label: String,
    /// Subject this concept belongs to (e.g. "math").
    pub subject: String,
    /// School grade the concept is taught in.
    pub grade: u8,
    /// The single cluster this node belongs to.
    pub cluster: ClusterId,
    /// Difficulty level, 1 (easiest) upwards.
    #[serde(default = "default_difficulty")]
    pub difficulty: u8,
}

fn default_difficulty() -> u8 {
    1
}

impl KnowledgeNode {
    /// Create a node with an empty label and difficulty 1.
    pub fn new(id: NodeId, subject: impl Into<String>, grade: u8, cluster: ClusterId) -> Self {
        Self {
            id,
            label: String::new(),
            subject: subject.into(),
            grade,
            cluster,
            difficulty: default_difficulty(),
        }
    }

    /// Whether this node belongs to the given subject and grade.
    pub fn matches(&self, subject: &str, grade: u8) -> bool {
        self.grade == grade && self.subject.eq_ignore_ascii_case(subject)
    }
}

/// Seconds since the UNIX epoch.
pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_rejects_zero() {
        assert!(NodeId::new(0).is_none());
        assert_eq!(NodeId::new(7).unwrap().get(), 7);
    }

    #[test]
    fn option_node_id_is_niche_optimized() {
        assert_eq!(
            std::mem::size_of::<Option<NodeId>>(),
            std::mem::size_of::<NodeId>()
        );
    }

    #[test]
    fn node_ids_order_by_raw_value() {
        let mut ids = vec![NodeId::new(9).unwrap(), NodeId::new(2).unwrap(), NodeId::new(5).unwrap()];
        ids.sort();
        let raw: Vec<u64> = ids.into_iter().map(NodeId::get).collect();
        assert_eq!(raw, vec![2, 5, 9]);
    }

    #[test]
    fn subject_match_is_case_insensitive() {
        let node = KnowledgeNode::new(NodeId::new(1).unwrap(), "Math", 5, ClusterId(1));
        assert!(node.matches("math", 5));
        assert!(!node.matches("math", 6));
        assert!(!node.matches("physics", 5));
    }

    #[test]
    fn display_formats() {
        assert_eq!(NodeId::new(3).unwrap().to_string(), "node:3");
        assert_eq!(UserId(4).to_string(), "user:4");
        assert_eq!(ClusterId(5).to_string(), "cluster:5");
    }
}
