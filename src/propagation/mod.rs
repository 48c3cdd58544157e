//! Proficiency propagation.
//!
//! One completed assessment updates the learner's proficiency in three
//! barrier-synchronized tiers:
//!
//! - **Tier 3, cluster baseline**: every untested member of a cluster with at
//!   least one tested node starts from the mean score of the tested members.
//! - **Tier 2, neighbor propagation**: each tested node nudges the nodes
//!   reachable over strong outgoing edges, starting from the Tier 3 values.
//! - **Tier 1, direct update**: each tested node moves from its stored value
//!   towards its score.
//!
//! [`tiers`] holds the pure computation, [`engine::PropagationEngine`] adds
//! validation, retries, per-learner serialization and persistence.

pub mod cancel;
pub mod engine;
pub mod tiers;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::node::{ClusterId, NodeId, UserId};
use crate::store::DEFAULT_PROFICIENCY;

/// One observed assessment result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub node: NodeId,
    /// Fraction of marks earned, in [0, 1].
    pub score: f64,
}

impl AssessmentResult {
    pub fn new(node: NodeId, score: f64) -> Self {
        Self { node, score }
    }
}

/// Tuning of the propagation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Learning rate for tested nodes.
    #[serde(default = "default_alpha_direct")]
    pub alpha_direct: f64,
    /// Learning rate for propagated neighbors.
    #[serde(default = "default_alpha_neighbor")]
    pub alpha_neighbor: f64,
    /// Minimum weight of every edge on a propagation path.
    #[serde(default = "default_min_traversal_weight")]
    pub min_traversal_weight: f64,
    /// Maximum number of hops from a tested node.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Proficiency assumed for nodes without a stored value.
    #[serde(default = "default_proficiency")]
    pub default_proficiency: f64,
    /// Damping constant `k` for low-confidence edges: the effective weight is
    /// `W * n / (n + k)` for sample size `n`. Zero disables damping.
    #[serde(default)]
    pub sample_size_damping: f64,
    /// Abandon runs that take longer than this.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_alpha_direct() -> f64 {
    0.1
}
fn default_alpha_neighbor() -> f64 {
    0.06
}
fn default_min_traversal_weight() -> f64 {
    0.3
}
fn default_max_depth() -> usize {
    2
}
fn default_proficiency() -> f64 {
    DEFAULT_PROFICIENCY
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            alpha_direct: default_alpha_direct(),
            alpha_neighbor: default_alpha_neighbor(),
            min_traversal_weight: default_min_traversal_weight(),
            max_depth: default_max_depth(),
            default_proficiency: default_proficiency(),
            sample_size_damping: 0.0,
            timeout_ms: None,
        }
    }
}

impl PropagationConfig {
    /// Edge weight after low-confidence damping.
    pub fn effective_weight(&self, weight: f64, sample_size: u64) -> f64 {
        if self.sample_size_damping <= 0.0 {
            return weight;
        }
        let n = sample_size as f64;
        weight * n / (n + self.sample_size_damping)
    }
}

/// Stages a propagation run passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    ValidatingInput,
    ComputingTier3,
    ComputingTier2,
    ComputingTier1,
    Clamping,
    Persisted,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::ValidatingInput => "validating-input",
            Self::ComputingTier3 => "computing-tier3",
            Self::ComputingTier2 => "computing-tier2",
            Self::ComputingTier1 => "computing-tier1",
            Self::Clamping => "clamping",
            Self::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

/// How many nodes each tier produced a value for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    /// Untested nodes given a cluster baseline.
    pub baseline: usize,
    /// Untested nodes adjusted by neighbor propagation.
    pub propagated: usize,
    /// Individual neighbor adjustments (a node reached twice counts twice).
    pub neighbor_steps: usize,
    /// Tested nodes.
    pub direct: usize,
}

/// The outcome of one propagation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProficiencyUpdate {
    pub user: UserId,
    /// New value of every touched node, clamped to [0, 1].
    pub values: BTreeMap<NodeId, f64>,
    /// Tested nodes in caller order.
    pub tested: Vec<NodeId>,
    /// Tier 3 mean score per touched cluster.
    pub cluster_means: BTreeMap<ClusterId, f64>,
    /// States the run passed through, in order.
    pub states: Vec<RunState>,
    pub counts: TierCounts,
}

impl ProficiencyUpdate {
    /// New value of a node, if the run touched it.
    pub fn get(&self, node: NodeId) -> Option<f64> {
        self.values.get(&node).copied()
    }

    /// Whether the values were written to the proficiency store.
    pub fn is_persisted(&self) -> bool {
        self.states.last() == Some(&RunState::Persisted)
    }
}
