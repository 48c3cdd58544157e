//! Proficiency storage.
//!
//! Two backends serve the same [`ProficiencyStore`] seam:
//!
//! - [`mem::MemProficiencyStore`]: concurrent in-memory maps (DashMap)
//! - [`durable::DurableStore`]: ACID transactions (redb)
//!
//! Both also implement [`MasteryHistory`], the cohort view the edge weight
//! calculator reads from.

pub mod durable;
pub mod mem;

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::node::{NodeId, UserId};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Proficiency assumed for a node a learner has never been scored on.
pub const DEFAULT_PROFICIENCY: f64 = 0.4;

/// Stored proficiency of one learner on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProficiencyRecord {
    /// Estimated mastery in [0, 1].
    pub proficiency: f64,
    /// Number of times this record has been written.
    pub interactions_count: u64,
    /// Last write (seconds since UNIX epoch).
    pub last_updated: u64,
}

impl ProficiencyRecord {
    /// The record that results from writing `value` over `previous`.
    pub fn next(previous: Option<&ProficiencyRecord>, value: f64, now: u64) -> Self {
        Self {
            proficiency: value.clamp(0.0, 1.0),
            interactions_count: previous.map_or(0, |p| p.interactions_count) + 1,
            last_updated: now,
        }
    }
}

/// Reject values a store must never hold.
pub(crate) fn check_value(node: NodeId, value: f64) -> StoreResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(StoreError::InvalidValue {
            node_id: node.get(),
            value,
        })
    }
}

/// The proficiency store seam.
///
/// `batch_get` and `batch_upsert` are each a single store operation: reads
/// never observe half of a batch, and a failed batch writes nothing.
pub trait ProficiencyStore: Send + Sync {
    /// Proficiency for each requested node, substituting the store's default
    /// for nodes without a record. Every requested node is in the result.
    fn batch_get(&self, user: UserId, nodes: &[NodeId]) -> StoreResult<HashMap<NodeId, f64>>;

    /// Write all values in one atomic operation. Values are clamped to [0, 1].
    fn batch_upsert(&self, user: UserId, values: &BTreeMap<NodeId, f64>) -> StoreResult<()>;

    /// Full stored records for the requested nodes. Nodes without a record
    /// are absent.
    fn records(
        &self,
        user: UserId,
        nodes: &[NodeId],
    ) -> StoreResult<HashMap<NodeId, ProficiencyRecord>>;

    /// Every stored record of a learner, ascending by node.
    fn user_records(&self, user: UserId) -> StoreResult<BTreeMap<NodeId, ProficiencyRecord>>;

    /// The value substituted for unknown nodes.
    fn default_proficiency(&self) -> f64 {
        DEFAULT_PROFICIENCY
    }
}

/// Historical cohort view used to estimate edge weights.
pub trait MasteryHistory: Send + Sync {
    /// Learners whose stored proficiency on `node` is strictly above `threshold`.
    fn mastered_by(&self, node: NodeId, threshold: f64) -> StoreResult<HashSet<UserId>>;

    /// [`mastered_by`](Self::mastered_by) for several nodes in one read.
    ///
    /// Every requested node has an entry, empty when no learner mastered it.
    fn mastered_sets(
        &self,
        nodes: &[NodeId],
        threshold: f64,
    ) -> StoreResult<HashMap<NodeId, HashSet<UserId>>> {
        nodes
            .iter()
            .map(|&node| Ok((node, self.mastered_by(node, threshold)?)))
            .collect()
    }
}
