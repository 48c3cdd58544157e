//! Concept graph: nodes, weighted prerequisite edges, and clusters.
//!
//! - **Data model**: [`Edge`], [`EdgeWeight`], [`Cluster`], [`Neighbor`]
//! - **Store seam** ([`GraphStore`]): the interface the propagation engine, the
//!   centroid selector and the edge weight calculator consume
//! - **In-memory implementation** ([`index::ConceptGraph`]): `petgraph` backed,
//!   with copy-on-write edge weights
//! - **Snapshots** ([`snapshot::GraphSnapshot`]): JSON ingestion and durable persistence

pub mod analytics;
pub mod index;
pub mod snapshot;
pub mod traverse;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::node::{ClusterId, KnowledgeNode, NodeId};

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// A computed weight on a directed edge A → B.
///
/// `weight` estimates P(B mastered | A mastered) from `sample_size` learners.
/// Records are replaced wholesale, never mutated in place, so a reader always
/// sees a complete record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeWeight {
    /// Conditional mastery probability in [0, 1].
    pub weight: f64,
    /// Number of learners the estimate is based on. Never zero.
    pub sample_size: u64,
    /// When the weight was computed (seconds since UNIX epoch).
    pub calculated_at: u64,
    /// Monotonic write version, increasing with every weight write.
    pub version: u64,
}

/// A declared directed edge, optionally carrying a computed weight.
///
/// Edges without a weight are excluded from traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub weight: Option<EdgeWeight>,
}

/// A named grouping of nodes used for coarse-grained estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    /// The representative node chosen by the last centroid selection.
    pub centroid: Option<NodeId>,
    pub node_count: usize,
}

/// A node reachable from a traversal start, with its effective weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub node: NodeId,
    /// Edge weight for depth 1, product of path weights for deeper hops.
    pub weight: f64,
    /// Smallest sample size along the path.
    pub sample_size: u64,
    /// Hop count from the start node.
    pub depth: usize,
}

/// One weight write produced by the edge weight calculator.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeWeightUpdate {
    pub from: NodeId,
    pub to: NodeId,
    pub weight: f64,
    pub sample_size: u64,
}

/// The graph store seam.
///
/// Implementations must be safe to share between threads. Transient
/// failures are reported as [`GraphError::Unavailable`]; callers retry those
/// with backoff and never treat them as an empty result.
pub trait GraphStore: Send + Sync {
    /// Look up a node's metadata.
    fn node(&self, id: NodeId) -> GraphResult<Option<KnowledgeNode>>;

    /// Look up several nodes at once. Missing nodes are absent from the map.
    fn nodes(&self, ids: &[NodeId]) -> GraphResult<HashMap<NodeId, KnowledgeNode>> {
        let mut found = HashMap::with_capacity(ids.len());
        for &id in ids {
            if let Some(node) = self.node(id)? {
                found.insert(id, node);
            }
        }
        Ok(found)
    }

    /// Nodes reachable by outgoing weighted edges within `max_depth` hops,
    /// following only edges whose weight is at least `min_weight`.
    ///
    /// The start node is never part of the result. Output is ordered by
    /// `(depth, node)`.
    fn neighbors(&self, id: NodeId, max_depth: usize, min_weight: f64)
    -> GraphResult<Vec<Neighbor>>;

    /// Members of a cluster, ascending by node id.
    fn cluster_nodes(&self, cluster: ClusterId) -> GraphResult<Vec<NodeId>>;

    /// All clusters, ascending by id.
    fn clusters(&self) -> GraphResult<Vec<Cluster>>;

    /// `(in_degree, out_degree)` over declared edges, weighted or not.
    fn degree(&self, id: NodeId) -> GraphResult<(usize, usize)>;

    /// Every declared edge, ordered by `(from, to)`.
    fn declared_edges(&self) -> GraphResult<Vec<Edge>>;

    /// Structural version of the graph. Changes whenever nodes, edges or
    /// cluster membership change; weight writes do not change it.
    fn snapshot_id(&self) -> GraphResult<u64>;

    /// Write the weight of a single declared edge.
    fn upsert_edge_weight(
        &self,
        from: NodeId,
        to: NodeId,
        weight: f64,
        sample_size: u64,
    ) -> GraphResult<()>;

    /// Write a batch of weights. Implementations that can apply the batch
    /// atomically should override this.
    fn apply_edge_weights(&self, updates: &[EdgeWeightUpdate]) -> GraphResult<()> {
        for u in updates {
            self.upsert_edge_weight(u.from, u.to, u.weight, u.sample_size)?;
        }
        Ok(())
    }

    /// Record the centroid chosen for a cluster.
    fn set_centroid(&self, cluster: ClusterId, centroid: Option<NodeId>) -> GraphResult<()>;
}

/// Check that a weight write is storable.
pub(crate) fn validate_weight(
    from: NodeId,
    to: NodeId,
    weight: f64,
    sample_size: u64,
) -> GraphResult<()> {
    if sample_size == 0 {
        return Err(GraphError::ZeroSampleSize {
            from: from.get(),
            to: to.get(),
        });
    }
    if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
        return Err(GraphError::InvalidWeight {
            from: from.get(),
            to: to.get(),
            weight,
        });
    }
    Ok(())
}
