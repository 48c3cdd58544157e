//! Graph analytics: degree centrality over node subsets.
//!
//! Functions operate on any [`GraphStore`] and return results in a
//! deterministic order (total degree desc, then node id asc).

use std::cmp::Ordering;

use crate::node::NodeId;

use super::{GraphResult, GraphStore};

/// Degree centrality metrics for a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegreeCentrality {
    /// The node this measurement belongs to.
    pub node: NodeId,
    /// Number of incoming edges.
    pub in_degree: usize,
    /// Number of outgoing edges.
    pub out_degree: usize,
    /// Total degree (in + out).
    pub total: usize,
}

/// Ranking order: highest total degree first, ties by ascending node id.
pub fn by_degree_desc(a: &DegreeCentrality, b: &DegreeCentrality) -> Ordering {
    b.total.cmp(&a.total).then(a.node.cmp(&b.node))
}

/// Compute degree centrality for the given nodes, ranked by [`by_degree_desc`].
pub fn degree_centrality<G: GraphStore + ?Sized>(
    graph: &G,
    nodes: &[NodeId],
) -> GraphResult<Vec<DegreeCentrality>> {
    let mut results = Vec::with_capacity(nodes.len());
    for &node in nodes {
        let (in_degree, out_degree) = graph.degree(node)?;
        results.push(DegreeCentrality {
            node,
            in_degree,
            out_degree,
            total: in_degree + out_degree,
        });
    }
    results.sort_by(by_degree_desc);
    Ok(results)
}
