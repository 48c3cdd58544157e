//! Weighted multi-hop traversal.
//!
//! Level-synchronous BFS from a start node over outgoing edges, with a depth
//! limit and a per-edge weight threshold. Unweighted edges are never followed.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::node::NodeId;

use super::Neighbor;
use super::index::EdgeData;

/// Configuration for a weighted traversal.
#[derive(Debug, Clone)]
pub struct TraversalConfig {
    /// Maximum hop depth from the start node.
    pub max_depth: usize,
    /// Minimum weight an edge must carry to be followed.
    pub min_weight: f64,
    /// Cap on the number of neighbors returned. `None` returns every
    /// reachable neighbor.
    pub max_results: Option<usize>,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            min_weight: 0.3,
            max_results: None,
        }
    }
}

/// Collect every node reachable from `start` within the configured depth.
///
/// Each neighbor is reported at its shortest hop distance. When several
/// paths of that length exist, the one with the highest weight product wins,
/// then the larger sample size. Output is ordered by `(depth, node)`.
pub fn weighted_bfs(
    graph: &DiGraph<NodeId, EdgeData>,
    start: NodeIndex,
    config: &TraversalConfig,
) -> Vec<Neighbor> {
    let mut seen: HashSet<NodeIndex> = HashSet::from([start]);
    let mut frontier: Vec<(NodeIndex, f64, u64)> = vec![(start, 1.0, u64::MAX)];
    let mut found: Vec<Neighbor> = Vec::new();

    for depth in 1..=config.max_depth {
        let mut level: HashMap<NodeIndex, (f64, u64)> = HashMap::new();

        for &(idx, path_weight, path_sample) in &frontier {
            for edge in graph.edges_directed(idx, Direction::Outgoing) {
                let Some(record) = edge.weight().weight.as_ref() else {
                    continue;
                };
                if record.weight < config.min_weight {
                    continue;
                }
                let target = edge.target();
                if seen.contains(&target) {
                    continue;
                }

                let candidate = (path_weight * record.weight, path_sample.min(record.sample_size));
                level
                    .entry(target)
                    .and_modify(|best| {
                        if candidate > *best {
                            *best = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
        }

        if level.is_empty() {
            break;
        }

        frontier = Vec::with_capacity(level.len());
        for (idx, (weight, sample_size)) in level {
            seen.insert(idx);
            frontier.push((idx, weight, sample_size));
            found.push(Neighbor {
                node: graph[idx],
                weight,
                sample_size,
                depth,
            });
        }
    }

    found.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.node.cmp(&b.node)));
    if let Some(limit) = config.max_results {
        if found.len() > limit {
            tracing::warn!(
                start = %graph[start],
                found = found.len(),
                limit,
                "truncating neighbor set"
            );
            found.truncate(limit);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use crate::graph::index::ConceptGraph;
    use crate::node::{ClusterId, KnowledgeNode};

    fn n(id: u64) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn graph_with_nodes(count: u64) -> ConceptGraph {
        let g = ConceptGraph::new();
        g.add_cluster(ClusterId(1), "c1");
        for id in 1..=count {
            g.insert_node(KnowledgeNode::new(n(id), "math", 5, ClusterId(1)))
                .unwrap();
        }
        g
    }

    fn weighted_edge(g: &ConceptGraph, from: u64, to: u64, weight: f64) {
        g.declare_edge(n(from), n(to));
        g.upsert_edge_weight(n(from), n(to), weight, 50).unwrap();
    }

    #[test]
    fn depth_limit_is_respected() {
        // 1 -> 2 -> 3 -> 4
        let g = graph_with_nodes(4);
        weighted_edge(&g, 1, 2, 0.9);
        weighted_edge(&g, 2, 3, 0.9);
        weighted_edge(&g, 3, 4, 0.9);

        let found = g.neighbors(n(1), 2, 0.3).unwrap();
        let ids: Vec<u64> = found.iter().map(|nb| nb.node.get()).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(found[1].depth, 2);
        assert!((found[1].weight - 0.81).abs() < 1e-12);
    }

    #[test]
    fn weak_edges_are_not_followed() {
        let g = graph_with_nodes(3);
        weighted_edge(&g, 1, 2, 0.2);
        weighted_edge(&g, 1, 3, 0.5);

        let found = g.neighbors(n(1), 2, 0.3).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].node, n(3));
    }

    #[test]
    fn unweighted_edges_are_not_followed() {
        let g = graph_with_nodes(2);
        g.declare_edge(n(1), n(2));
        assert!(g.neighbors(n(1), 2, 0.0).unwrap().is_empty());
    }

    #[test]
    fn shortest_depth_wins_over_stronger_longer_path() {
        // 1 -> 3 directly (0.4), and 1 -> 2 -> 3 (1.0 * 1.0)
        let g = graph_with_nodes(3);
        weighted_edge(&g, 1, 3, 0.4);
        weighted_edge(&g, 1, 2, 1.0);
        weighted_edge(&g, 2, 3, 1.0);

        let found = g.neighbors(n(1), 2, 0.3).unwrap();
        let three = found.iter().find(|nb| nb.node == n(3)).unwrap();
        assert_eq!(three.depth, 1);
        assert!((three.weight - 0.4).abs() < 1e-12);
    }

    #[test]
    fn cycles_never_return_the_start_node() {
        let g = graph_with_nodes(2);
        weighted_edge(&g, 1, 2, 0.9);
        weighted_edge(&g, 2, 1, 0.9);

        let found = g.neighbors(n(1), 2, 0.3).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].node, n(2));
    }

    #[test]
    fn strongest_path_of_equal_length_wins() {
        // 1 -> 2 -> 4 (0.9 * 0.5) and 1 -> 3 -> 4 (0.6 * 0.9)
        let g = graph_with_nodes(4);
        weighted_edge(&g, 1, 2, 0.9);
        weighted_edge(&g, 2, 4, 0.5);
        weighted_edge(&g, 1, 3, 0.6);
        weighted_edge(&g, 3, 4, 0.9);

        let found = g.neighbors(n(1), 2, 0.3).unwrap();
        let four = found.iter().find(|nb| nb.node == n(4)).unwrap();
        assert!((four.weight - 0.54).abs() < 1e-12);
    }

    /// Star graph: node 1 with a 0.9 edge to each of `2..=count`.
    fn star(count: u64) -> (DiGraph<NodeId, EdgeData>, NodeIndex) {
        let mut graph = DiGraph::new();
        let hub = graph.add_node(n(1));
        for id in 2..=count {
            let leaf = graph.add_node(n(id));
            let weight = crate::graph::EdgeWeight {
                weight: 0.9,
                sample_size: 10,
                calculated_at: 0,
                version: id,
            };
            graph.add_edge(
                hub,
                leaf,
                EdgeData {
                    weight: Some(std::sync::Arc::new(weight)),
                },
            );
        }
        (graph, hub)
    }

    #[test]
    fn wide_fan_out_is_returned_in_full() {
        let (graph, hub) = star(12_001);
        let found = weighted_bfs(&graph, hub, &TraversalConfig::default());
        assert_eq!(found.len(), 12_000);
    }

    #[test]
    fn explicit_cap_truncates_in_node_order() {
        let (graph, hub) = star(6);
        let config = TraversalConfig {
            max_results: Some(2),
            ..Default::default()
        };
        let ids: Vec<u64> = weighted_bfs(&graph, hub, &config)
            .iter()
            .map(|nb| nb.node.get())
            .collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
