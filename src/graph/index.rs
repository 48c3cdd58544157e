//! In-memory concept graph.
//!
//! Uses `petgraph` for the edge structure and `DashMap` for O(1) lookups by
//! [`NodeId`]. Edge weights are held behind `Arc` and replaced wholesale under
//! the graph write lock, so readers observe either the old or the new record.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::GraphError;
use crate::node::{ClusterId, KnowledgeNode, NodeId, now_secs};

use super::traverse::{TraversalConfig, weighted_bfs};
use super::{
    Cluster, Edge, EdgeWeight, EdgeWeightUpdate, GraphResult, GraphStore, Neighbor,
    validate_weight,
};

/// Edge payload stored on petgraph edges.
#[derive(Debug, Clone, Default)]
pub struct EdgeData {
    /// `None` until the edge weight calculator has enough data.
    pub weight: Option<Arc<EdgeWeight>>,
}

#[derive(Debug, Clone)]
struct ClusterEntry {
    name: String,
    centroid: Option<NodeId>,
    members: BTreeSet<NodeId>,
}

/// In-memory concept graph backed by petgraph.
///
/// Nodes without metadata can exist in the edge structure when an edge was
/// declared before (or without) its endpoint being ingested. Such nodes are
/// reachable by traversal but unknown to [`GraphStore::node`].
pub struct ConceptGraph {
    /// The directed graph: nodes are NodeIds, edges carry optional weights.
    graph: RwLock<DiGraph<NodeId, EdgeData>>,
    /// NodeId → NodeIndex mapping for O(1) lookups.
    node_index: DashMap<NodeId, NodeIndex>,
    /// Node metadata.
    nodes: DashMap<NodeId, KnowledgeNode>,
    /// Cluster registry, ordered by id.
    clusters: RwLock<BTreeMap<ClusterId, ClusterEntry>>,
    /// Structural version.
    snapshot_id: AtomicU64,
    /// Version counter handed out to weight records.
    weight_version: AtomicU64,
    edge_count: AtomicUsize,
    /// Serializes snapshot loads so validation and merge see the same graph.
    pub(super) load_lock: Mutex<()>,
}

impl ConceptGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(DiGraph::new()),
            node_index: DashMap::new(),
            nodes: DashMap::new(),
            clusters: RwLock::new(BTreeMap::new()),
            snapshot_id: AtomicU64::new(0),
            weight_version: AtomicU64::new(0),
            edge_count: AtomicUsize::new(0),
            load_lock: Mutex::new(()),
        }
    }

    fn bump_snapshot(&self) {
        self.snapshot_id.fetch_add(1, Ordering::SeqCst);
    }

    /// Raise the structural version to at least `id`. Never lowers it.
    pub(crate) fn advance_snapshot_id(&self, id: u64) {
        self.snapshot_id.fetch_max(id, Ordering::SeqCst);
    }

    /// Check whether a cluster is registered.
    pub fn has_cluster(&self, id: ClusterId) -> bool {
        self.clusters
            .read()
            .expect("cluster lock poisoned")
            .contains_key(&id)
    }

    /// Ensure a graph node exists for the given id, returning its NodeIndex.
    fn ensure_node(&self, id: NodeId) -> NodeIndex {
        if let Some(idx) = self.node_index.get(&id) {
            return *idx.value();
        }
        let mut graph = self.graph.write().expect("graph lock poisoned");
        // Double-check after acquiring write lock
        if let Some(idx) = self.node_index.get(&id) {
            return *idx.value();
        }
        let idx = graph.add_node(id);
        self.node_index.insert(id, idx);
        idx
    }

    /// Register a cluster. Returns `false` if it already existed.
    pub fn add_cluster(&self, id: ClusterId, name: impl Into<String>) -> bool {
        let mut clusters = self.clusters.write().expect("cluster lock poisoned");
        if clusters.contains_key(&id) {
            return false;
        }
        clusters.insert(
            id,
            ClusterEntry {
                name: name.into(),
                centroid: None,
                members: BTreeSet::new(),
            },
        );
        true
    }

    /// Insert a node into its (already registered) cluster.
    pub fn insert_node(&self, node: KnowledgeNode) -> GraphResult<()> {
        let mut clusters = self.clusters.write().expect("cluster lock poisoned");
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode {
                node_id: node.id.get(),
            });
        }
        let entry = clusters
            .get_mut(&node.cluster)
            .ok_or(GraphError::ClusterNotFound {
                cluster_id: node.cluster.0,
            })?;
        entry.members.insert(node.id);
        self.ensure_node(node.id);
        self.nodes.insert(node.id, node);
        drop(clusters);

        self.bump_snapshot();
        Ok(())
    }

    /// Declare a directed edge `from → to` without a weight.
    ///
    /// Endpoints that have not been ingested are created as bare graph nodes.
    /// Returns `false` if the edge was already declared.
    pub fn declare_edge(&self, from: NodeId, to: NodeId) -> bool {
        if !self.nodes.contains_key(&from) || !self.nodes.contains_key(&to) {
            tracing::debug!(%from, %to, "declaring edge with an endpoint that has no metadata");
        }
        let from_idx = self.ensure_node(from);
        let to_idx = self.ensure_node(to);

        {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            if graph.find_edge(from_idx, to_idx).is_some() {
                return false;
            }
            graph.add_edge(from_idx, to_idx, EdgeData::default());
        }
        self.edge_count.fetch_add(1, Ordering::Relaxed);
        self.bump_snapshot();
        true
    }

    /// Move a node to another cluster.
    ///
    /// If the node was the centroid of its old cluster, that centroid is unset.
    pub fn reassign_cluster(&self, id: NodeId, cluster: ClusterId) -> GraphResult<()> {
        let mut clusters = self.clusters.write().expect("cluster lock poisoned");
        if !clusters.contains_key(&cluster) {
            return Err(GraphError::ClusterNotFound {
                cluster_id: cluster.0,
            });
        }
        let mut node = self
            .nodes
            .get_mut(&id)
            .ok_or(GraphError::NodeNotFound { node_id: id.get() })?;
        let old = node.cluster;
        if old == cluster {
            return Ok(());
        }
        node.cluster = cluster;
        drop(node);

        if let Some(entry) = clusters.get_mut(&old) {
            entry.members.remove(&id);
            if entry.centroid == Some(id) {
                entry.centroid = None;
            }
        }
        if let Some(entry) = clusters.get_mut(&cluster) {
            entry.members.insert(id);
        }
        drop(clusters);

        tracing::info!(node = %id, from = %old, to = %cluster, "reassigned node cluster");
        self.bump_snapshot();
        Ok(())
    }

    /// Current weight record of an edge, if declared and weighted.
    pub fn edge_weight(&self, from: NodeId, to: NodeId) -> Option<EdgeWeight> {
        let from_idx = *self.node_index.get(&from)?.value();
        let to_idx = *self.node_index.get(&to)?.value();
        let graph = self.graph.read().expect("graph lock poisoned");
        let edge = graph.find_edge(from_idx, to_idx)?;
        graph
            .edge_weight(edge)
            .and_then(|data| data.weight.as_deref().cloned())
    }

    /// Check if a node with metadata exists.
    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes with metadata.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of declared edges.
    pub fn edge_count(&self) -> usize {
        self.edge_count.load(Ordering::Relaxed)
    }

    /// Number of declared edges that carry a weight.
    pub fn weighted_edge_count(&self) -> usize {
        let graph = self.graph.read().expect("graph lock poisoned");
        graph
            .edge_weights()
            .filter(|data| data.weight.is_some())
            .count()
    }

    /// Number of clusters.
    pub fn cluster_count(&self) -> usize {
        self.clusters.read().expect("cluster lock poisoned").len()
    }

    /// All node metadata, ascending by id.
    pub fn all_nodes(&self) -> Vec<KnowledgeNode> {
        let mut nodes: Vec<KnowledgeNode> =
            self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    fn make_weight(&self, weight: f64, sample_size: u64, calculated_at: u64) -> Arc<EdgeWeight> {
        Arc::new(EdgeWeight {
            weight,
            sample_size,
            calculated_at,
            version: self.weight_version.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    /// Restore a weight record verbatim (timestamp included), e.g. from a snapshot.
    pub(crate) fn restore_edge_weight(
        &self,
        from: NodeId,
        to: NodeId,
        weight: f64,
        sample_size: u64,
        calculated_at: u64,
    ) -> GraphResult<()> {
        validate_weight(from, to, weight, sample_size)?;
        let record = self.make_weight(weight, sample_size, calculated_at);
        self.replace_weights(&[(from, to, record)])
    }

    /// Swap in a set of weight records under a single write lock.
    ///
    /// All edges are checked before any record is replaced.
    fn replace_weights(&self, records: &[(NodeId, NodeId, Arc<EdgeWeight>)]) -> GraphResult<()> {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        let mut targets = Vec::with_capacity(records.len());
        for (from, to, _) in records {
            let edge = self
                .node_index
                .get(from)
                .map(|i| *i.value())
                .zip(self.node_index.get(to).map(|i| *i.value()))
                .and_then(|(a, b)| graph.find_edge(a, b))
                .ok_or(GraphError::EdgeNotDeclared {
                    from: from.get(),
                    to: to.get(),
                })?;
            targets.push(edge);
        }
        for (edge, (_, _, record)) in targets.into_iter().zip(records) {
            if let Some(data) = graph.edge_weight_mut(edge) {
                data.weight = Some(Arc::clone(record));
            }
        }
        Ok(())
    }
}

impl GraphStore for ConceptGraph {
    fn node(&self, id: NodeId) -> GraphResult<Option<KnowledgeNode>> {
        Ok(self.nodes.get(&id).map(|n| n.value().clone()))
    }

    fn neighbors(
        &self,
        id: NodeId,
        max_depth: usize,
        min_weight: f64,
    ) -> GraphResult<Vec<Neighbor>> {
        let start = match self.node_index.get(&id) {
            Some(idx) => *idx.value(),
            None => return Err(GraphError::NodeNotFound { node_id: id.get() }),
        };
        let graph = self.graph.read().expect("graph lock poisoned");
        Ok(weighted_bfs(
            &graph,
            start,
            &TraversalConfig {
                max_depth,
                min_weight,
                ..Default::default()
            },
        ))
    }

    fn cluster_nodes(&self, cluster: ClusterId) -> GraphResult<Vec<NodeId>> {
        let clusters = self.clusters.read().expect("cluster lock poisoned");
        clusters
            .get(&cluster)
            .map(|entry| entry.members.iter().copied().collect())
            .ok_or(GraphError::ClusterNotFound {
                cluster_id: cluster.0,
            })
    }

    fn clusters(&self) -> GraphResult<Vec<Cluster>> {
        let clusters = self.clusters.read().expect("cluster lock poisoned");
        Ok(clusters
            .iter()
            .map(|(&id, entry)| Cluster {
                id,
                name: entry.name.clone(),
                centroid: entry.centroid,
                node_count: entry.members.len(),
            })
            .collect())
    }

    fn degree(&self, id: NodeId) -> GraphResult<(usize, usize)> {
        let idx = match self.node_index.get(&id) {
            Some(idx) => *idx.value(),
            None => return Err(GraphError::NodeNotFound { node_id: id.get() }),
        };
        let graph = self.graph.read().expect("graph lock poisoned");
        let in_degree = graph.edges_directed(idx, Direction::Incoming).count();
        let out_degree = graph.edges_directed(idx, Direction::Outgoing).count();
        Ok((in_degree, out_degree))
    }

    fn declared_edges(&self) -> GraphResult<Vec<Edge>> {
        let graph = self.graph.read().expect("graph lock poisoned");
        let mut edges: Vec<Edge> = graph
            .edge_indices()
            .filter_map(|ei| {
                let (src, dst) = graph.edge_endpoints(ei)?;
                let data = graph.edge_weight(ei)?;
                Some(Edge {
                    from: *graph.node_weight(src)?,
                    to: *graph.node_weight(dst)?,
                    weight: data.weight.as_deref().cloned(),
                })
            })
            .collect();
        edges.sort_by(|a, b| a.from.cmp(&b.from).then(a.to.cmp(&b.to)));
        Ok(edges)
    }

    fn snapshot_id(&self) -> GraphResult<u64> {
        Ok(self.snapshot_id.load(Ordering::SeqCst))
    }

    fn upsert_edge_weight(
        &self,
        from: NodeId,
        to: NodeId,
        weight: f64,
        sample_size: u64,
    ) -> GraphResult<()> {
        validate_weight(from, to, weight, sample_size)?;
        let record = self.make_weight(weight, sample_size, now_secs());
        self.replace_weights(&[(from, to, record)])
    }

    fn apply_edge_weights(&self, updates: &[EdgeWeightUpdate]) -> GraphResult<()> {
        for u in updates {
            validate_weight(u.from, u.to, u.weight, u.sample_size)?;
        }
        let now = now_secs();
        let records: Vec<(NodeId, NodeId, Arc<EdgeWeight>)> = updates
            .iter()
            .map(|u| (u.from, u.to, self.make_weight(u.weight, u.sample_size, now)))
            .collect();
        self.replace_weights(&records)
    }

    fn set_centroid(&self, cluster: ClusterId, centroid: Option<NodeId>) -> GraphResult<()> {
        let mut clusters = self.clusters.write().expect("cluster lock poisoned");
        let entry = clusters
            .get_mut(&cluster)
            .ok_or(GraphError::ClusterNotFound {
                cluster_id: cluster.0,
            })?;
        if let Some(node) = centroid {
            if !entry.members.contains(&node) {
                return Err(GraphError::NodeNotFound { node_id: node.get() });
            }
        }
        entry.centroid = centroid;
        Ok(())
    }
}

impl Default for ConceptGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConceptGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConceptGraph")
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .field("snapshot_id", &self.snapshot_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u64) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn two_cluster_graph() -> ConceptGraph {
        let g = ConceptGraph::new();
        g.add_cluster(ClusterId(1), "fractions");
        g.add_cluster(ClusterId(2), "decimals");
        g.insert_node(KnowledgeNode::new(n(1), "math", 5, ClusterId(1)))
            .unwrap();
        g.insert_node(KnowledgeNode::new(n(2), "math", 5, ClusterId(1)))
            .unwrap();
        g.insert_node(KnowledgeNode::new(n(3), "math", 5, ClusterId(2)))
            .unwrap();
        g
    }

    #[test]
    fn insert_and_query() {
        let g = two_cluster_graph();
        assert!(g.has_node(n(1)));
        assert_eq!(g.node_count(), 3);
        assert_eq!(g.cluster_nodes(ClusterId(1)).unwrap(), vec![n(1), n(2)]);

        let clusters = g.clusters().unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].node_count, 2);
        assert_eq!(clusters[1].node_count, 1);
    }

    #[test]
    fn duplicate_node_rejected() {
        let g = two_cluster_graph();
        let err = g
            .insert_node(KnowledgeNode::new(n(1), "math", 5, ClusterId(2)))
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode { node_id: 1 }));
    }

    #[test]
    fn node_requires_registered_cluster() {
        let g = ConceptGraph::new();
        let err = g
            .insert_node(KnowledgeNode::new(n(1), "math", 5, ClusterId(9)))
            .unwrap_err();
        assert!(matches!(err, GraphError::ClusterNotFound { cluster_id: 9 }));
    }

    #[test]
    fn declare_edge_is_idempotent() {
        let g = two_cluster_graph();
        assert!(g.declare_edge(n(1), n(2)));
        assert!(!g.declare_edge(n(1), n(2)));
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.degree(n(1)).unwrap(), (0, 1));
        assert_eq!(g.degree(n(2)).unwrap(), (1, 0));
    }

    #[test]
    fn weight_requires_declared_edge() {
        let g = two_cluster_graph();
        let err = g.upsert_edge_weight(n(1), n(2), 0.5, 10).unwrap_err();
        assert!(matches!(err, GraphError::EdgeNotDeclared { from: 1, to: 2 }));
    }

    #[test]
    fn weight_write_replaces_record() {
        let g = two_cluster_graph();
        g.declare_edge(n(1), n(2));
        g.upsert_edge_weight(n(1), n(2), 0.5, 10).unwrap();
        let first = g.edge_weight(n(1), n(2)).unwrap();
        g.upsert_edge_weight(n(1), n(2), 0.7, 20).unwrap();
        let second = g.edge_weight(n(1), n(2)).unwrap();

        assert!((second.weight - 0.7).abs() < 1e-12);
        assert_eq!(second.sample_size, 20);
        assert!(second.version > first.version);
        assert_eq!(g.weighted_edge_count(), 1);
    }

    #[test]
    fn batch_weight_write_is_all_or_nothing() {
        let g = two_cluster_graph();
        g.declare_edge(n(1), n(2));
        let updates = vec![
            EdgeWeightUpdate {
                from: n(1),
                to: n(2),
                weight: 0.6,
                sample_size: 10,
            },
            EdgeWeightUpdate {
                from: n(2),
                to: n(3),
                weight: 0.6,
                sample_size: 10,
            },
        ];
        assert!(g.apply_edge_weights(&updates).is_err());
        assert!(g.edge_weight(n(1), n(2)).is_none());
    }

    #[test]
    fn weight_writes_do_not_change_snapshot_id() {
        let g = two_cluster_graph();
        g.declare_edge(n(1), n(2));
        let before = g.snapshot_id().unwrap();
        g.upsert_edge_weight(n(1), n(2), 0.5, 10).unwrap();
        assert_eq!(g.snapshot_id().unwrap(), before);
        g.declare_edge(n(2), n(3));
        assert!(g.snapshot_id().unwrap() > before);
    }

    #[test]
    fn reassign_cluster_moves_membership() {
        let g = two_cluster_graph();
        g.set_centroid(ClusterId(1), Some(n(2))).unwrap();
        g.reassign_cluster(n(2), ClusterId(2)).unwrap();

        assert_eq!(g.cluster_nodes(ClusterId(1)).unwrap(), vec![n(1)]);
        assert_eq!(g.cluster_nodes(ClusterId(2)).unwrap(), vec![n(2), n(3)]);
        assert_eq!(g.node(n(2)).unwrap().unwrap().cluster, ClusterId(2));
        let old = &g.clusters().unwrap()[0];
        assert_eq!(old.centroid, None);
    }

    #[test]
    fn centroid_must_be_a_member() {
        let g = two_cluster_graph();
        assert!(g.set_centroid(ClusterId(1), Some(n(3))).is_err());
        g.set_centroid(ClusterId(1), Some(n(1))).unwrap();
        assert_eq!(g.clusters().unwrap()[0].centroid, Some(n(1)));
    }

    #[test]
    fn edge_to_unknown_node_is_traversable_but_has_no_metadata() {
        let g = two_cluster_graph();
        g.declare_edge(n(1), n(99));
        g.upsert_edge_weight(n(1), n(99), 0.9, 5).unwrap();

        let found = g.neighbors(n(1), 1, 0.3).unwrap();
        assert_eq!(found[0].node, n(99));
        assert!(g.node(n(99)).unwrap().is_none());
    }

    #[test]
    fn concurrent_readers_see_whole_weight_records() {
        let g = Arc::new(two_cluster_graph());
        g.declare_edge(n(1), n(2));
        g.upsert_edge_weight(n(1), n(2), 0.1, 100).unwrap();

        let writer = {
            let g = Arc::clone(&g);
            std::thread::spawn(move || {
                for i in 1..=200u64 {
                    // weight and sample size always move together
                    g.upsert_edge_weight(n(1), n(2), i as f64 / 200.0, i * 1000)
                        .unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let g = Arc::clone(&g);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let w = g.edge_weight(n(1), n(2)).unwrap();
                        if w.sample_size != 100 {
                            let expected = w.sample_size as f64 / 200_000.0;
                            assert!((w.weight - expected).abs() < 1e-12);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
