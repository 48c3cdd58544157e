//! Serializable graph snapshots.
//!
//! A [`GraphSnapshot`] is the exchange format for the concept graph: JSON for
//! ingestion from curriculum tooling, bincode for durable persistence.
//!
//! ```json
//! {
//!   "clusters": [{"id": 1, "name": "fractions"}],
//!   "nodes": [{"id": 10, "subject": "math", "grade": 5, "cluster": 1}],
//!   "edges": [{"from": 10, "to": 11, "weight": 0.8, "sample_size": 120}]
//! }
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, GraphError, StoreError};
use crate::node::{ClusterId, KnowledgeNode, NodeId};

use super::index::ConceptGraph;
use super::{GraphResult, GraphStore, validate_weight};

/// Cluster entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub id: ClusterId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub centroid: Option<NodeId>,
}

/// Declared edge in a snapshot, with its weight if one has been computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub sample_size: Option<u64>,
    #[serde(default)]
    pub calculated_at: Option<u64>,
}

/// Full structural and weight state of a concept graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,
    #[serde(default)]
    pub nodes: Vec<KnowledgeNode>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Structural version of the graph the snapshot was taken from. Loading
    /// never moves the target graph's version below it.
    #[serde(default)]
    pub snapshot_id: u64,
}

/// Counts from loading a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub clusters: usize,
    pub nodes: usize,
    pub edges: usize,
    pub weighted_edges: usize,
    /// Weights dropped because their sample size was zero.
    pub dropped_weights: usize,
}

impl GraphSnapshot {
    /// Parse a snapshot from JSON.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::GraphLoad {
            message: e.to_string(),
        })
    }

    /// Render the snapshot as pretty JSON.
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::GraphLoad {
            message: e.to_string(),
        })
    }

    /// Encode for durable storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(self).map_err(|e| StoreError::Serialization {
            message: format!("failed to serialize graph snapshot: {e}"),
        })
    }

    /// Decode from durable storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
            message: format!("failed to deserialize graph snapshot: {e}"),
        })
    }
}

impl ConceptGraph {
    /// Build a new graph from a snapshot.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> GraphResult<(Self, LoadReport)> {
        let graph = Self::new();
        let report = graph.load_snapshot(snapshot)?;
        Ok((graph, report))
    }

    /// Merge a snapshot into this graph.
    ///
    /// The whole snapshot is checked against the current graph before
    /// anything is written, so a rejected snapshot leaves the graph as it
    /// was. Clusters are registered first, then nodes, then edges and their
    /// weights, then recorded centroids. Weights with a zero sample size are
    /// dropped and the edge stays unweighted.
    pub fn load_snapshot(&self, snapshot: &GraphSnapshot) -> GraphResult<LoadReport> {
        let _guard = self.load_lock.lock().expect("load lock poisoned");
        self.check_snapshot(snapshot)?;

        let mut report = LoadReport::default();
        for cluster in &snapshot.clusters {
            if self.add_cluster(cluster.id, cluster.name.clone()) {
                report.clusters += 1;
            }
        }
        for node in &snapshot.nodes {
            self.insert_node(node.clone())?;
            report.nodes += 1;
        }
        for edge in &snapshot.edges {
            if self.declare_edge(edge.from, edge.to) {
                report.edges += 1;
            }
            match (edge.weight, edge.sample_size) {
                (Some(_), Some(0)) | (Some(_), None) => {
                    tracing::warn!(
                        from = %edge.from,
                        to = %edge.to,
                        "dropping edge weight without a sample size"
                    );
                    report.dropped_weights += 1;
                }
                (Some(weight), Some(sample_size)) => {
                    let calculated_at = edge.calculated_at.unwrap_or_else(crate::node::now_secs);
                    self.restore_edge_weight(edge.from, edge.to, weight, sample_size, calculated_at)?;
                    report.weighted_edges += 1;
                }
                (None, _) => {}
            }
        }
        for cluster in &snapshot.clusters {
            if let Some(centroid) = cluster.centroid {
                if let Err(e) = self.set_centroid(cluster.id, Some(centroid)) {
                    tracing::warn!(cluster = %cluster.id, error = %e, "ignoring stale centroid");
                }
            }
        }
        self.advance_snapshot_id(snapshot.snapshot_id);

        tracing::info!(
            clusters = report.clusters,
            nodes = report.nodes,
            edges = report.edges,
            weighted = report.weighted_edges,
            "loaded graph snapshot"
        );
        Ok(report)
    }

    /// Reject snapshots that would fail part-way through a merge.
    fn check_snapshot(&self, snapshot: &GraphSnapshot) -> GraphResult<()> {
        let incoming_clusters: HashSet<ClusterId> =
            snapshot.clusters.iter().map(|c| c.id).collect();
        let mut incoming_nodes: HashSet<NodeId> = HashSet::with_capacity(snapshot.nodes.len());
        for node in &snapshot.nodes {
            if self.has_node(node.id) || !incoming_nodes.insert(node.id) {
                return Err(GraphError::DuplicateNode {
                    node_id: node.id.get(),
                });
            }
            if !incoming_clusters.contains(&node.cluster) && !self.has_cluster(node.cluster) {
                return Err(GraphError::ClusterNotFound {
                    cluster_id: node.cluster.0,
                });
            }
        }
        for edge in &snapshot.edges {
            if let (Some(weight), Some(sample_size)) = (edge.weight, edge.sample_size) {
                if sample_size > 0 {
                    validate_weight(edge.from, edge.to, weight, sample_size)?;
                }
            }
        }
        Ok(())
    }

    /// Capture the current graph state.
    pub fn to_snapshot(&self) -> GraphResult<GraphSnapshot> {
        let clusters = self
            .clusters()?
            .into_iter()
            .map(|c| ClusterSpec {
                id: c.id,
                name: c.name,
                centroid: c.centroid,
            })
            .collect();
        let edges = self
            .declared_edges()?
            .into_iter()
            .map(|e| EdgeSpec {
                from: e.from,
                to: e.to,
                weight: e.weight.as_ref().map(|w| w.weight),
                sample_size: e.weight.as_ref().map(|w| w.sample_size),
                calculated_at: e.weight.as_ref().map(|w| w.calculated_at),
            })
            .collect();
        Ok(GraphSnapshot {
            clusters,
            nodes: self.all_nodes(),
            edges,
            snapshot_id: self.snapshot_id()?,
        })
    }
}
