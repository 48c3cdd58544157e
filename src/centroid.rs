//! Centroid selection for adaptive assessment.
//!
//! For every cluster of a subject and grade, the centroid is the best
//! connected member that can actually be assessed: members are ranked by
//! total degree (descending, ties by ascending node id) and the first one with
//! both an easy and a hard item in the item bank is chosen. Clusters without
//! such a member are reported as unavailable rather than silently dropped.
//!
//! Selections are cached per `(subject, grade, cluster_count)`. A cached
//! selection may be served while a newer one is being computed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::graph::analytics::degree_centrality;
use crate::graph::{GraphResult, GraphStore};
use crate::item_bank::{ItemBank, ItemDifficulty};
use crate::node::{ClusterId, NodeId};
use crate::retry::RetryPolicy;

/// The centroid chosen for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CentroidChoice {
    pub cluster: ClusterId,
    pub node: NodeId,
    /// Total degree of the chosen node.
    pub degree: usize,
}

/// Result of one selection run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CentroidSelection {
    pub subject: String,
    pub grade: u8,
    /// Graph snapshot the selection was computed against.
    pub snapshot_id: u64,
    /// Chosen centroids, ascending by cluster id.
    pub centroids: Vec<CentroidChoice>,
    /// Clusters with no member carrying both an easy and a hard item.
    pub unavailable: Vec<ClusterId>,
}

impl CentroidSelection {
    /// `(cluster, centroid)` pairs in selection order.
    pub fn pairs(&self) -> Vec<(ClusterId, NodeId)> {
        self.centroids.iter().map(|c| (c.cluster, c.node)).collect()
    }

    /// Whether no centroid was selected.
    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }
}

type CacheKey = (String, u8, usize);

fn cache_key(subject: &str, grade: u8, cluster_count: usize) -> CacheKey {
    (subject.to_lowercase(), grade, cluster_count)
}

/// Chooses and caches cluster centroids.
pub struct CentroidSelector {
    graph: Arc<dyn GraphStore>,
    items: Arc<dyn ItemBank>,
    retry: RetryPolicy,
    cache: RwLock<HashMap<CacheKey, Arc<CentroidSelection>>>,
}

impl CentroidSelector {
    pub fn new(graph: Arc<dyn GraphStore>, items: Arc<dyn ItemBank>, retry: RetryPolicy) -> Self {
        Self {
            graph,
            items,
            retry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Compute a fresh selection, record the centroids on their clusters and
    /// replace the cached entry.
    ///
    /// Clusters are visited in ascending id order; only clusters with at least
    /// one member of the given subject and grade take part. Selection stops
    /// once `cluster_count` centroids were found (`0` means no limit).
    pub fn select(
        &self,
        subject: &str,
        grade: u8,
        cluster_count: usize,
    ) -> GraphResult<Arc<CentroidSelection>> {
        let snapshot_id = self.retry.run("snapshot_id", || self.graph.snapshot_id())?;
        let clusters = self.retry.run("clusters", || self.graph.clusters())?;

        let mut selection = CentroidSelection {
            subject: subject.to_string(),
            grade,
            snapshot_id,
            centroids: Vec::new(),
            unavailable: Vec::new(),
        };

        for cluster in clusters {
            if cluster_count > 0 && selection.centroids.len() >= cluster_count {
                break;
            }
            let members = self
                .retry
                .run("cluster_nodes", || self.graph.cluster_nodes(cluster.id))?;
            let meta = self.retry.run("nodes", || self.graph.nodes(&members))?;
            let candidates: Vec<NodeId> = members
                .into_iter()
                .filter(|id| meta.get(id).is_some_and(|n| n.matches(subject, grade)))
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let ranked = self.retry.run("degree", || {
                degree_centrality(self.graph.as_ref(), &candidates)
            })?;
            let choice = ranked.into_iter().find(|c| {
                self.items.has_items(c.node, ItemDifficulty::Easy)
                    && self.items.has_items(c.node, ItemDifficulty::Hard)
            });

            match choice {
                Some(c) => {
                    tracing::debug!(cluster = %cluster.id, node = %c.node, degree = c.total, "centroid selected");
                    self.retry
                        .run("set_centroid", || self.graph.set_centroid(cluster.id, Some(c.node)))?;
                    selection.centroids.push(CentroidChoice {
                        cluster: cluster.id,
                        node: c.node,
                        degree: c.total,
                    });
                }
                None => {
                    tracing::warn!(
                        cluster = %cluster.id,
                        candidates = candidates.len(),
                        "centroid unavailable: no member has both easy and hard items"
                    );
                    self.retry
                        .run("set_centroid", || self.graph.set_centroid(cluster.id, None))?;
                    selection.unavailable.push(cluster.id);
                }
            }
        }

        tracing::info!(
            subject,
            grade,
            selected = selection.centroids.len(),
            unavailable = selection.unavailable.len(),
            "centroid selection complete"
        );

        let selection = Arc::new(selection);
        self.cache
            .write()
            .expect("centroid cache lock poisoned")
            .insert(cache_key(subject, grade, cluster_count), Arc::clone(&selection));
        Ok(selection)
    }

    /// The last cached selection, which may be stale.
    pub fn cached(
        &self,
        subject: &str,
        grade: u8,
        cluster_count: usize,
    ) -> Option<Arc<CentroidSelection>> {
        self.cache
            .read()
            .expect("centroid cache lock poisoned")
            .get(&cache_key(subject, grade, cluster_count))
            .cloned()
    }

    /// The cached selection if it matches the current graph snapshot,
    /// otherwise a fresh one.
    pub fn current(
        &self,
        subject: &str,
        grade: u8,
        cluster_count: usize,
    ) -> GraphResult<Arc<CentroidSelection>> {
        let snapshot_id = self.retry.run("snapshot_id", || self.graph.snapshot_id())?;
        match self.cached(subject, grade, cluster_count) {
            Some(hit) if hit.snapshot_id == snapshot_id => Ok(hit),
            _ => self.select(subject, grade, cluster_count),
        }
    }

    /// Drop every cached selection.
    pub fn invalidate(&self) {
        self.cache.write().expect("centroid cache lock poisoned").clear();
    }
}

impl std::fmt::Debug for CentroidSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.cache.read().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("CentroidSelector")
            .field("cached", &cached)
            .finish()
    }
}
