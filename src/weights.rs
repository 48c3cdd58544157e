//! Edge weight calculator.
//!
//! Offline batch job estimating, for every declared edge A → B, the
//! conditional probability that a learner who mastered A also mastered B:
//!
//! ```text
//! masteredA    = |{ u : P(u, A) > threshold }|
//! masteredBoth = |{ u ∈ masteredA : P(u, B) > threshold }|
//! weight       = masteredBoth / masteredA      sample_size = masteredA
//! ```
//!
//! Edges with `masteredA = 0` are skipped and keep whatever weight they had.
//! Per-edge read failures are collected; if too many edges fail, the whole run
//! is rejected and no weight is written.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::EdgeWeightError;
use crate::graph::{Edge, EdgeWeightUpdate, GraphStore};
use crate::node::{NodeId, UserId};
use crate::retry::RetryPolicy;
use crate::store::MasteryHistory;

/// Result type for edge weight recalculation.
pub type WeightResult<T> = std::result::Result<T, EdgeWeightError>;

/// Configuration for the edge weight calculator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightConfig {
    /// Proficiency a learner must exceed to count as having mastered a node.
    #[serde(default = "default_mastery_threshold")]
    pub mastery_threshold: f64,
    /// Fraction of edges that must be recomputed without failure for the
    /// run to be committed.
    #[serde(default = "default_min_success_ratio")]
    pub min_success_ratio: f64,
    /// Compute edges on the rayon thread pool.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_mastery_threshold() -> f64 {
    0.7
}
fn default_min_success_ratio() -> f64 {
    0.99
}
fn default_parallel() -> bool {
    true
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            mastery_threshold: default_mastery_threshold(),
            min_success_ratio: default_min_success_ratio(),
            parallel: default_parallel(),
        }
    }
}

/// An edge that could not be recomputed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeFailure {
    pub from: NodeId,
    pub to: NodeId,
    pub message: String,
}

/// Outcome of a committed recalculation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecalculationReport {
    /// Graph snapshot the run was computed against.
    pub snapshot_id: u64,
    /// Declared edges considered.
    pub edges_total: usize,
    /// Edges whose weight was written.
    pub edges_updated: usize,
    /// Edges without mastery data on their source, or with an endpoint
    /// missing from the graph. These keep their previous weight.
    pub edges_skipped: usize,
    /// Edges whose history could not be read. These keep their previous weight.
    pub failures: Vec<EdgeFailure>,
}

enum EdgeOutcome {
    Updated(EdgeWeightUpdate),
    Skipped,
    Failed(EdgeFailure),
}

type MasterySet = Result<Arc<HashSet<UserId>>, String>;

/// Recomputes edge weights from cohort mastery history.
pub struct EdgeWeightCalculator {
    graph: Arc<dyn GraphStore>,
    history: Arc<dyn MasteryHistory>,
    config: WeightConfig,
    retry: RetryPolicy,
}

impl EdgeWeightCalculator {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        history: Arc<dyn MasteryHistory>,
        config: WeightConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            graph,
            history,
            config,
            retry,
        }
    }

    /// Recompute every declared edge against the given graph snapshot.
    ///
    /// Fails with [`EdgeWeightError::SnapshotMismatch`] if the graph changed
    /// since `snapshot_id` was taken, and with
    /// [`EdgeWeightError::TooManyFailures`] if the success ratio is below the
    /// configured minimum. In both cases nothing is written. On success all
    /// new weights are applied in one batch.
    pub fn recalculate(&self, snapshot_id: u64) -> WeightResult<RecalculationReport> {
        let current = self.retry.run("snapshot_id", || self.graph.snapshot_id())?;
        if current != snapshot_id {
            return Err(EdgeWeightError::SnapshotMismatch {
                requested: snapshot_id,
                current,
            });
        }

        let edges = self.retry.run("declared_edges", || self.graph.declared_edges())?;
        let mut endpoints: Vec<NodeId> = edges.iter().flat_map(|e| [e.from, e.to]).collect();
        endpoints.sort();
        endpoints.dedup();
        let known = self.retry.run("nodes", || self.graph.nodes(&endpoints))?;

        tracing::info!(
            snapshot = snapshot_id,
            edges = edges.len(),
            threshold = self.config.mastery_threshold,
            "recalculating edge weights"
        );

        let cache = self.prefetch_mastery(&known.keys().copied().collect::<Vec<_>>());
        let compute = |edge: &Edge| {
            if !known.contains_key(&edge.from) || !known.contains_key(&edge.to) {
                tracing::warn!(from = %edge.from, to = %edge.to, "skipping edge with missing endpoint");
                return EdgeOutcome::Skipped;
            }
            self.compute_edge(edge, &cache)
        };

        let outcomes: Vec<EdgeOutcome> = if self.config.parallel {
            use rayon::prelude::*;
            edges.par_iter().map(compute).collect()
        } else {
            edges.iter().map(compute).collect()
        };

        let mut report = RecalculationReport {
            snapshot_id,
            edges_total: edges.len(),
            ..Default::default()
        };
        let mut updates = Vec::new();
        for outcome in outcomes {
            match outcome {
                EdgeOutcome::Updated(update) => updates.push(update),
                EdgeOutcome::Skipped => report.edges_skipped += 1,
                EdgeOutcome::Failed(failure) => {
                    tracing::warn!(
                        from = %failure.from,
                        to = %failure.to,
                        error = %failure.message,
                        "edge weight recomputation failed"
                    );
                    report.failures.push(failure);
                }
            }
        }

        let failed = report.failures.len();
        let ratio = if report.edges_total == 0 {
            1.0
        } else {
            (report.edges_total - failed) as f64 / report.edges_total as f64
        };
        if ratio < self.config.min_success_ratio {
            tracing::error!(
                failed,
                total = report.edges_total,
                ratio,
                "too many edge failures, keeping previous weights"
            );
            return Err(EdgeWeightError::TooManyFailures {
                failed,
                total: report.edges_total,
                required_ratio: self.config.min_success_ratio,
            });
        }

        self.retry
            .run("apply_edge_weights", || self.graph.apply_edge_weights(&updates))?;
        report.edges_updated = updates.len();

        tracing::info!(
            updated = report.edges_updated,
            skipped = report.edges_skipped,
            failed,
            "edge weights recalculated"
        );
        Ok(report)
    }

    /// Read every mastered set in one bulk call. If the bulk read fails the
    /// cache starts empty and each node is read on its own, so a failure
    /// stays confined to the edges touching that node.
    fn prefetch_mastery(&self, nodes: &[NodeId]) -> DashMap<NodeId, MasterySet> {
        let cache = DashMap::with_capacity(nodes.len());
        match self
            .history
            .mastered_sets(nodes, self.config.mastery_threshold)
        {
            Ok(sets) => {
                for (node, users) in sets {
                    cache.insert(node, Ok(Arc::new(users)));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "bulk mastery read failed, reading per node");
            }
        }
        cache
    }

    fn mastered(&self, node: NodeId, cache: &DashMap<NodeId, MasterySet>) -> MasterySet {
        if let Some(hit) = cache.get(&node) {
            return hit.value().clone();
        }
        let result = self
            .history
            .mastered_by(node, self.config.mastery_threshold)
            .map(Arc::new)
            .map_err(|e| e.to_string());
        cache.insert(node, result.clone());
        result
    }

    fn compute_edge(&self, edge: &Edge, cache: &DashMap<NodeId, MasterySet>) -> EdgeOutcome {
        let fail = |message: String| {
            EdgeOutcome::Failed(EdgeFailure {
                from: edge.from,
                to: edge.to,
                message,
            })
        };

        let mastered_a = match self.mastered(edge.from, cache) {
            Ok(set) => set,
            Err(message) => return fail(message),
        };
        if mastered_a.is_empty() {
            tracing::debug!(from = %edge.from, to = %edge.to, "no learners mastered source, skipping");
            return EdgeOutcome::Skipped;
        }
        let mastered_b = match self.mastered(edge.to, cache) {
            Ok(set) => set,
            Err(message) => return fail(message),
        };

        let both = mastered_a.intersection(&mastered_b).count();
        let sample_size = mastered_a.len() as u64;
        EdgeOutcome::Updated(EdgeWeightUpdate {
            from: edge.from,
            to: edge.to,
            weight: both as f64 / sample_size as f64,
            sample_size,
        })
    }
}

impl std::fmt::Debug for EdgeWeightCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeWeightCalculator")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use super::*;
    use crate::error::StoreError;
    use crate::graph::index::ConceptGraph;
    use crate::node::{ClusterId, KnowledgeNode};
    use crate::store::mem::MemProficiencyStore;
    use crate::store::{ProficiencyStore, StoreResult};

    fn n(id: u64) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn graph(nodes: u64) -> Arc<ConceptGraph> {
        let g = ConceptGraph::new();
        g.add_cluster(ClusterId(1), "c");
        for id in 1..=nodes {
            g.insert_node(KnowledgeNode::new(n(id), "math", 5, ClusterId(1)))
                .unwrap();
        }
        Arc::new(g)
    }

    fn record(store: &MemProficiencyStore, user: u64, node: u64, value: f64) {
        store
            .batch_upsert(UserId(user), &BTreeMap::from([(n(node), value)]))
            .unwrap();
    }

    fn calculator(
        graph: Arc<ConceptGraph>,
        history: Arc<dyn MasteryHistory>,
        config: WeightConfig,
    ) -> EdgeWeightCalculator {
        EdgeWeightCalculator::new(graph, history, config, RetryPolicy::immediate(1))
    }

    /// History that fails for a fixed set of nodes.
    struct FlakyHistory {
        inner: MemProficiencyStore,
        broken: HashSet<NodeId>,
    }

    impl MasteryHistory for FlakyHistory {
        fn mastered_by(&self, node: NodeId, threshold: f64) -> StoreResult<HashSet<UserId>> {
            if self.broken.contains(&node) {
                return Err(StoreError::Unavailable {
                    message: format!("history shard for {node} offline"),
                });
            }
            self.inner.mastered_by(node, threshold)
        }
    }

    /// History that counts bulk and per-node reads.
    #[derive(Default)]
    struct CountingHistory {
        inner: MemProficiencyStore,
        bulk_reads: std::sync::atomic::AtomicUsize,
        node_reads: std::sync::atomic::AtomicUsize,
    }

    impl MasteryHistory for CountingHistory {
        fn mastered_by(&self, node: NodeId, threshold: f64) -> StoreResult<HashSet<UserId>> {
            self.node_reads
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.mastered_by(node, threshold)
        }

        fn mastered_sets(
            &self,
            nodes: &[NodeId],
            threshold: f64,
        ) -> StoreResult<std::collections::HashMap<NodeId, HashSet<UserId>>> {
            self.bulk_reads
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.mastered_sets(nodes, threshold)
        }
    }

    #[test]
    fn mastery_is_read_once_for_all_edges() {
        let g = graph(5);
        for (a, b) in [(1, 2), (1, 3), (2, 3), (3, 4), (4, 5), (5, 1)] {
            g.declare_edge(n(a), n(b));
        }
        let history = Arc::new(CountingHistory::default());
        for user in 1..=10 {
            for node in 1..=5 {
                record(&history.inner, user, node, if (user + node) % 3 == 0 { 0.2 } else { 0.9 });
            }
        }

        let calc = calculator(
            Arc::clone(&g),
            Arc::clone(&history) as Arc<dyn MasteryHistory>,
            WeightConfig::default(),
        );
        let report = calc.recalculate(g.snapshot_id().unwrap()).unwrap();

        assert_eq!(report.edges_updated, 6);
        let ordering = std::sync::atomic::Ordering::SeqCst;
        assert_eq!(history.bulk_reads.load(ordering), 1);
        assert_eq!(history.node_reads.load(ordering), 0);
    }

    #[test]
    fn seventy_of_a_hundred() {
        let g = graph(2);
        g.declare_edge(n(1), n(2));
        let store = Arc::new(MemProficiencyStore::new());
        for user in 1..=100 {
            record(&store, user, 1, 0.9);
            if user <= 70 {
                record(&store, user, 2, 0.8);
            } else {
                record(&store, user, 2, 0.3);
            }
        }
        // Learners who never mastered the source do not count.
        for user in 101..=120 {
            record(&store, user, 1, 0.5);
            record(&store, user, 2, 0.95);
        }

        let calc = calculator(Arc::clone(&g), store, WeightConfig::default());
        let report = calc.recalculate(g.snapshot_id().unwrap()).unwrap();

        assert_eq!(report.edges_updated, 1);
        let w = g.edge_weight(n(1), n(2)).unwrap();
        assert!((w.weight - 0.70).abs() < 1e-12);
        assert_eq!(w.sample_size, 100);
    }

    #[test]
    fn edge_without_mastery_data_is_skipped_and_keeps_weight() {
        let g = graph(3);
        g.declare_edge(n(1), n(2));
        g.declare_edge(n(3), n(2));
        g.upsert_edge_weight(n(3), n(2), 0.55, 12).unwrap();
        let store = Arc::new(MemProficiencyStore::new());

        let calc = calculator(Arc::clone(&g), store, WeightConfig::default());
        let report = calc.recalculate(g.snapshot_id().unwrap()).unwrap();

        assert_eq!(report.edges_skipped, 2);
        assert_eq!(report.edges_updated, 0);
        assert!(g.edge_weight(n(1), n(2)).is_none());
        assert!((g.edge_weight(n(3), n(2)).unwrap().weight - 0.55).abs() < 1e-12);
    }

    #[test]
    fn stale_snapshot_is_rejected() {
        let g = graph(2);
        let stale = g.snapshot_id().unwrap();
        g.declare_edge(n(1), n(2));
        let calc = calculator(
            Arc::clone(&g),
            Arc::new(MemProficiencyStore::new()),
            WeightConfig::default(),
        );
        let err = calc.recalculate(stale).unwrap_err();
        assert!(matches!(err, EdgeWeightError::SnapshotMismatch { .. }));
    }

    #[test]
    fn majority_failure_keeps_previous_weights() {
        let g = graph(4);
        for (a, b) in [(1, 2), (2, 3), (3, 4), (4, 1)] {
            g.declare_edge(n(a), n(b));
            g.upsert_edge_weight(n(a), n(b), 0.5, 10).unwrap();
        }
        let inner = MemProficiencyStore::new();
        for user in 1..=10 {
            for node in 1..=4 {
                record(&inner, user, node, 0.9);
            }
        }
        let history = Arc::new(FlakyHistory {
            inner,
            broken: HashSet::from([n(1), n(2), n(3)]),
        });

        let calc = calculator(Arc::clone(&g), history, WeightConfig::default());
        let err = calc.recalculate(g.snapshot_id().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            EdgeWeightError::TooManyFailures {
                failed: 4,
                total: 4,
                ..
            }
        ));
        for (a, b) in [(1, 2), (2, 3), (3, 4), (4, 1)] {
            assert!((g.edge_weight(n(a), n(b)).unwrap().weight - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn failures_within_tolerance_are_reported() {
        let g = graph(4);
        g.declare_edge(n(1), n(2));
        g.declare_edge(n(2), n(3));
        g.declare_edge(n(4), n(3));
        let inner = MemProficiencyStore::new();
        for user in 1..=4 {
            for node in 1..=4 {
                record(&inner, user, node, 0.9);
            }
        }
        let history = Arc::new(FlakyHistory {
            inner,
            broken: HashSet::from([n(1)]),
        });

        let config = WeightConfig {
            min_success_ratio: 0.5,
            parallel: false,
            ..Default::default()
        };
        let calc = calculator(Arc::clone(&g), history, config);
        let report = calc.recalculate(g.snapshot_id().unwrap()).unwrap();

        assert_eq!(report.edges_updated, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].from, n(1));
        assert!(g.edge_weight(n(1), n(2)).is_none());
        assert_eq!(g.edge_weight(n(2), n(3)).unwrap().sample_size, 4);
    }

    #[test]
    fn edge_to_node_without_metadata_is_skipped() {
        let g = graph(1);
        g.declare_edge(n(1), n(50));
        let store = Arc::new(MemProficiencyStore::new());
        record(&store, 1, 1, 0.9);

        let calc = calculator(Arc::clone(&g), store, WeightConfig::default());
        let report = calc.recalculate(g.snapshot_id().unwrap()).unwrap();
        assert_eq!(report.edges_skipped, 1);
        assert!(report.failures.is_empty());
    }
}
