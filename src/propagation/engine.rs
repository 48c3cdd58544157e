//! The propagation engine: validation, data gathering, tiers, persistence.
//!
//! Runs for the same learner are serialized through a sharded lock keyed by
//! [`UserId`]; runs for different learners proceed in parallel. Graph reads
//! are retried with backoff, proficiency reads and writes each go through the
//! batch layer as a single store operation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;

use crate::batch::BatchRetrieval;
use crate::error::{PropagationError, ValidationError};
use crate::graph::{GraphStore, Neighbor};
use crate::node::{ClusterId, NodeId, UserId};
use crate::retry::RetryPolicy;

use super::cancel::CancelToken;
use super::tiers::{self, RunContext};
use super::{AssessmentResult, ProficiencyUpdate, PropagationConfig, RunState};

/// Result type for propagation runs.
pub type PropagationResult<T> = std::result::Result<T, PropagationError>;

/// Per-learner mutual exclusion.
///
/// Entries are created on demand and dropped once no run holds them.
#[derive(Debug, Default)]
struct UserLocks {
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl UserLocks {
    /// Run `f` while holding the learner's lock.
    ///
    /// The mutex guards no data, so a lock poisoned by a panicking run is
    /// taken over as is. The entry is released on unwind as well.
    fn with_lock<T>(&self, user: UserId, f: impl FnOnce() -> T) -> T {
        let _release = Release {
            locks: &self.locks,
            user,
        };
        let lock = Arc::clone(self.locks.entry(user).or_default().value());
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Drops a learner's lock entry once no run holds it.
struct Release<'a> {
    locks: &'a DashMap<UserId, Arc<Mutex<()>>>,
    user: UserId,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.locks
            .remove_if(&self.user, |_, held| Arc::strong_count(held) == 1);
    }
}

/// Computes and persists proficiency updates for completed assessments.
pub struct PropagationEngine {
    graph: Arc<dyn GraphStore>,
    batch: Arc<BatchRetrieval>,
    config: PropagationConfig,
    retry: RetryPolicy,
    locks: UserLocks,
}

impl PropagationEngine {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        batch: Arc<BatchRetrieval>,
        config: PropagationConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            graph,
            batch,
            config,
            retry,
            locks: UserLocks::default(),
        }
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Compute, then persist, the update for one assessment.
    ///
    /// Uses the configured timeout, if any.
    pub fn run(
        &self,
        user: UserId,
        results: &[AssessmentResult],
    ) -> PropagationResult<ProficiencyUpdate> {
        let token = match self.config.timeout_ms {
            Some(ms) => CancelToken::with_timeout(Duration::from_millis(ms)),
            None => CancelToken::new(),
        };
        self.run_with_cancel(user, results, &token)
    }

    /// Like [`run`](Self::run) with a caller-supplied cancellation token.
    ///
    /// The learner's lock is held from reading the prior values until the
    /// batch write commits. A cancelled or failed run writes nothing.
    pub fn run_with_cancel(
        &self,
        user: UserId,
        results: &[AssessmentResult],
        cancel: &CancelToken,
    ) -> PropagationResult<ProficiencyUpdate> {
        self.locks.with_lock(user, || -> PropagationResult<ProficiencyUpdate> {
            let mut update = self.compute_update(user, results, cancel)?;
            cancel.check(user)?;
            self.batch.write(user, &update.values)?;
            update.states.push(RunState::Persisted);
            tracing::info!(
                %user,
                tested = update.counts.direct,
                touched = update.values.len(),
                "proficiency update persisted"
            );
            Ok(update)
        })
    }

    /// Compute the update without persisting it.
    pub fn compute_update(
        &self,
        user: UserId,
        results: &[AssessmentResult],
        cancel: &CancelToken,
    ) -> PropagationResult<ProficiencyUpdate> {
        let mut states = vec![RunState::Idle, RunState::ValidatingInput];
        let node_clusters = self.validate(results)?;
        cancel.check(user)?;

        let cluster_members = self.touched_clusters(&node_clusters)?;
        let neighbors = self.gather_neighbors(results)?;

        let mut wanted: Vec<NodeId> = results.iter().map(|r| r.node).collect();
        wanted.extend(neighbors.values().flatten().map(|n| n.node));
        let prior = self.batch.fetch(user, &wanted)?;
        cancel.check(user)?;

        let ctx = RunContext {
            config: &self.config,
            results,
            node_clusters,
            cluster_members,
            neighbors,
            prior,
        };

        states.push(RunState::ComputingTier3);
        let t3 = tiers::tier3(&ctx);
        cancel.check(user)?;

        states.push(RunState::ComputingTier2);
        let t2 = tiers::tier2(&ctx, t3);
        cancel.check(user)?;

        states.push(RunState::ComputingTier1);
        let t1 = tiers::tier1(&ctx, t2);

        states.push(RunState::Clamping);
        let reduced = t1.reduce();

        tracing::debug!(
            %user,
            baseline = reduced.counts.baseline,
            propagated = reduced.counts.propagated,
            direct = reduced.counts.direct,
            "proficiency update computed"
        );

        Ok(ProficiencyUpdate {
            user,
            values: reduced.values,
            tested: results.iter().map(|r| r.node).collect(),
            cluster_means: reduced.cluster_means,
            states,
            counts: reduced.counts,
        })
    }

    /// Reject bad scores, repeated nodes and unknown nodes. Returns the
    /// cluster of every tested node.
    fn validate(
        &self,
        results: &[AssessmentResult],
    ) -> PropagationResult<HashMap<NodeId, ClusterId>> {
        let mut seen = HashSet::with_capacity(results.len());
        for result in results {
            if !result.score.is_finite() || !(0.0..=1.0).contains(&result.score) {
                return Err(ValidationError::ScoreOutOfRange {
                    node_id: result.node.get(),
                    score: result.score,
                }
                .into());
            }
            if !seen.insert(result.node) {
                return Err(ValidationError::DuplicateNode {
                    node_id: result.node.get(),
                }
                .into());
            }
        }
        if results.is_empty() {
            return Ok(HashMap::new());
        }

        let ids: Vec<NodeId> = results.iter().map(|r| r.node).collect();
        let known = self.retry.run("nodes", || self.graph.nodes(&ids))?;
        let mut clusters = HashMap::with_capacity(ids.len());
        for id in ids {
            let node = known
                .get(&id)
                .ok_or(ValidationError::UnknownNode { node_id: id.get() })?;
            clusters.insert(id, node.cluster);
        }
        Ok(clusters)
    }

    fn touched_clusters(
        &self,
        node_clusters: &HashMap<NodeId, ClusterId>,
    ) -> PropagationResult<BTreeMap<ClusterId, Vec<NodeId>>> {
        let touched: BTreeSet<ClusterId> = node_clusters.values().copied().collect();
        let mut members = BTreeMap::new();
        for cluster in touched {
            let nodes = self
                .retry
                .run("cluster_nodes", || self.graph.cluster_nodes(cluster))?;
            members.insert(cluster, nodes);
        }
        Ok(members)
    }

    /// Qualifying neighbors of each tested node. Neighbors without node
    /// metadata are dropped with a warning.
    fn gather_neighbors(
        &self,
        results: &[AssessmentResult],
    ) -> PropagationResult<HashMap<NodeId, Vec<Neighbor>>> {
        let mut neighbors = HashMap::with_capacity(results.len());
        for result in results {
            let found = self.retry.run("neighbors", || {
                self.graph.neighbors(
                    result.node,
                    self.config.max_depth,
                    self.config.min_traversal_weight,
                )
            })?;
            neighbors.insert(result.node, found);
        }

        let mut ids: Vec<NodeId> = neighbors.values().flatten().map(|n| n.node).collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return Ok(neighbors);
        }
        let known = self.retry.run("nodes", || self.graph.nodes(&ids))?;
        for (from, list) in neighbors.iter_mut() {
            list.retain(|n| {
                let ok = known.contains_key(&n.node);
                if !ok {
                    tracing::warn!(from = %from, to = %n.node, "skipping neighbor without node metadata");
                }
                ok
            });
        }
        Ok(neighbors)
    }
}

impl std::fmt::Debug for PropagationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationEngine")
            .field("config", &self.config)
            .field("active_users", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::GraphError;
    use crate::graph::index::ConceptGraph;
    use crate::graph::{Cluster, Edge, GraphResult};
    use crate::node::KnowledgeNode;
    use crate::store::ProficiencyStore;
    use crate::store::mem::MemProficiencyStore;

    fn n(id: u64) -> NodeId {
        NodeId::new(id).unwrap()
    }

    /// A in cluster 1, B in cluster 2, A → B weight 0.8.
    fn scenario_graph() -> Arc<ConceptGraph> {
        let g = ConceptGraph::new();
        g.add_cluster(ClusterId(1), "a");
        g.add_cluster(ClusterId(2), "b");
        g.insert_node(KnowledgeNode::new(n(1), "math", 5, ClusterId(1)))
            .unwrap();
        g.insert_node(KnowledgeNode::new(n(2), "math", 5, ClusterId(2)))
            .unwrap();
        g.declare_edge(n(1), n(2));
        g.upsert_edge_weight(n(1), n(2), 0.8, 100).unwrap();
        Arc::new(g)
    }

    fn engine_over(graph: Arc<dyn GraphStore>) -> (PropagationEngine, Arc<MemProficiencyStore>) {
        let store = Arc::new(MemProficiencyStore::new());
        let batch = Arc::new(BatchRetrieval::new(
            Arc::clone(&store) as Arc<dyn ProficiencyStore>
        ));
        let engine = PropagationEngine::new(
            graph,
            batch,
            PropagationConfig::default(),
            RetryPolicy::immediate(3),
        );
        (engine, store)
    }

    /// Delegates to a [`ConceptGraph`], failing the first `failures`
    /// neighbor lookups, panicking on the first `panics` lookups and
    /// optionally cancelling a token on lookup.
    struct FlakyGraph {
        inner: Arc<ConceptGraph>,
        failures: AtomicUsize,
        panics: AtomicUsize,
        cancel_on_lookup: Option<CancelToken>,
    }

    impl FlakyGraph {
        fn new(inner: Arc<ConceptGraph>, failures: usize) -> Self {
            Self {
                inner,
                failures: AtomicUsize::new(failures),
                panics: AtomicUsize::new(0),
                cancel_on_lookup: None,
            }
        }
    }

    impl GraphStore for FlakyGraph {
        fn node(&self, id: NodeId) -> GraphResult<Option<KnowledgeNode>> {
            self.inner.node(id)
        }
        fn neighbors(
            &self,
            id: NodeId,
            max_depth: usize,
            min_weight: f64,
        ) -> GraphResult<Vec<Neighbor>> {
            if let Some(token) = &self.cancel_on_lookup {
                token.cancel();
            }
            if self
                .panics
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                panic!("neighbor index corrupted");
            }
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(GraphError::Unavailable {
                    message: "read timeout".into(),
                });
            }
            self.inner.neighbors(id, max_depth, min_weight)
        }
        fn cluster_nodes(&self, cluster: ClusterId) -> GraphResult<Vec<NodeId>> {
            self.inner.cluster_nodes(cluster)
        }
        fn clusters(&self) -> GraphResult<Vec<Cluster>> {
            self.inner.clusters()
        }
        fn degree(&self, id: NodeId) -> GraphResult<(usize, usize)> {
            self.inner.degree(id)
        }
        fn declared_edges(&self) -> GraphResult<Vec<Edge>> {
            self.inner.declared_edges()
        }
        fn snapshot_id(&self) -> GraphResult<u64> {
            self.inner.snapshot_id()
        }
        fn upsert_edge_weight(
            &self,
            from: NodeId,
            to: NodeId,
            weight: f64,
            sample_size: u64,
        ) -> GraphResult<()> {
            self.inner.upsert_edge_weight(from, to, weight, sample_size)
        }
        fn set_centroid(&self, cluster: ClusterId, centroid: Option<NodeId>) -> GraphResult<()> {
            self.inner.set_centroid(cluster, centroid)
        }
    }

    #[test]
    fn panicking_run_does_not_wedge_the_learner() {
        let graph = FlakyGraph::new(scenario_graph(), 0);
        graph.panics.store(1, Ordering::SeqCst);
        let (engine, store) = engine_over(Arc::new(graph));
        let results = [AssessmentResult::new(n(1), 0.9)];

        let first = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            engine.run(UserId(1), &results)
        }));
        assert!(first.is_err());
        assert_eq!(engine.locks.len(), 0);
        assert!(store.user_records(UserId(1)).unwrap().is_empty());

        let second = engine.run(UserId(1), &results).unwrap();
        assert!(second.is_persisted());
        assert!((second.get(n(1)).unwrap() - 0.45).abs() < 1e-12);
        assert_eq!(engine.locks.len(), 0);
    }

    #[test]
    fn scenario_update_is_persisted() {
        let (engine, store) = engine_over(scenario_graph());
        store
            .batch_upsert(UserId(1), &BTreeMap::from([(n(1), 0.4)]))
            .unwrap();

        let update = engine
            .run(UserId(1), &[AssessmentResult::new(n(1), 0.9)])
            .unwrap();

        assert!((update.get(n(1)).unwrap() - 0.45).abs() < 1e-12);
        assert!((update.get(n(2)).unwrap() - 0.424).abs() < 1e-12);
        assert!(update.is_persisted());
        assert_eq!(
            update.states,
            vec![
                RunState::Idle,
                RunState::ValidatingInput,
                RunState::ComputingTier3,
                RunState::ComputingTier2,
                RunState::ComputingTier1,
                RunState::Clamping,
                RunState::Persisted,
            ]
        );

        let stored = store.batch_get(UserId(1), &[n(1), n(2)]).unwrap();
        assert!((stored[&n(2)] - 0.424).abs() < 1e-12);
    }

    #[test]
    fn prior_read_and_write_are_single_batches() {
        let store = Arc::new(MemProficiencyStore::new());
        let batch = Arc::new(BatchRetrieval::new(
            Arc::clone(&store) as Arc<dyn ProficiencyStore>
        ));
        let engine = PropagationEngine::new(
            scenario_graph(),
            Arc::clone(&batch),
            PropagationConfig::default(),
            RetryPolicy::immediate(1),
        );
        engine
            .run(UserId(1), &[AssessmentResult::new(n(1), 0.9)])
            .unwrap();
        assert_eq!(batch.read_ops(), 1);
        assert_eq!(batch.write_ops(), 1);
    }

    #[test]
    fn identical_inputs_give_identical_outputs() {
        let (a, _) = engine_over(scenario_graph());
        let (b, _) = engine_over(scenario_graph());
        let results = [AssessmentResult::new(n(1), 0.3)];
        let token = CancelToken::new();
        let first = a.compute_update(UserId(4), &results, &token).unwrap();
        let second = b.compute_update(UserId(4), &results, &token).unwrap();
        assert_eq!(first.values, second.values);
    }

    #[test]
    fn validation_errors_write_nothing() {
        let (engine, store) = engine_over(scenario_graph());
        let cases = [
            vec![AssessmentResult::new(n(1), 1.5)],
            vec![AssessmentResult::new(n(1), f64::NAN)],
            vec![AssessmentResult::new(n(1), 0.5), AssessmentResult::new(n(77), 0.5)],
            vec![AssessmentResult::new(n(1), 0.5), AssessmentResult::new(n(1), 0.6)],
        ];
        for results in cases {
            let err = engine.run(UserId(1), &results).unwrap_err();
            assert!(matches!(err, PropagationError::Validation(_)), "{err:?}");
        }
        assert!(store.user_records(UserId(1)).unwrap().is_empty());
    }

    #[test]
    fn empty_assessment_is_a_no_op() {
        let (engine, store) = engine_over(scenario_graph());
        let update = engine.run(UserId(1), &[]).unwrap();
        assert!(update.values.is_empty());
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn transient_graph_failures_are_retried() {
        let graph = Arc::new(FlakyGraph::new(scenario_graph(), 2));
        let (engine, _) = engine_over(graph);
        let update = engine
            .run(UserId(1), &[AssessmentResult::new(n(1), 0.9)])
            .unwrap();
        assert!(update.get(n(2)).is_some());
    }

    #[test]
    fn persistent_graph_failure_is_surfaced_not_ignored() {
        let graph = Arc::new(FlakyGraph::new(scenario_graph(), 100));
        let (engine, store) = engine_over(graph);
        let err = engine
            .run(UserId(1), &[AssessmentResult::new(n(1), 0.9)])
            .unwrap_err();
        assert!(matches!(
            err,
            PropagationError::Graph(GraphError::Unavailable { .. })
        ));
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn cancelled_run_persists_nothing() {
        let token = CancelToken::new();
        let mut graph = FlakyGraph::new(scenario_graph(), 0);
        graph.cancel_on_lookup = Some(token.clone());
        let (engine, store) = engine_over(Arc::new(graph));

        let err = engine
            .run_with_cancel(UserId(1), &[AssessmentResult::new(n(1), 0.9)], &token)
            .unwrap_err();
        assert!(matches!(err, PropagationError::Cancelled { .. }));
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn neighbor_without_metadata_is_skipped() {
        let g = scenario_graph();
        g.declare_edge(n(1), n(500));
        g.upsert_edge_weight(n(1), n(500), 0.9, 10).unwrap();
        let (engine, _) = engine_over(g);
        let update = engine
            .compute_update(UserId(1), &[AssessmentResult::new(n(1), 0.9)], &CancelToken::new())
            .unwrap();
        assert!(update.get(n(500)).is_none());
        assert!(update.get(n(2)).is_some());
    }

    #[test]
    fn same_user_runs_are_serialized() {
        let (engine, store) = engine_over(scenario_graph());
        let engine = Arc::new(engine);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    engine
                        .run(UserId(1), &[AssessmentResult::new(n(1), 1.0)])
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let expected = 1.0 - 0.6 * 0.9f64.powi(8);
        let stored = store.batch_get(UserId(1), &[n(1)]).unwrap()[&n(1)];
        assert!((stored - expected).abs() < 1e-12, "{stored} != {expected}");
        assert_eq!(engine.locks.len(), 0);
    }
}
