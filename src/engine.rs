//! Top-level engine facade.
//!
//! The [`Engine`] owns all subsystems and exposes the three core operations:
//! computing a proficiency update, selecting centroids and recalculating edge
//! weights. With a data directory configured, proficiency records, the
//! concept graph and the item inventory are persisted in redb; without one,
//! everything lives in memory.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use crate::batch::BatchRetrieval;
use crate::centroid::{CentroidSelection, CentroidSelector};
use crate::config::EngineConfig;
use crate::error::{EngineError, ProficioResult, StoreError};
use crate::export::{ClusterProficiency, EdgeExport, EngineExport, ProficiencyExport};
use crate::graph::GraphStore;
use crate::graph::index::ConceptGraph;
use crate::graph::snapshot::{GraphSnapshot, LoadReport};
use crate::item_bank::{ItemInventory, MemItemBank};
use crate::node::{ClusterId, NodeId, UserId};
use crate::propagation::cancel::CancelToken;
use crate::propagation::engine::PropagationEngine;
use crate::propagation::{AssessmentResult, ProficiencyUpdate};
use crate::store::durable::DurableStore;
use crate::store::mem::MemProficiencyStore;
use crate::store::{MasteryHistory, ProficiencyRecord, ProficiencyStore};
use crate::weights::{EdgeWeightCalculator, RecalculationReport};

/// Metadata key of the persisted graph snapshot.
const GRAPH_KEY: &str = "graph_snapshot";
/// Metadata key of the persisted item inventory.
const ITEMS_KEY: &str = "item_inventory";

/// The proficio engine.
///
/// Owns the concept graph, the proficiency store, the item bank and the
/// three services built on them.
pub struct Engine {
    config: EngineConfig,
    graph: Arc<ConceptGraph>,
    items: Arc<MemItemBank>,
    batch: Arc<BatchRetrieval>,
    durable: Option<Arc<DurableStore>>,
    propagation: PropagationEngine,
    centroids: CentroidSelector,
    weights: EdgeWeightCalculator,
}

impl Engine {
    /// Create a new engine, restoring persisted state if a data directory
    /// is configured.
    pub fn new(config: EngineConfig) -> ProficioResult<Self> {
        config.validate()?;
        let default = config.propagation.default_proficiency;

        let (graph, items, store, history, durable) = if let Some(ref dir) = config.data_dir {
            std::fs::create_dir_all(dir).map_err(|_| EngineError::DataDir {
                path: dir.display().to_string(),
            })?;
            let durable = Arc::new(DurableStore::open_with_default(dir, default)?);
            let graph = match durable.get_meta(GRAPH_KEY)? {
                Some(bytes) => {
                    let snapshot = GraphSnapshot::from_bytes(&bytes)?;
                    let (graph, report) = ConceptGraph::from_snapshot(&snapshot)?;
                    tracing::info!(
                        nodes = report.nodes,
                        edges = report.edges,
                        weighted = report.weighted_edges,
                        "restored concept graph"
                    );
                    graph
                }
                None => ConceptGraph::new(),
            };
            let items = MemItemBank::new();
            if let Some(bytes) = durable.get_meta(ITEMS_KEY)? {
                let inventory: Vec<ItemInventory> =
                    bincode::deserialize(&bytes).map_err(|e| StoreError::Serialization {
                        message: format!("failed to decode item inventory: {e}"),
                    })?;
                items.extend(&inventory);
            }
            let store: Arc<dyn ProficiencyStore> = Arc::clone(&durable) as _;
            let history: Arc<dyn MasteryHistory> = Arc::clone(&durable) as _;
            (graph, items, store, history, Some(durable))
        } else {
            let mem = Arc::new(MemProficiencyStore::with_default(default));
            let store: Arc<dyn ProficiencyStore> = Arc::clone(&mem) as _;
            let history: Arc<dyn MasteryHistory> = mem;
            (ConceptGraph::new(), MemItemBank::new(), store, history, None)
        };

        let graph = Arc::new(graph);
        let items = Arc::new(items);
        let batch = Arc::new(BatchRetrieval::new(store));
        let shared_graph: Arc<dyn GraphStore> = Arc::clone(&graph) as _;

        let propagation = PropagationEngine::new(
            Arc::clone(&shared_graph),
            Arc::clone(&batch),
            config.propagation.clone(),
            config.retry.clone(),
        );
        let centroids = CentroidSelector::new(
            Arc::clone(&shared_graph),
            Arc::clone(&items) as _,
            config.retry.clone(),
        );
        let weights = EdgeWeightCalculator::new(
            shared_graph,
            history,
            config.edge_weights.clone(),
            config.retry.clone(),
        );

        tracing::info!(
            persistent = durable.is_some(),
            nodes = graph.node_count(),
            "initialized proficio engine"
        );

        Ok(Self {
            config,
            graph,
            items,
            batch,
            durable,
            propagation,
            centroids,
            weights,
        })
    }

    /// Add the clusters, nodes and edges of a snapshot to the graph.
    pub fn ingest_snapshot(&self, snapshot: &GraphSnapshot) -> ProficioResult<LoadReport> {
        let report = self.graph.load_snapshot(snapshot)?;
        self.centroids.invalidate();
        self.persist()?;
        tracing::info!(
            clusters = report.clusters,
            nodes = report.nodes,
            edges = report.edges,
            dropped_weights = report.dropped_weights,
            "ingested graph snapshot"
        );
        Ok(report)
    }

    /// Parse and ingest a JSON graph snapshot.
    pub fn ingest_json(&self, json: &str) -> ProficioResult<LoadReport> {
        let snapshot = GraphSnapshot::from_json(json)?;
        self.ingest_snapshot(&snapshot)
    }

    /// Register assessment items with the item bank.
    pub fn register_items(&self, inventory: &[ItemInventory]) -> ProficioResult<()> {
        self.items.extend(inventory);
        self.centroids.invalidate();
        self.persist()
    }

    /// Move a node to another cluster.
    pub fn reassign_cluster(&self, node: NodeId, cluster: ClusterId) -> ProficioResult<()> {
        self.graph.reassign_cluster(node, cluster)?;
        self.persist()
    }

    /// Write the graph and item inventory to the data directory.
    /// A no-op in memory-only mode.
    pub fn persist(&self) -> ProficioResult<()> {
        let Some(durable) = &self.durable else {
            return Ok(());
        };
        let snapshot = self.graph.to_snapshot()?;
        let graph = snapshot.to_bytes()?;
        let inventory = bincode::serialize(&self.items.inventory()).map_err(|e| {
            StoreError::Serialization {
                message: format!("failed to encode item inventory: {e}"),
            }
        })?;
        durable.put_meta_many(&[
            (GRAPH_KEY, graph.as_slice()),
            (ITEMS_KEY, inventory.as_slice()),
        ])?;
        tracing::debug!(nodes = snapshot.nodes.len(), "persisted engine state");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Core operations
    // -----------------------------------------------------------------------

    /// Compute and persist the proficiency update for one assessment.
    pub fn compute_proficiency_update(
        &self,
        user: UserId,
        results: &[AssessmentResult],
    ) -> ProficioResult<ProficiencyUpdate> {
        Ok(self.propagation.run(user, results)?)
    }

    /// Like [`compute_proficiency_update`](Self::compute_proficiency_update)
    /// with a caller-controlled cancellation token.
    pub fn compute_proficiency_update_with_cancel(
        &self,
        user: UserId,
        results: &[AssessmentResult],
        cancel: &CancelToken,
    ) -> ProficioResult<ProficiencyUpdate> {
        Ok(self.propagation.run_with_cancel(user, results, cancel)?)
    }

    /// Compute the update an assessment would produce without writing it.
    pub fn preview(
        &self,
        user: UserId,
        results: &[AssessmentResult],
    ) -> ProficioResult<ProficiencyUpdate> {
        Ok(self
            .propagation
            .compute_update(user, results, &CancelToken::new())?)
    }

    /// Select centroids for a subject and grade, `(cluster, centroid)` pairs
    /// in ascending cluster order. `cluster_count = 0` selects for every
    /// cluster.
    ///
    /// Clusters without a qualifying node are left out of the pairs. Use
    /// [`centroid_selection`](Self::centroid_selection) to learn which
    /// clusters were unavailable.
    pub fn select_centroids(
        &self,
        subject: &str,
        grade: u8,
        cluster_count: usize,
    ) -> ProficioResult<Vec<(ClusterId, NodeId)>> {
        Ok(self.centroid_selection(subject, grade, cluster_count)?.pairs())
    }

    /// Full centroid selection, including unavailable clusters.
    pub fn centroid_selection(
        &self,
        subject: &str,
        grade: u8,
        cluster_count: usize,
    ) -> ProficioResult<Arc<CentroidSelection>> {
        let selection = self.centroids.select(subject, grade, cluster_count)?;
        self.persist()?;
        Ok(selection)
    }

    /// Last selection for these parameters, possibly stale.
    pub fn cached_centroids(
        &self,
        subject: &str,
        grade: u8,
        cluster_count: usize,
    ) -> Option<Arc<CentroidSelection>> {
        self.centroids.cached(subject, grade, cluster_count)
    }

    /// Recompute all edge weights against the given graph snapshot.
    pub fn recalculate_edge_weights(&self, snapshot_id: u64) -> ProficioResult<RecalculationReport> {
        let report = self.weights.recalculate(snapshot_id)?;
        self.persist()?;
        Ok(report)
    }

    /// Current structural version of the graph.
    pub fn snapshot_id(&self) -> ProficioResult<u64> {
        Ok(self.graph.snapshot_id()?)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current proficiency of a learner on the given nodes.
    pub fn proficiency(&self, user: UserId, nodes: &[NodeId]) -> ProficioResult<BTreeMap<NodeId, f64>> {
        Ok(self.batch.fetch(user, nodes)?.into_iter().collect())
    }

    /// Stored records for the given nodes. Nodes the learner was never
    /// scored on are absent.
    pub fn node_records(
        &self,
        user: UserId,
        nodes: &[NodeId],
    ) -> ProficioResult<HashMap<NodeId, ProficiencyRecord>> {
        Ok(self.batch.fetch_records(user, nodes)?)
    }

    /// Every stored record of a learner.
    pub fn records(&self, user: UserId) -> ProficioResult<BTreeMap<NodeId, ProficiencyRecord>> {
        Ok(self.batch.user_records(user)?)
    }

    /// Mean proficiency per cluster for a learner, ascending by cluster.
    pub fn cluster_report(&self, user: UserId) -> ProficioResult<Vec<ClusterProficiency>> {
        let records = self.batch.user_records(user)?;
        let default = self.batch.default_proficiency();
        let mut report = Vec::new();
        for cluster in self.graph.clusters()? {
            let members = self.graph.cluster_nodes(cluster.id)?;
            if members.is_empty() {
                continue;
            }
            let mut sum = 0.0;
            let mut assessed = 0;
            for node in &members {
                match records.get(node) {
                    Some(record) => {
                        sum += record.proficiency;
                        assessed += 1;
                    }
                    None => sum += default,
                }
            }
            report.push(ClusterProficiency {
                cluster: cluster.id.0,
                name: cluster.name,
                mean: sum / members.len() as f64,
                members: members.len(),
                assessed,
            });
        }
        Ok(report)
    }

    /// Export edge weights and, optionally, one learner's records.
    pub fn export(&self, user: Option<UserId>) -> ProficioResult<EngineExport> {
        let labels: HashMap<NodeId, String> = self
            .graph
            .all_nodes()
            .into_iter()
            .map(|n| (n.id, n.label))
            .collect();
        let label = |id: &NodeId| labels.get(id).cloned().unwrap_or_default();

        let edges = self
            .graph
            .declared_edges()?
            .into_iter()
            .map(|e| EdgeExport {
                from: e.from.get(),
                from_label: label(&e.from),
                to: e.to.get(),
                to_label: label(&e.to),
                weight: e.weight.as_ref().map(|w| w.weight),
                sample_size: e.weight.as_ref().map(|w| w.sample_size),
                calculated_at: e.weight.as_ref().map(|w| w.calculated_at),
            })
            .collect();

        let proficiencies = match user {
            Some(user) => self
                .batch
                .user_records(user)?
                .into_iter()
                .map(|(node, r)| ProficiencyExport {
                    user: user.0,
                    node: node.get(),
                    label: label(&node),
                    proficiency: r.proficiency,
                    interactions_count: r.interactions_count,
                    last_updated: r.last_updated,
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(EngineExport {
            snapshot_id: self.graph.snapshot_id()?,
            edges,
            proficiencies,
        })
    }

    /// Access the concept graph.
    pub fn graph(&self) -> &Arc<ConceptGraph> {
        &self.graph
    }

    /// Access the item bank.
    pub fn items(&self) -> &MemItemBank {
        &self.items
    }

    /// Access the batch retrieval layer.
    pub fn batch(&self) -> &BatchRetrieval {
        &self.batch
    }

    /// Access the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Summary of the engine state.
    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            node_count: self.graph.node_count(),
            edge_count: self.graph.edge_count(),
            weighted_edge_count: self.graph.weighted_edge_count(),
            cluster_count: self.graph.cluster_count(),
            snapshot_id: self.graph.snapshot_id().unwrap_or_default(),
            item_entries: self.items.inventory().len(),
            data_dir: self.config.data_dir.clone(),
        }
    }
}

/// Summary information about the engine state.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub node_count: usize,
    pub edge_count: usize,
    pub weighted_edge_count: usize,
    pub cluster_count: usize,
    pub snapshot_id: u64,
    pub item_entries: usize,
    pub data_dir: Option<PathBuf>,
}

impl std::fmt::Display for EngineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "proficio engine info")?;
        writeln!(f, "  nodes:        {}", self.node_count)?;
        writeln!(
            f,
            "  edges:        {} ({} weighted)",
            self.edge_count, self.weighted_edge_count
        )?;
        writeln!(f, "  clusters:     {}", self.cluster_count)?;
        writeln!(f, "  snapshot:     {}", self.snapshot_id)?;
        writeln!(f, "  item entries: {}", self.item_entries)?;
        match &self.data_dir {
            Some(dir) => writeln!(f, "  data dir:     {}", dir.display())?,
            None => writeln!(f, "  data dir:     (memory only)")?,
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("graph", &self.graph)
            .field("batch", &self.batch)
            .finish()
    }
}
