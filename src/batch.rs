//! Batch retrieval layer.
//!
//! Every proficiency read and write the engine issues goes through
//! [`BatchRetrieval`], which collapses a set of per-node lookups into exactly
//! one store operation. The operation counter makes that guarantee testable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::node::{NodeId, UserId};
use crate::store::{ProficiencyRecord, ProficiencyStore, StoreResult};

/// Façade over a [`ProficiencyStore`] that issues one operation per batch.
pub struct BatchRetrieval {
    store: Arc<dyn ProficiencyStore>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl BatchRetrieval {
    pub fn new(store: Arc<dyn ProficiencyStore>) -> Self {
        Self {
            store,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Proficiency for each requested node (duplicates collapsed), with the
    /// store default for nodes never written. One store read.
    pub fn fetch(&self, user: UserId, nodes: &[NodeId]) -> StoreResult<HashMap<NodeId, f64>> {
        let unique: Vec<NodeId> = nodes
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.store.batch_get(user, &unique)
    }

    /// Full records for the requested nodes. One store read.
    pub fn fetch_records(
        &self,
        user: UserId,
        nodes: &[NodeId],
    ) -> StoreResult<HashMap<NodeId, ProficiencyRecord>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.store.records(user, nodes)
    }

    /// Persist a map of values as one atomic bulk upsert.
    pub fn write(&self, user: UserId, values: &BTreeMap<NodeId, f64>) -> StoreResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.store.batch_upsert(user, values)?;
        tracing::debug!(%user, nodes = values.len(), "persisted proficiency batch");
        Ok(())
    }

    /// Every stored record of a learner.
    pub fn user_records(&self, user: UserId) -> StoreResult<BTreeMap<NodeId, ProficiencyRecord>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.store.user_records(user)
    }

    /// Default substituted for unknown nodes.
    pub fn default_proficiency(&self) -> f64 {
        self.store.default_proficiency()
    }

    /// Number of store read operations issued so far.
    pub fn read_ops(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of store write operations issued so far.
    pub fn write_ops(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BatchRetrieval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRetrieval")
            .field("reads", &self.read_ops())
            .field("writes", &self.write_ops())
            .finish()
    }
}
