//! In-memory proficiency storage backed by DashMap.
//!
//! Each learner's records live in a copy-on-write map behind an `Arc`. A
//! batch read clones the `Arc` and works on that snapshot without blocking
//! writers; a batch upsert swaps in the new map while holding the learner's
//! shard, so readers see either none or all of a batch. All data is lost on
//! process exit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;

use crate::node::{NodeId, UserId, now_secs};

use super::{
    DEFAULT_PROFICIENCY, MasteryHistory, ProficiencyRecord, ProficiencyStore, StoreResult,
    check_value,
};

type UserRecords = HashMap<NodeId, ProficiencyRecord>;

/// Concurrent in-memory proficiency store.
#[derive(Debug)]
pub struct MemProficiencyStore {
    users: DashMap<UserId, Arc<UserRecords>>,
    default: f64,
}

impl MemProficiencyStore {
    /// Create an empty store with the standard default proficiency.
    pub fn new() -> Self {
        Self::with_default(DEFAULT_PROFICIENCY)
    }

    /// Create an empty store substituting `default` for unknown nodes.
    pub fn with_default(default: f64) -> Self {
        Self {
            users: DashMap::new(),
            default: default.clamp(0.0, 1.0),
        }
    }

    fn snapshot(&self, user: UserId) -> Option<Arc<UserRecords>> {
        self.users.get(&user).map(|e| Arc::clone(e.value()))
    }

    /// Number of learners with at least one record.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl Default for MemProficiencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProficiencyStore for MemProficiencyStore {
    fn batch_get(&self, user: UserId, nodes: &[NodeId]) -> StoreResult<HashMap<NodeId, f64>> {
        let snapshot = self.snapshot(user);
        Ok(nodes
            .iter()
            .map(|&node| {
                let value = snapshot
                    .as_ref()
                    .and_then(|records| records.get(&node))
                    .map_or(self.default, |r| r.proficiency);
                (node, value)
            })
            .collect())
    }

    fn batch_upsert(&self, user: UserId, values: &BTreeMap<NodeId, f64>) -> StoreResult<()> {
        for (&node, &value) in values {
            check_value(node, value)?;
        }
        if values.is_empty() {
            return Ok(());
        }
        let now = now_secs();
        let mut entry = self.users.entry(user).or_default();
        let records = Arc::make_mut(entry.value_mut());
        for (&node, &value) in values {
            let next = ProficiencyRecord::next(records.get(&node), value, now);
            records.insert(node, next);
        }
        Ok(())
    }

    fn records(
        &self,
        user: UserId,
        nodes: &[NodeId],
    ) -> StoreResult<HashMap<NodeId, ProficiencyRecord>> {
        let Some(snapshot) = self.snapshot(user) else {
            return Ok(HashMap::new());
        };
        Ok(nodes
            .iter()
            .filter_map(|node| snapshot.get(node).map(|r| (*node, r.clone())))
            .collect())
    }

    fn user_records(&self, user: UserId) -> StoreResult<BTreeMap<NodeId, ProficiencyRecord>> {
        Ok(self
            .snapshot(user)
            .map(|records| records.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default())
    }

    fn default_proficiency(&self) -> f64 {
        self.default
    }
}

impl MasteryHistory for MemProficiencyStore {
    fn mastered_by(&self, node: NodeId, threshold: f64) -> StoreResult<HashSet<UserId>> {
        Ok(self
            .users
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .get(&node)
                    .is_some_and(|r| r.proficiency > threshold)
            })
            .map(|entry| *entry.key())
            .collect())
    }

    fn mastered_sets(
        &self,
        nodes: &[NodeId],
        threshold: f64,
    ) -> StoreResult<HashMap<NodeId, HashSet<UserId>>> {
        let mut sets: HashMap<NodeId, HashSet<UserId>> =
            nodes.iter().map(|&node| (node, HashSet::new())).collect();
        for entry in self.users.iter() {
            for (node, set) in sets.iter_mut() {
                if entry
                    .value()
                    .get(node)
                    .is_some_and(|r| r.proficiency > threshold)
                {
                    set.insert(*entry.key());
                }
            }
        }
        Ok(sets)
    }
}
