//! ACID-durable storage backed by redb.
//!
//! Holds learner proficiency records and engine metadata (the persisted graph
//! snapshot). Every batch read is one MVCC read transaction and every batch
//! write is one write transaction, so a batch commits completely or not at all.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::node::{NodeId, UserId, now_secs};

use super::{
    DEFAULT_PROFICIENCY, MasteryHistory, ProficiencyRecord, ProficiencyStore, StoreResult,
    check_value,
};

/// Table for general metadata (string keys → binary values).
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Proficiency records keyed by `(user, node)`, bincode-encoded.
const PROFICIENCY_TABLE: TableDefinition<(u64, u64), &[u8]> =
    TableDefinition::new("proficiency");

fn redb_err<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Redb {
        message: format!("{op} failed: {e}"),
    }
}

fn decode(bytes: &[u8]) -> StoreResult<ProficiencyRecord> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
        message: format!("failed to decode proficiency record: {e}"),
    })
}

fn encode(record: &ProficiencyRecord) -> StoreResult<Vec<u8>> {
    bincode::serialize(record).map_err(|e| StoreError::Serialization {
        message: format!("failed to encode proficiency record: {e}"),
    })
}

/// ACID-durable proficiency store using redb.
pub struct DurableStore {
    db: Arc<Database>,
    default: f64,
}

impl DurableStore {
    /// Open or create a durable store in the given directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        Self::open_with_default(data_dir, DEFAULT_PROFICIENCY)
    }

    /// Open or create a store substituting `default` for unknown nodes.
    pub fn open_with_default(data_dir: &Path, default: f64) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let db_path = data_dir.join("proficio.redb");
        let db = Database::create(&db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;

        // Create both tables up front so read transactions never miss them.
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        {
            txn.open_table(META_TABLE).map_err(redb_err("open_table"))?;
            txn.open_table(PROFICIENCY_TABLE)
                .map_err(redb_err("open_table"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;

        Ok(Self {
            db: Arc::new(db),
            default: default.clamp(0.0, 1.0),
        })
    }

    /// Store a metadata value.
    pub fn put_meta(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.put_meta_many(&[(key, value)])
    }

    /// Store several metadata values in one write transaction.
    pub fn put_meta_many(&self, entries: &[(&str, &[u8])]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(redb_err("open_table"))?;
            for &(key, value) in entries {
                table.insert(key, value).map_err(redb_err("insert"))?;
            }
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    /// Read a metadata value. Returns `Ok(None)` if the key doesn't exist.
    pub fn get_meta(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(META_TABLE).map_err(redb_err("open_table"))?;
        let result = table.get(key).map_err(redb_err("get"))?;
        Ok(result.map(|guard| guard.value().to_vec()))
    }

    /// Read records for the given nodes inside one read transaction.
    fn read_records(
        &self,
        user: UserId,
        nodes: &[NodeId],
    ) -> StoreResult<HashMap<NodeId, ProficiencyRecord>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn
            .open_table(PROFICIENCY_TABLE)
            .map_err(redb_err("open_table"))?;
        let mut found = HashMap::with_capacity(nodes.len());
        for &node in nodes {
            if let Some(guard) = table.get((user.0, node.get())).map_err(redb_err("get"))? {
                found.insert(node, decode(guard.value())?);
            }
        }
        Ok(found)
    }
}

impl ProficiencyStore for DurableStore {
    fn batch_get(&self, user: UserId, nodes: &[NodeId]) -> StoreResult<HashMap<NodeId, f64>> {
        let records = self.read_records(user, nodes)?;
        Ok(nodes
            .iter()
            .map(|node| {
                let value = records.get(node).map_or(self.default, |r| r.proficiency);
                (*node, value)
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
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn
                .open_table(PROFICIENCY_TABLE)
                .map_err(redb_err("open_table"))?;
            for (&node, &value) in values {
                let key = (user.0, node.get());
                let previous = match table.get(key).map_err(redb_err("get"))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                };
                let bytes = encode(&ProficiencyRecord::next(previous.as_ref(), value, now))?;
                table
                    .insert(key, bytes.as_slice())
                    .map_err(redb_err("insert"))?;
            }
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    fn records(
        &self,
        user: UserId,
        nodes: &[NodeId],
    ) -> StoreResult<HashMap<NodeId, ProficiencyRecord>> {
        self.read_records(user, nodes)
    }

    fn user_records(&self, user: UserId) -> StoreResult<BTreeMap<NodeId, ProficiencyRecord>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn
            .open_table(PROFICIENCY_TABLE)
            .map_err(redb_err("open_table"))?;
        let mut found = BTreeMap::new();
        for item in table
            .range((user.0, 0)..=(user.0, u64::MAX))
            .map_err(redb_err("range"))?
        {
            let (key, value) = item.map_err(redb_err("range"))?;
            let (_, raw_node) = key.value();
            if let Some(node) = NodeId::new(raw_node) {
                found.insert(node, decode(value.value())?);
            }
        }
        Ok(found)
    }

    fn default_proficiency(&self) -> f64 {
        self.default
    }
}

impl MasteryHistory for DurableStore {
    fn mastered_by(&self, node: NodeId, threshold: f64) -> StoreResult<HashSet<UserId>> {
        Ok(self
            .mastered_sets(&[node], threshold)?
            .remove(&node)
            .unwrap_or_default())
    }

    /// One pass over the proficiency table, whatever the number of nodes.
    fn mastered_sets(
        &self,
        nodes: &[NodeId],
        threshold: f64,
    ) -> StoreResult<HashMap<NodeId, HashSet<UserId>>> {
        let mut sets: HashMap<NodeId, HashSet<UserId>> =
            nodes.iter().map(|&node| (node, HashSet::new())).collect();
        if sets.is_empty() {
            return Ok(sets);
        }
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn
            .open_table(PROFICIENCY_TABLE)
            .map_err(redb_err("open_table"))?;
        for item in table.iter().map_err(redb_err("iter"))? {
            let (key, value) = item.map_err(redb_err("iter"))?;
            let (user, raw_node) = key.value();
            let Some(set) = NodeId::new(raw_node).and_then(|node| sets.get_mut(&node)) else {
                continue;
            };
            if decode(value.value())?.proficiency > threshold {
                set.insert(UserId(user));
            }
        }
        Ok(sets)
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("default", &self.default)
            .finish()
    }
}
