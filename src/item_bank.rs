//! Assessment item availability.
//!
//! The item bank itself lives outside this crate; the centroid selector only
//! needs to know whether a node has items of a given difficulty. [`MemItemBank`]
//! is the in-process implementation used by the CLI and tests.

use std::str::FromStr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Difficulty band of an assessment item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemDifficulty {
    Easy,
    Medium,
    Hard,
}

impl std::fmt::Display for ItemDifficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Medium => write!(f, "medium"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

impl FromStr for ItemDifficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            other => Err(format!("unknown item difficulty: {other}")),
        }
    }
}

/// Item availability lookup.
pub trait ItemBank: Send + Sync {
    /// Whether at least one item of `difficulty` exists for `node`.
    fn has_items(&self, node: NodeId, difficulty: ItemDifficulty) -> bool;
}

/// Item counts per `(node, difficulty)` held in memory.
#[derive(Debug, Default)]
pub struct MemItemBank {
    counts: DashMap<(NodeId, ItemDifficulty), usize>,
}

/// One line of an item inventory file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemInventory {
    pub node: NodeId,
    pub difficulty: ItemDifficulty,
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

impl MemItemBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `count` additional items for a node.
    pub fn add_items(&self, node: NodeId, difficulty: ItemDifficulty, count: usize) {
        *self.counts.entry((node, difficulty)).or_insert(0) += count;
    }

    /// Load an inventory listing.
    pub fn extend(&self, inventory: &[ItemInventory]) {
        for entry in inventory {
            self.add_items(entry.node, entry.difficulty, entry.count);
        }
    }

    /// The whole bank as an inventory listing, ordered by node then difficulty.
    pub fn inventory(&self) -> Vec<ItemInventory> {
        let mut listing: Vec<ItemInventory> = self
            .counts
            .iter()
            .filter(|e| *e.value() > 0)
            .map(|e| ItemInventory {
                node: e.key().0,
                difficulty: e.key().1,
                count: *e.value(),
            })
            .collect();
        listing.sort_by_key(|i| (i.node, i.difficulty as u8));
        listing
    }

    /// Number of items registered for a node and difficulty.
    pub fn count(&self, node: NodeId, difficulty: ItemDifficulty) -> usize {
        self.counts
            .get(&(node, difficulty))
            .map_or(0, |c| *c.value())
    }
}

impl ItemBank for MemItemBank {
    fn has_items(&self, node: NodeId, difficulty: ItemDifficulty) -> bool {
        self.count(node, difficulty) > 0
    }
}
