//! Export types for serializing engine state.
//!
//! These types provide flat, label-resolved representations of edge weights,
//! learner proficiencies and cluster summaries suitable for JSON export.

use serde::{Deserialize, Serialize};

/// Exported edge with resolved endpoint labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeExport {
    pub from: u64,
    pub from_label: String,
    pub to: u64,
    pub to_label: String,
    /// `None` while the edge has no computed weight.
    pub weight: Option<f64>,
    pub sample_size: Option<u64>,
    /// Seconds since UNIX epoch.
    pub calculated_at: Option<u64>,
}

/// Exported proficiency record of one learner on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProficiencyExport {
    pub user: u64,
    pub node: u64,
    pub label: String,
    pub proficiency: f64,
    pub interactions_count: u64,
    pub last_updated: u64,
}

/// Mean proficiency of a learner over one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterProficiency {
    pub cluster: u64,
    pub name: String,
    /// Mean over all members, using the default for unassessed ones.
    pub mean: f64,
    pub members: usize,
    /// Members with a stored record.
    pub assessed: usize,
}

/// Full export document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineExport {
    pub snapshot_id: u64,
    pub edges: Vec<EdgeExport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proficiencies: Vec<ProficiencyExport>,
}
