// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # proficio
//!
//! A hierarchical knowledge proficiency propagation engine: estimates a
//! learner's mastery of many curriculum concepts from a few assessment
//! results by diffusing evidence over a weighted concept graph.
//!
//! ## Architecture
//!
//! - **Concept graph** (`graph`): petgraph-backed nodes, prerequisite edges and clusters
//! - **Proficiency storage** (`store`): in-memory (DashMap) or durable (redb)
//! - **Batch retrieval** (`batch`): one store operation per set of lookups
//! - **Propagation** (`propagation`): cluster baseline, neighbor and direct tiers
//! - **Centroid selection** (`centroid`): representative, assessable node per cluster
//! - **Edge weights** (`weights`): conditional mastery probabilities from cohort data
//!
//! ## Library usage
//!
//! ```no_run
//! use proficio::config::EngineConfig;
//! use proficio::engine::Engine;
//! use proficio::node::{NodeId, UserId};
//! use proficio::propagation::AssessmentResult;
//!
//! let engine = Engine::new(EngineConfig::in_memory()).unwrap();
//! engine
//!     .ingest_json(r#"{"clusters": [{"id": 1, "name": "fractions"}],
//!                      "nodes": [{"id": 1, "subject": "math", "grade": 5, "cluster": 1}]}"#)
//!     .unwrap();
//! let node = NodeId::new(1).unwrap();
//! let update = engine
//!     .compute_proficiency_update(UserId(7), &[AssessmentResult::new(node, 0.9)])
//!     .unwrap();
//! assert!(update.get(node).is_some());
//! ```

pub mod batch;
pub mod centroid;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod graph;
pub mod item_bank;
pub mod node;
pub mod propagation;
pub mod retry;
pub mod store;
pub mod weights;
