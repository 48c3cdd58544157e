//! Rich diagnostic error types for the proficio engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so callers know exactly
//! what went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the proficio engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum ProficioError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    EdgeWeight(#[from] EdgeWeightError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Propagation(#[from] PropagationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Rejection of an assessment before any computation starts.
///
/// A validation error always rejects the whole run; nothing is written.
#[derive(Debug, Error, Diagnostic)]
pub enum ValidationError {
    #[error("performance score {score} for node {node_id} is outside [0, 1]")]
    #[diagnostic(
        code(proficio::validation::score_out_of_range),
        help(
            "Performance scores are the fraction of marks earned and must lie in [0, 1]. \
             Scores are rejected rather than clamped; fix the caller's scoring."
        )
    )]
    ScoreOutOfRange { node_id: u64, score: f64 },

    #[error("assessment references unknown node {node_id}")]
    #[diagnostic(
        code(proficio::validation::unknown_node),
        help(
            "Every tested node must exist in the concept graph. \
             Ingest the node first or drop it from the assessment."
        )
    )]
    UnknownNode { node_id: u64 },

    #[error("node {node_id} appears more than once in the assessment")]
    #[diagnostic(
        code(proficio::validation::duplicate_node),
        help("Aggregate the scores for a node into a single result before submitting.")
    )]
    DuplicateNode { node_id: u64 },
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("graph store unavailable: {message}")]
    #[diagnostic(
        code(proficio::graph::unavailable),
        help(
            "The graph store could not be reached. The operation was retried with \
             exponential backoff; check the store's health and retry later."
        )
    )]
    Unavailable { message: String },

    #[error("node not found: {node_id}")]
    #[diagnostic(
        code(proficio::graph::node_not_found),
        help("The node has not been ingested into the concept graph.")
    )]
    NodeNotFound { node_id: u64 },

    #[error("node {node_id} already exists")]
    #[diagnostic(
        code(proficio::graph::duplicate_node),
        help(
            "Nodes are immutable once created. Use `reassign_cluster` to move a node \
             to another cluster."
        )
    )]
    DuplicateNode { node_id: u64 },

    #[error("cluster not found: {cluster_id}")]
    #[diagnostic(
        code(proficio::graph::cluster_not_found),
        help("Declare the cluster before assigning nodes to it.")
    )]
    ClusterNotFound { cluster_id: u64 },

    #[error("edge {from} -> {to} is not declared")]
    #[diagnostic(
        code(proficio::graph::edge_not_declared),
        help("Weights can only be written for edges declared in the graph.")
    )]
    EdgeNotDeclared { from: u64, to: u64 },

    #[error("edge weight {weight} for {from} -> {to} is outside [0, 1]")]
    #[diagnostic(
        code(proficio::graph::invalid_weight),
        help("Edge weights are conditional probabilities and must lie in [0, 1].")
    )]
    InvalidWeight { from: u64, to: u64, weight: f64 },

    #[error("edge {from} -> {to} has sample size 0")]
    #[diagnostic(
        code(proficio::graph::zero_sample),
        help(
            "An edge weight estimated from zero learners carries no information \
             and is never stored. Wait until mastery data exists."
        )
    )]
    ZeroSampleSize { from: u64, to: u64 },
}

impl GraphError {
    /// Whether the error is transient and the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(proficio::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(proficio::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             If it persists, try running with a fresh data directory."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(proficio::store::serde),
        help(
            "Failed to serialize or deserialize a stored record. \
             The stored data format may have changed between versions."
        )
    )]
    Serialization { message: String },

    #[error("refusing to store non-finite proficiency {value} for node {node_id}")]
    #[diagnostic(
        code(proficio::store::invalid_value),
        help("Proficiency values must be finite numbers in [0, 1].")
    )]
    InvalidValue { node_id: u64, value: f64 },

    #[error("proficiency store unavailable: {message}")]
    #[diagnostic(
        code(proficio::store::unavailable),
        help("The proficiency store could not be reached. Retry later.")
    )]
    Unavailable { message: String },
}

// ---------------------------------------------------------------------------
// Edge weight errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EdgeWeightError {
    #[error("graph snapshot {requested} is stale (current snapshot is {current})")]
    #[diagnostic(
        code(proficio::weights::snapshot_mismatch),
        help(
            "The graph structure changed after the snapshot id was taken. \
             Fetch the current snapshot id and rerun the recalculation."
        )
    )]
    SnapshotMismatch { requested: u64, current: u64 },

    #[error(
        "edge weight recalculation failed: {failed} of {total} edges failed \
         (required success ratio {required_ratio})"
    )]
    #[diagnostic(
        code(proficio::weights::too_many_failures),
        help(
            "Too many edges could not be recomputed; no weights were written and \
             the previous weight set is still in effect. Inspect the per-edge \
             failures in the logs."
        )
    )]
    TooManyFailures {
        failed: usize,
        total: usize,
        required_ratio: f64,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Propagation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PropagationError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("propagation run for {user} was cancelled")]
    #[diagnostic(
        code(proficio::propagation::cancelled),
        help("The run was cancelled before persisting; no proficiency values were written.")
    )]
    Cancelled { user: String },

    #[error("propagation run for {user} timed out after {elapsed_ms} ms")]
    #[diagnostic(
        code(proficio::propagation::timed_out),
        help(
            "The run exceeded its deadline and was abandoned before persisting. \
             Increase `propagation.timeout_ms` or check graph store latency."
        )
    )]
    TimedOut { user: String, elapsed_ms: u128 },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(proficio::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(proficio::config::parse),
        help("Check the TOML syntax in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(proficio::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config value for `{field}`: {message}")]
    #[diagnostic(
        code(proficio::config::invalid),
        help("Fix the value in the config file or in the EngineConfig passed to Engine::new().")
    )]
    Invalid { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("data directory error: {path}")]
    #[diagnostic(
        code(proficio::engine::data_dir),
        help(
            "The data directory could not be accessed. \
             Ensure the path exists and has read/write permissions."
        )
    )]
    DataDir { path: String },

    #[error("failed to load graph snapshot: {message}")]
    #[diagnostic(
        code(proficio::engine::graph_load),
        help("The graph snapshot is malformed. Re-ingest the graph from its JSON source.")
    )]
    GraphLoad { message: String },
}

/// Convenience alias for functions returning proficio results.
pub type ProficioResult<T> = std::result::Result<T, ProficioError>;
