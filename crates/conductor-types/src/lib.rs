//! Shared errors and state containers for the Conductor graph engine.
//!
//! This crate provides the foundational types used across all other Conductor crates:
//! - `ConductorError` - unified error taxonomy
//! - `StructuralError`, `CheckpointError`, `StateError` - per-subsystem errors
//! - `GraphState` - the reducer contract every workflow state implements
//! - `StateMap` - serializable key-value bag for dynamic pipeline metadata

pub mod state;

pub use state::{GraphState, StateMap};

/// Unified error type for all Conductor subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    // === Structural Errors ===
    #[error("Graph '{graph}' failed validation: {source}")]
    Structural {
        graph: String,
        #[source]
        source: StructuralError,
    },

    // === Execution Errors ===
    #[error("Node '{node}' failed in graph '{graph}': {source}")]
    NodeFailed {
        graph: String,
        node: String,
        #[source]
        source: Box<ConductorError>,
    },

    #[error("Execution of graph '{graph}' was cancelled")]
    Cancelled { graph: String },

    #[error("Execution of graph '{graph}' exceeded its deadline of {timeout_ms}ms")]
    DeadlineExceeded { graph: String, timeout_ms: u64 },

    #[error("Internal invariant violated: {0}")]
    Internal(String),

    // === Checkpoint Errors ===
    #[error("Cannot resume graph '{graph}' from checkpoint '{checkpoint}': {source}")]
    ResumeFailed {
        graph: String,
        checkpoint: String,
        #[source]
        source: CheckpointError,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    // === State Errors ===
    #[error("State error: {0}")]
    State(#[from] StateError),

    // === Node Errors ===
    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Node '{node}' gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        node: String,
        attempts: u32,
        #[source]
        source: Box<ConductorError>,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ConductorError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConductorError::CommandTimeout { .. } | ConductorError::Transient(_)
        )
    }

    /// Returns `true` if the run was aborted by its caller (cancellation or
    /// deadline) rather than by failing work.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            ConductorError::Cancelled { .. } | ConductorError::DeadlineExceeded { .. }
        )
    }

    /// Returns `true` if the graph was rejected before any node ran.
    pub fn is_structural(&self) -> bool {
        matches!(self, ConductorError::Structural { .. })
    }

    /// The id of the node that originated a [`NodeFailed`](ConductorError::NodeFailed) error.
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            ConductorError::NodeFailed { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, ConductorError>`.
pub type Result<T> = std::result::Result<T, ConductorError>;

// ---------------------------------------------------------------------------
// StructuralError - graph definition problems
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error("duplicate node '{0}'")]
    DuplicateNode(String),

    #[error("start node '{0}' is not registered")]
    MissingStart(String),

    #[error("end node '{0}' is not registered")]
    MissingEnd(String),

    #[error("node '{node}' depends on unregistered node '{dependency}'")]
    DanglingDependency { node: String, dependency: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

// ---------------------------------------------------------------------------
// CheckpointError - durable snapshot persistence
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("no checkpoints stored for graph '{graph}'")]
    NotFound { graph: String },

    #[error("checkpoint '{id}' does not exist")]
    UnknownCheckpoint { id: String },

    #[error("checkpoint '{id}' belongs to graph '{found}', not '{expected}'")]
    GraphMismatch {
        id: String,
        expected: String,
        found: String,
    },

    #[error("checkpoint '{id}' is not recoverable")]
    NotRecoverable { id: String },

    #[error("checkpoint '{id}' lists node '{node}' which is not part of the graph")]
    UnknownNode { id: String, node: String },

    #[error("no checkpoint store configured")]
    StoreUnavailable,

    #[error("invalid graph id for checkpoint storage: '{0}'")]
    InvalidGraphId(String),

    #[error("invalid checkpoint id for checkpoint storage: '{0}'")]
    InvalidCheckpointId(String),

    #[error("checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// StateError - typed access to state values
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state key '{key}' is missing")]
    MissingKey { key: String },

    #[error("state key '{key}' holds an unexpected value type (expected {expected}): {message}")]
    UnexpectedType {
        key: String,
        expected: &'static str,
        message: String,
    },

    #[error("state encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_node_failed_includes_graph_and_node() {
        let err = ConductorError::NodeFailed {
            graph: "pipeline".into(),
            node: "analyze".into(),
            source: Box::new(ConductorError::Other("boom".into())),
        };
        assert_eq!(
            err.to_string(),
            "Node 'analyze' failed in graph 'pipeline': boom"
        );
        assert_eq!(err.failed_node(), Some("analyze"));
    }

    #[test]
    fn error_display_structural() {
        let err = ConductorError::Structural {
            graph: "g".into(),
            source: StructuralError::MissingStart("start".into()),
        };
        assert_eq!(
            err.to_string(),
            "Graph 'g' failed validation: start node 'start' is not registered"
        );
        assert!(err.is_structural());
    }

    #[test]
    fn error_display_cycle_path() {
        let err = StructuralError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn error_display_dangling_dependency() {
        let err = StructuralError::DanglingDependency {
            node: "plan".into(),
            dependency: "ghost".into(),
        };
        assert_eq!(
            err.to_string(),
            "node 'plan' depends on unregistered node 'ghost'"
        );
    }

    #[test]
    fn error_display_deadline() {
        let err = ConductorError::DeadlineExceeded {
            graph: "g".into(),
            timeout_ms: 1500,
        };
        assert_eq!(
            err.to_string(),
            "Execution of graph 'g' exceeded its deadline of 1500ms"
        );
    }

    #[test]
    fn error_display_resume_failed() {
        let err = ConductorError::ResumeFailed {
            graph: "g".into(),
            checkpoint: "cp-1".into(),
            source: CheckpointError::UnknownCheckpoint { id: "cp-1".into() },
        };
        assert_eq!(
            err.to_string(),
            "Cannot resume graph 'g' from checkpoint 'cp-1': checkpoint 'cp-1' does not exist"
        );
    }

    #[test]
    fn error_display_unexpected_type() {
        let err = StateError::UnexpectedType {
            key: "x".into(),
            expected: "i64",
            message: "invalid type: string \"one\", expected i64".into(),
        };
        assert!(err.to_string().starts_with("state key 'x' holds an unexpected value type"));
    }

    // --- classifiers ---

    #[test]
    fn cancellation_is_distinct_from_node_failure() {
        let cancelled = ConductorError::Cancelled { graph: "g".into() };
        let deadline = ConductorError::DeadlineExceeded {
            graph: "g".into(),
            timeout_ms: 10,
        };
        let failed = ConductorError::NodeFailed {
            graph: "g".into(),
            node: "n".into(),
            source: Box::new(ConductorError::Other("x".into())),
        };
        assert!(cancelled.is_cancellation());
        assert!(deadline.is_cancellation());
        assert!(!failed.is_cancellation());
    }

    #[test]
    fn retryable_errors() {
        assert!(ConductorError::Transient("flaky".into()).is_retryable());
        assert!(ConductorError::CommandTimeout {
            command: "cargo test".into(),
            timeout_ms: 1000
        }
        .is_retryable());
        assert!(!ConductorError::Other("nope".into()).is_retryable());
        assert!(!ConductorError::Cancelled { graph: "g".into() }.is_retryable());
    }

    #[test]
    fn retries_exhausted_is_not_retried_again() {
        let err = ConductorError::RetriesExhausted {
            node: "test".into(),
            attempts: 3,
            source: Box::new(ConductorError::Transient("flaky".into())),
        };
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Node 'test' gave up after 3 attempts: Transient failure: flaky"
        );
    }

    // --- From impls ---

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ConductorError = io_err.into();
        assert!(matches!(err, ConductorError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn from_state_error() {
        let err: ConductorError = StateError::MissingKey { key: "sum".into() }.into();
        assert!(matches!(err, ConductorError::State(_)));
        assert_eq!(err.to_string(), "State error: state key 'sum' is missing");
    }

    #[test]
    fn from_checkpoint_error() {
        let err: ConductorError = CheckpointError::NotFound { graph: "g".into() }.into();
        assert!(matches!(err, ConductorError::Checkpoint(_)));
    }
}
