//! Per-run execution metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;

/// Bookkeeping for one execution of a graph. Owned by the executor for the
/// duration of the run and returned with the final state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub graph_id: String,
    pub execution_id: String,
    /// Node currently running (sequential path) or the last node to start.
    pub current_node: Option<String>,
    /// Nodes whose action ran to completion, in completion order.
    pub completed_nodes: Vec<String>,
    /// Conditional nodes whose predicate was false.
    pub skipped_nodes: Vec<String>,
    pub started_at: DateTime<Utc>,
    /// Sequence number for the next checkpoint. Continues across a resume so
    /// checkpoints of one execution stay strictly ordered.
    pub checkpoint_sequence: u64,
}

impl ExecutionContext {
    pub fn new(graph_id: impl Into<String>) -> Self {
        Self {
            graph_id: graph_id.into(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            current_node: None,
            completed_nodes: Vec::new(),
            skipped_nodes: Vec::new(),
            started_at: Utc::now(),
            checkpoint_sequence: 0,
        }
    }

    /// Rebuild the context recorded in a checkpoint. The execution id is kept
    /// so a resumed run continues the same logical execution.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            graph_id: checkpoint.graph_id.clone(),
            execution_id: checkpoint.execution_id.clone(),
            current_node: None,
            completed_nodes: checkpoint.completed_nodes.clone(),
            skipped_nodes: checkpoint.skipped_nodes.clone(),
            started_at: Utc::now(),
            checkpoint_sequence: checkpoint.sequence + 1,
        }
    }

    pub fn last_completed_node(&self) -> Option<&str> {
        self.completed_nodes.last().map(String::as_str)
    }

    pub fn is_completed(&self, node: &str) -> bool {
        self.completed_nodes.iter().any(|n| n == node)
    }

    pub fn is_skipped(&self, node: &str) -> bool {
        self.skipped_nodes.iter().any(|n| n == node)
    }

    /// True once the node needs no further work: it either ran or was skipped.
    pub fn is_settled(&self, node: &str) -> bool {
        self.is_completed(node) || self.is_skipped(node)
    }

    pub(crate) fn mark_completed(&mut self, node: &str) {
        self.completed_nodes.push(node.to_string());
    }

    pub(crate) fn mark_skipped(&mut self, node: &str) {
        self.skipped_nodes.push(node.to_string());
    }

    /// Elapsed wall-clock time since the run (or resume) started.
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_is_empty_with_fresh_id() {
        let a = ExecutionContext::new("g");
        let b = ExecutionContext::new("g");
        assert_eq!(a.graph_id, "g");
        assert!(a.completed_nodes.is_empty());
        assert!(a.last_completed_node().is_none());
        assert_ne!(a.execution_id, b.execution_id);
        assert!(uuid::Uuid::parse_str(&a.execution_id).is_ok());
    }

    #[test]
    fn tracks_completed_and_skipped_separately() {
        let mut cx = ExecutionContext::new("g");
        cx.mark_completed("start");
        cx.mark_completed("analyze");
        cx.mark_skipped("lint");

        assert_eq!(cx.last_completed_node(), Some("analyze"));
        assert!(cx.is_completed("start"));
        assert!(!cx.is_completed("lint"));
        assert!(cx.is_skipped("lint"));
        assert!(cx.is_settled("lint"));
        assert!(!cx.is_settled("report"));
    }
}
