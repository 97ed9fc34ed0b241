//! Engine event system for observability.
//!
//! Emits [`EngineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (loggers, progress bars, tests) can follow an execution without
//! coupling to the executor internals.

use serde::{Deserialize, Serialize};

/// Events emitted during graph execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    ExecutionStarted {
        graph: String,
        execution_id: String,
        node_count: usize,
        resumed: bool,
    },
    ExecutionCompleted {
        graph: String,
        execution_id: String,
        completed_nodes: Vec<String>,
        duration_ms: u64,
    },
    ExecutionFailed {
        graph: String,
        execution_id: String,
        node: Option<String>,
        error: String,
    },
    ExecutionCancelled {
        graph: String,
        execution_id: String,
        reason: String,
    },
    BatchStarted {
        index: usize,
        nodes: Vec<String>,
        parallel: bool,
    },
    NodeStarted {
        node: String,
    },
    NodeCompleted {
        node: String,
        duration_ms: u64,
    },
    NodeSkipped {
        node: String,
    },
    NodeFailed {
        node: String,
        error: String,
    },
    CheckpointSaved {
        checkpoint_id: String,
        sequence: u64,
        last_completed_node: Option<String>,
    },
    CheckpointFailed {
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers. Dropped silently when nobody
    /// is listening.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(EngineEvent::BatchStarted {
            index: 1,
            nodes: vec!["b".into(), "c".into()],
            parallel: true,
        });

        match rx.recv().await.unwrap() {
            EngineEvent::BatchStarted { index, nodes, parallel } => {
                assert_eq!(index, 1);
                assert_eq!(nodes, vec!["b", "c"]);
                assert!(parallel);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(EngineEvent::NodeSkipped { node: "lint".into() });

        assert_eq!(rx1.recv().await.unwrap(), rx2.recv().await.unwrap());
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(EngineEvent::CheckpointFailed {
            error: "disk full".into(),
        });
    }

    #[test]
    fn events_serialize_with_variant_tag() {
        let event = EngineEvent::NodeCompleted {
            node: "plan".into(),
            duration_ms: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["NodeCompleted"]["node"], "plan");
        assert_eq!(json["NodeCompleted"]["duration_ms"], 42);
    }
}
