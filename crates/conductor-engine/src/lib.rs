//! DAG execution engine: node abstraction, graph builder, validation,
//! scheduling, batch execution, and checkpoint/resume.
//!
//! A workflow is a set of [`Node`]s registered on a [`GraphBuilder`]. Building
//! validates the graph and computes its topological [`Batch`]es; the
//! [`Executor`] then runs those batches, in parallel where every node of a
//! batch allows it, and snapshots progress into a [`CheckpointStore`].

pub mod checkpoint;
pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
pub mod node;
pub mod retry;
pub mod scheduler;
pub mod validation;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use context::ExecutionContext;
pub use events::{EngineEvent, EventEmitter};
pub use executor::{CheckpointPolicy, ExecutionResult, Executor, ExecutorConfig};
pub use graph::{Graph, GraphBuilder, DEFAULT_END, DEFAULT_START};
pub use node::{Condition, FnAction, Node, NodeAction, NodeContext};
pub use retry::{BackoffPolicy, RetryPolicy, Retrying};
pub use scheduler::{schedule, Batch};
pub use validation::{check_structure, lint, validate_or_raise, Diagnostic, LintRule, Severity};

pub use conductor_types::{ConductorError, GraphState, Result, StateMap};
pub use tokio_util::sync::CancellationToken;
