//! Batch-by-batch graph execution.
//!
//! The executor walks the precomputed batches of a [`Graph`]. A batch runs
//! sequentially unless it holds more than one node and every node is
//! parallel-safe; then each node runs on its own clone of the state and the
//! branches are merged back in batch order once all of them finished. The
//! first failure in a batch cancels its siblings and ends the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use conductor_types::{CheckpointError, ConductorError, GraphState, Result};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::context::ExecutionContext;
use crate::events::{EngineEvent, EventEmitter};
use crate::graph::Graph;
use crate::node::{invoke, Node, NodeContext};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// When the executor writes recoverable checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    Never,
    /// After every batch that ran at least one node.
    #[default]
    EveryBatch,
    /// After the first batch boundary at which at least `n` nodes ran since
    /// the previous checkpoint.
    EveryNodes(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running nodes within a parallel batch.
    pub max_concurrency: usize,
    pub checkpoint: CheckpointPolicy,
    /// Deadline for the whole run, in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            checkpoint: CheckpointPolicy::EveryBatch,
            timeout_ms: None,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Final state of a successful run plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct ExecutionResult<S> {
    pub state: S,
    pub context: ExecutionContext,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs a validated graph. One executor may drive many concurrent executions;
/// each call owns its own state and context.
pub struct Executor<S> {
    graph: Arc<Graph<S>>,
    config: ExecutorConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    events: EventEmitter,
}

/// Tokens that decide whether a run should stop. `run` is a child of
/// `caller`; the deadline watcher cancels only `run`, which is how a timeout
/// is told apart from a caller cancellation.
struct Interrupts<'a> {
    caller: &'a CancellationToken,
    run: &'a CancellationToken,
}

impl<S: GraphState> Executor<S> {
    pub fn new(graph: impl Into<Arc<Graph<S>>>) -> Self {
        Self {
            graph: graph.into(),
            config: ExecutorConfig::default(),
            store: None,
            events: EventEmitter::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn graph(&self) -> &Graph<S> {
        &self.graph
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Run the graph from the start with `initial` as the input state.
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        initial: S,
    ) -> Result<ExecutionResult<S>> {
        let cx = ExecutionContext::new(self.graph.name());
        self.drive(cancel, cx, initial, false).await
    }

    /// Continue an earlier run from a specific checkpoint.
    pub async fn resume(
        &self,
        cancel: CancellationToken,
        checkpoint_id: &str,
    ) -> Result<ExecutionResult<S>> {
        let store = self.store_for_resume(checkpoint_id)?;
        let checkpoint = store
            .get(checkpoint_id)
            .await
            .map_err(|source| self.resume_failed(checkpoint_id, source))?;
        self.resume_from(cancel, checkpoint).await
    }

    /// Continue from the newest checkpoint stored for this graph.
    pub async fn resume_latest(&self, cancel: CancellationToken) -> Result<ExecutionResult<S>> {
        let store = self.store_for_resume("latest")?;
        let checkpoint = store
            .load(self.graph.name())
            .await
            .map_err(|source| self.resume_failed("latest", source))?;
        self.resume_from(cancel, checkpoint).await
    }

    /// Continue from an already loaded checkpoint. Completed and skipped
    /// nodes are not run again.
    pub async fn resume_from(
        &self,
        cancel: CancellationToken,
        checkpoint: Checkpoint,
    ) -> Result<ExecutionResult<S>> {
        self.check_resumable(&checkpoint)
            .map_err(|source| self.resume_failed(&checkpoint.id, source))?;
        let state: S = checkpoint.restore()?;
        let mut cx = ExecutionContext::from_checkpoint(&checkpoint);
        cx.checkpoint_sequence = self.next_sequence(&checkpoint).await;

        tracing::info!(
            graph = %self.graph.name(),
            checkpoint = %checkpoint.id,
            completed = cx.completed_nodes.len(),
            "Resuming from checkpoint"
        );
        self.drive(cancel, cx, state, true).await
    }

    /// One past the highest sequence stored for the checkpoint's execution,
    /// so resuming from an older checkpoint never reuses a sequence number.
    async fn next_sequence(&self, checkpoint: &Checkpoint) -> u64 {
        let resumed_at = checkpoint.sequence + 1;
        let Some(store) = &self.store else {
            return resumed_at;
        };
        match store.list(&checkpoint.graph_id).await {
            Ok(stored) => stored
                .iter()
                .filter(|c| c.execution_id == checkpoint.execution_id)
                .map(|c| c.sequence + 1)
                .fold(resumed_at, u64::max),
            Err(err) => {
                tracing::warn!(
                    graph = %checkpoint.graph_id,
                    error = %err,
                    "Could not list checkpoints, continuing from the resumed sequence"
                );
                resumed_at
            }
        }
    }

    fn store_for_resume(&self, checkpoint_id: &str) -> Result<&Arc<dyn CheckpointStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| self.resume_failed(checkpoint_id, CheckpointError::StoreUnavailable))
    }

    fn resume_failed(&self, checkpoint_id: &str, source: CheckpointError) -> ConductorError {
        ConductorError::ResumeFailed {
            graph: self.graph.name().to_string(),
            checkpoint: checkpoint_id.to_string(),
            source,
        }
    }

    fn check_resumable(&self, checkpoint: &Checkpoint) -> std::result::Result<(), CheckpointError> {
        if checkpoint.graph_id != self.graph.name() {
            return Err(CheckpointError::GraphMismatch {
                id: checkpoint.id.clone(),
                expected: self.graph.name().to_string(),
                found: checkpoint.graph_id.clone(),
            });
        }
        if !checkpoint.recoverable {
            return Err(CheckpointError::NotRecoverable {
                id: checkpoint.id.clone(),
            });
        }
        let mut recorded = checkpoint.completed_nodes.iter().chain(&checkpoint.skipped_nodes);
        if let Some(unknown) = recorded.find(|n| !self.graph.contains(n)) {
            return Err(CheckpointError::UnknownNode {
                id: checkpoint.id.clone(),
                node: unknown.clone(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        cancel: CancellationToken,
        mut cx: ExecutionContext,
        state: S,
        resumed: bool,
    ) -> Result<ExecutionResult<S>> {
        let run = cancel.child_token();
        let finished = CancellationToken::new();
        let _finished_guard = finished.clone().drop_guard();
        if let Some(timeout) = self.config.timeout() {
            let run = run.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = finished.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => run.cancel(),
                }
            });
        }
        let interrupts = Interrupts {
            caller: &cancel,
            run: &run,
        };

        self.events.emit(EngineEvent::ExecutionStarted {
            graph: cx.graph_id.clone(),
            execution_id: cx.execution_id.clone(),
            node_count: self.graph.len(),
            resumed,
        });
        tracing::info!(
            graph = %cx.graph_id,
            execution_id = %cx.execution_id,
            nodes = self.graph.len(),
            batches = self.graph.batches().len(),
            resumed,
            "Execution started"
        );

        match self.run_batches(&interrupts, &mut cx, state).await {
            Ok(state) => {
                self.checkpoint(&mut cx, &state, false).await;
                let duration_ms = cx.elapsed_ms();
                tracing::info!(
                    graph = %cx.graph_id,
                    execution_id = %cx.execution_id,
                    completed = cx.completed_nodes.len(),
                    skipped = cx.skipped_nodes.len(),
                    duration_ms,
                    "Execution completed"
                );
                self.events.emit(EngineEvent::ExecutionCompleted {
                    graph: cx.graph_id.clone(),
                    execution_id: cx.execution_id.clone(),
                    completed_nodes: cx.completed_nodes.clone(),
                    duration_ms,
                });
                Ok(ExecutionResult { state, context: cx })
            }
            Err(err) if err.is_cancellation() => {
                tracing::warn!(graph = %cx.graph_id, execution_id = %cx.execution_id, error = %err, "Execution interrupted");
                self.events.emit(EngineEvent::ExecutionCancelled {
                    graph: cx.graph_id.clone(),
                    execution_id: cx.execution_id.clone(),
                    reason: err.to_string(),
                });
                Err(err)
            }
            Err(err) => {
                tracing::error!(graph = %cx.graph_id, execution_id = %cx.execution_id, error = %err, "Execution failed");
                self.events.emit(EngineEvent::ExecutionFailed {
                    graph: cx.graph_id.clone(),
                    execution_id: cx.execution_id.clone(),
                    node: err.failed_node().map(str::to_string),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_batches(
        &self,
        interrupts: &Interrupts<'_>,
        cx: &mut ExecutionContext,
        mut state: S,
    ) -> Result<S> {
        let mut since_checkpoint = 0usize;

        for batch in self.graph.batches() {
            let pending = batch
                .nodes
                .iter()
                .filter(|id| !cx.is_settled(id))
                .map(|id| self.node(id))
                .collect::<Result<Vec<_>>>()?;
            if pending.is_empty() {
                tracing::debug!(batch = batch.index, "Batch already settled, skipping");
                continue;
            }

            self.check_interrupt(interrupts)?;
            let parallel = batch.parallel && pending.len() > 1;
            self.events.emit(EngineEvent::BatchStarted {
                index: batch.index,
                nodes: pending.iter().map(|n| n.id().to_string()).collect(),
                parallel,
            });
            tracing::debug!(batch = batch.index, size = pending.len(), parallel, "Batch started");

            state = if parallel {
                self.run_parallel(interrupts, cx, &pending, state).await?
            } else {
                self.run_sequential(interrupts, cx, &pending, state).await?
            };

            since_checkpoint += pending.len();
            if self.checkpoint_due(since_checkpoint) {
                self.checkpoint(cx, &state, true).await;
                since_checkpoint = 0;
            }
        }

        Ok(state)
    }

    async fn run_sequential(
        &self,
        interrupts: &Interrupts<'_>,
        cx: &mut ExecutionContext,
        nodes: &[&Node<S>],
        mut state: S,
    ) -> Result<S> {
        for node in nodes {
            self.check_interrupt(interrupts)?;
            cx.current_node = Some(node.id().to_string());

            if !node.should_run(&state) {
                self.skip(cx, node.id());
                continue;
            }

            self.events.emit(EngineEvent::NodeStarted {
                node: node.id().to_string(),
            });
            tracing::debug!(node = %node.id(), "Node started");

            let started = Instant::now();
            let node_cx = self.node_context(cx, node.id(), interrupts.run.child_token());
            state = invoke(node.action(), node_cx, state)
                .await
                .map_err(|err| self.node_error(interrupts, node.id(), err))?;

            cx.mark_completed(node.id());
            self.completed(node.id(), started.elapsed());
        }
        Ok(state)
    }

    async fn run_parallel(
        &self,
        interrupts: &Interrupts<'_>,
        cx: &mut ExecutionContext,
        nodes: &[&Node<S>],
        base: S,
    ) -> Result<S> {
        let batch_token = interrupts.run.child_token();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut branches: Vec<Option<S>> = vec![None; nodes.len()];
        let mut skipped = vec![false; nodes.len()];
        let mut tasks = JoinSet::new();

        for (i, node) in nodes.iter().enumerate() {
            if !node.should_run(&base) {
                skipped[i] = true;
                continue;
            }
            cx.current_node = Some(node.id().to_string());
            self.events.emit(EngineEvent::NodeStarted {
                node: node.id().to_string(),
            });

            let action = node.action();
            let node_cx = self.node_context(cx, node.id(), batch_token.child_token());
            let branch = base.clone();
            let permits = Arc::clone(&permits);
            let token = batch_token.clone();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (i, None, Duration::ZERO),
                    },
                    _ = token.cancelled() => return (i, None, Duration::ZERO),
                };
                // Measured from the permit so queueing is not counted.
                let started = Instant::now();
                let outcome = invoke(action, node_cx, branch).await;
                (i, Some(outcome), started.elapsed())
            });
        }

        let mut failure: Option<ConductorError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (i, outcome, elapsed) = match joined {
                Ok(done) => done,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(ConductorError::Internal(format!("branch task failed: {e}")));
                        batch_token.cancel();
                        tasks.abort_all();
                    }
                    continue;
                }
            };
            match outcome {
                None => {}
                Some(Ok(branch)) => {
                    if failure.is_none() {
                        self.completed(nodes[i].id(), elapsed);
                    }
                    branches[i] = Some(branch);
                }
                Some(Err(err)) => {
                    if failure.is_none() {
                        tracing::debug!(node = %nodes[i].id(), "Branch failed, cancelling siblings");
                        failure = Some(self.node_error(interrupts, nodes[i].id(), err));
                        batch_token.cancel();
                        tasks.abort_all();
                    }
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let mut merged = base.clone();
        for (i, node) in nodes.iter().enumerate() {
            if skipped[i] {
                self.skip(cx, node.id());
                continue;
            }
            let Some(branch) = branches[i].take() else {
                // Only a fired run token leaves a branch without a result.
                self.check_interrupt(interrupts)?;
                return Err(ConductorError::Internal(format!(
                    "parallel branch '{}' finished without a result",
                    node.id()
                )));
            };
            merged
                .merge_branch(&base, branch)
                .map_err(|err| self.node_error(interrupts, node.id(), err.into()))?;
            cx.mark_completed(node.id());
        }
        Ok(merged)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn node(&self, id: &str) -> Result<&Node<S>> {
        self.graph
            .node(id)
            .ok_or_else(|| ConductorError::Internal(format!("scheduled node '{id}' is not in the graph")))
    }

    fn node_context(&self, cx: &ExecutionContext, node: &str, cancel: CancellationToken) -> NodeContext {
        NodeContext::new(cx.graph_id.clone(), cx.execution_id.clone(), node, cancel)
    }

    fn skip(&self, cx: &mut ExecutionContext, node: &str) {
        cx.mark_skipped(node);
        tracing::debug!(node = %node, "Condition not met, node skipped");
        self.events.emit(EngineEvent::NodeSkipped {
            node: node.to_string(),
        });
    }

    fn completed(&self, node: &str, elapsed: Duration) {
        let duration_ms = elapsed.as_millis() as u64;
        tracing::info!(node = %node, duration_ms, "Node completed");
        self.events.emit(EngineEvent::NodeCompleted {
            node: node.to_string(),
            duration_ms,
        });
    }

    fn interruption(&self, interrupts: &Interrupts<'_>) -> ConductorError {
        let graph = self.graph.name().to_string();
        if interrupts.caller.is_cancelled() {
            ConductorError::Cancelled { graph }
        } else {
            ConductorError::DeadlineExceeded {
                graph,
                timeout_ms: self.config.timeout_ms.unwrap_or_default(),
            }
        }
    }

    fn check_interrupt(&self, interrupts: &Interrupts<'_>) -> Result<()> {
        if interrupts.run.is_cancelled() {
            return Err(self.interruption(interrupts));
        }
        Ok(())
    }

    /// Classify an error coming out of a node. Anything raised while the run
    /// is being interrupted is reported as the interruption itself.
    fn node_error(&self, interrupts: &Interrupts<'_>, node: &str, err: ConductorError) -> ConductorError {
        if interrupts.run.is_cancelled() {
            return self.interruption(interrupts);
        }
        if err.is_cancellation() {
            return err;
        }
        tracing::error!(node = %node, error = %err, "Node failed");
        self.events.emit(EngineEvent::NodeFailed {
            node: node.to_string(),
            error: err.to_string(),
        });
        ConductorError::NodeFailed {
            graph: self.graph.name().to_string(),
            node: node.to_string(),
            source: Box::new(err),
        }
    }

    fn checkpoint_due(&self, nodes_since_last: usize) -> bool {
        match self.config.checkpoint {
            CheckpointPolicy::Never => false,
            CheckpointPolicy::EveryBatch => nodes_since_last > 0,
            CheckpointPolicy::EveryNodes(n) => nodes_since_last >= n.max(1),
        }
    }

    /// Best effort: a failed save is logged and reported as an event but never
    /// fails the run.
    async fn checkpoint(&self, cx: &mut ExecutionContext, state: &S, recoverable: bool) {
        let Some(store) = &self.store else {
            return;
        };
        if self.config.checkpoint == CheckpointPolicy::Never {
            return;
        }

        let saved = match Checkpoint::capture(cx, state, recoverable) {
            Ok(checkpoint) => store
                .save(&checkpoint)
                .await
                .map(|()| checkpoint)
                .map_err(ConductorError::from),
            Err(err) => Err(err.into()),
        };
        cx.checkpoint_sequence += 1;

        match saved {
            Ok(checkpoint) => {
                tracing::debug!(
                    checkpoint = %checkpoint.id,
                    sequence = checkpoint.sequence,
                    recoverable,
                    "Checkpoint saved"
                );
                self.events.emit(EngineEvent::CheckpointSaved {
                    checkpoint_id: checkpoint.id,
                    sequence: checkpoint.sequence,
                    last_completed_node: checkpoint.last_completed_node,
                });
            }
            Err(err) => {
                tracing::warn!(graph = %cx.graph_id, error = %err, "Checkpoint save failed, continuing");
                self.events.emit(EngineEvent::CheckpointFailed {
                    error: err.to_string(),
                });
            }
        }
    }
}

impl<S> std::fmt::Debug for Executor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("graph", &self.graph)
            .field("config", &self.config)
            .field("checkpoints", &self.store.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::graph::GraphBuilder;
    use conductor_types::StateMap;

    fn add(id: &str, deps: &[&str], key: &'static str, value: i64) -> Node<StateMap> {
        Node::from_fn(id, move |_cx, mut state: StateMap| async move {
            state.set(key, value)?;
            Ok::<_, ConductorError>(state)
        })
        .depends_on(deps.iter().copied())
    }

    fn chain() -> Graph<StateMap> {
        let mut g = GraphBuilder::new("chain");
        g.add_node(add("start", &[], "a", 1)).unwrap();
        g.add_node(add("middle", &["start"], "b", 2)).unwrap();
        g.add_node(add("end", &["middle"], "c", 3)).unwrap();
        g.build().unwrap()
    }

    #[test]
    fn config_defaults_and_partial_json() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.checkpoint, CheckpointPolicy::EveryBatch);
        assert!(config.timeout().is_none());

        let parsed: ExecutorConfig =
            serde_json::from_str(r#"{"checkpoint": {"every_nodes": 3}, "timeout_ms": 250}"#).unwrap();
        assert_eq!(parsed.max_concurrency, 4);
        assert_eq!(parsed.checkpoint, CheckpointPolicy::EveryNodes(3));
        assert_eq!(parsed.timeout(), Some(Duration::from_millis(250)));

        let never: ExecutorConfig = serde_json::from_str(r#"{"checkpoint": "never"}"#).unwrap();
        assert_eq!(never.checkpoint, CheckpointPolicy::Never);
    }

    #[test]
    fn checkpoint_due_follows_policy() {
        let exec = Executor::new(chain());
        assert!(exec.checkpoint_due(1));
        assert!(!exec.checkpoint_due(0));

        let every_two = Executor::new(chain()).with_config(ExecutorConfig {
            checkpoint: CheckpointPolicy::EveryNodes(2),
            ..ExecutorConfig::default()
        });
        assert!(!every_two.checkpoint_due(1));
        assert!(every_two.checkpoint_due(2));

        let never = Executor::new(chain()).with_config(ExecutorConfig {
            checkpoint: CheckpointPolicy::Never,
            ..ExecutorConfig::default()
        });
        assert!(!never.checkpoint_due(10));
    }

    #[tokio::test]
    async fn sequential_chain_runs_in_order() {
        let exec = Executor::new(chain());
        let result = exec.execute(CancellationToken::new(), StateMap::new()).await.unwrap();

        assert_eq!(result.context.completed_nodes, vec!["start", "middle", "end"]);
        assert_eq!(result.state.get_as::<i64>("c").unwrap(), Some(3));
        assert_eq!(result.context.last_completed_node(), Some("end"));
    }

    #[tokio::test]
    async fn events_follow_execution() {
        let exec = Executor::new(chain());
        let mut rx = exec.events().subscribe();
        exec.execute(CancellationToken::new(), StateMap::new()).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(EngineEvent::ExecutionStarted { resumed: false, .. })));
        assert!(matches!(seen.last(), Some(EngineEvent::ExecutionCompleted { .. })));
        let completed = seen
            .iter()
            .filter(|e| matches!(e, EngineEvent::NodeCompleted { .. }))
            .count();
        assert_eq!(completed, 3);
    }

    #[tokio::test]
    async fn checkpoints_every_batch_plus_final() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let exec = Executor::new(chain()).with_checkpoint_store(store.clone());
        exec.execute(CancellationToken::new(), StateMap::new()).await.unwrap();

        let saved = store.list("chain").await.unwrap();
        assert_eq!(saved.len(), 4);
        let sequences: Vec<u64> = saved.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert!(saved[..3].iter().all(|c| c.recoverable));
        assert!(!saved[3].recoverable);
        assert_eq!(saved[0].last_completed_node.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn never_policy_writes_nothing() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let exec = Executor::new(chain())
            .with_checkpoint_store(store.clone())
            .with_config(ExecutorConfig {
                checkpoint: CheckpointPolicy::Never,
                ..ExecutorConfig::default()
            });
        exec.execute(CancellationToken::new(), StateMap::new()).await.unwrap();
        assert!(store.list("chain").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resume_without_store_fails() {
        let exec = Executor::new(chain());
        let err = exec.resume_latest(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ConductorError::ResumeFailed {
                source: CheckpointError::StoreUnavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn resume_rejects_final_checkpoint() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let exec = Executor::new(chain()).with_checkpoint_store(store.clone());
        exec.execute(CancellationToken::new(), StateMap::new()).await.unwrap();

        let err = exec.resume_latest(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ConductorError::ResumeFailed {
                source: CheckpointError::NotRecoverable { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn resume_rejects_unknown_nodes() {
        let exec = Executor::new(chain()).with_checkpoint_store(Arc::new(MemoryCheckpointStore::new()));
        let mut cx = ExecutionContext::new("chain");
        cx.mark_completed("start");
        cx.mark_completed("ghost");
        let checkpoint = Checkpoint::capture(&cx, &StateMap::new(), true).unwrap();

        let err = exec
            .resume_from(CancellationToken::new(), checkpoint)
            .await
            .unwrap_err();
        match err {
            ConductorError::ResumeFailed {
                source: CheckpointError::UnknownNode { node, .. },
                ..
            } => assert_eq!(node, "ghost"),
            other => panic!("expected UnknownNode, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_error_from_node_is_not_wrapped() {
        let mut g = GraphBuilder::<StateMap>::new("g");
        g.add_node(Node::pass_through("start")).unwrap();
        g.add_node(
            Node::from_fn("end", |cx: NodeContext, _state: StateMap| async move {
                Err::<StateMap, _>(ConductorError::Cancelled { graph: cx.graph_id })
            })
            .depends_on(["start"]),
        )
        .unwrap();
        let exec = Executor::new(g.build().unwrap());

        let err = exec.execute(CancellationToken::new(), StateMap::new()).await.unwrap_err();
        assert!(matches!(err, ConductorError::Cancelled { .. }));
        assert!(err.failed_node().is_none());
    }
}
