//! Node abstraction: identity, dependencies, and the async action a node runs.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use conductor_types::{ConductorError, GraphState, Result};

// ---------------------------------------------------------------------------
// NodeContext
// ---------------------------------------------------------------------------

/// Run-scoped metadata handed to a node action.
///
/// The cancellation token is a child of the run's token. It fires when the
/// caller cancels, when the deadline passes, or when a sibling in the same
/// parallel batch fails. Long-running actions should poll it.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub graph_id: String,
    pub execution_id: String,
    pub node_id: String,
    cancel: CancellationToken,
}

impl NodeContext {
    pub fn new(
        graph_id: impl Into<String>,
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            graph_id: graph_id.into(),
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            cancel,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once the token has fired.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ConductorError::Cancelled {
                graph: self.graph_id.clone(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NodeAction trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NodeAction<S>: Send + Sync {
    /// Consume the incoming state and produce the next one.
    async fn execute(&self, cx: NodeContext, state: S) -> Result<S>;
}

/// Adapts an async closure into a [`NodeAction`].
pub struct FnAction<F>(F);

#[async_trait]
impl<S, F, Fut> NodeAction<S> for FnAction<F>
where
    S: Send + 'static,
    F: Fn(NodeContext, S) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S>> + Send + 'static,
{
    async fn execute(&self, cx: NodeContext, state: S) -> Result<S> {
        (self.0)(cx, state).await
    }
}

struct PassThrough;

#[async_trait]
impl<S: Send + 'static> NodeAction<S> for PassThrough {
    async fn execute(&self, _cx: NodeContext, state: S) -> Result<S> {
        Ok(state)
    }
}

/// Run an action, turning a panic inside it into an ordinary error so one
/// misbehaving node cannot take down the executor.
pub(crate) async fn invoke<S: GraphState>(
    action: Arc<dyn NodeAction<S>>,
    cx: NodeContext,
    state: S,
) -> Result<S> {
    match AssertUnwindSafe(action.execute(cx, state)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ConductorError::Other(format!("node panicked: {message}")))
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub type Condition<S> = Arc<dyn Fn(&S) -> bool + Send + Sync>;

/// A named unit of work with declared dependencies.
pub struct Node<S> {
    pub(crate) id: String,
    pub(crate) dependencies: Vec<String>,
    pub(crate) description: String,
    pub(crate) parallel_safe: bool,
    pub(crate) condition: Option<Condition<S>>,
    pub(crate) action: Arc<dyn NodeAction<S>>,
}

impl<S: GraphState> Node<S> {
    pub fn new(id: impl Into<String>, action: impl NodeAction<S> + 'static) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            description: String::new(),
            parallel_safe: false,
            condition: None,
            action: Arc::new(action),
        }
    }

    /// Build a node from an async closure.
    pub fn from_fn<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(NodeContext, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
    {
        Self::new(id, FnAction(f))
    }

    /// A node that hands its input state through untouched. Useful for
    /// start/end markers.
    pub fn pass_through(id: impl Into<String>) -> Self {
        Self::new(id, PassThrough)
    }

    /// Add dependencies. Duplicates are ignored; declaration order is kept.
    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Opt in to running concurrently with batch siblings.
    pub fn parallel(mut self) -> Self {
        self.parallel_safe = true;
        self
    }

    /// Only run when `predicate` holds for the incoming state; otherwise the
    /// state passes through unchanged and the node is recorded as skipped.
    pub fn when(mut self, predicate: impl Fn(&S) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(predicate));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_parallel_safe(&self) -> bool {
        self.parallel_safe
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    /// Evaluate the node's predicate, if any, against `state`.
    pub fn should_run(&self, state: &S) -> bool {
        self.condition.as_ref().map_or(true, |predicate| predicate(state))
    }

    pub(crate) fn action(&self) -> Arc<dyn NodeAction<S>> {
        Arc::clone(&self.action)
    }
}

impl<S> fmt::Debug for Node<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("description", &self.description)
            .field("parallel_safe", &self.parallel_safe)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
