use std::collections::HashMap;
use std::fmt;

use conductor_types::{ConductorError, GraphState, Result, StructuralError};

use crate::node::Node;
use crate::scheduler::{schedule, Batch};
use crate::validation::check_structure;

pub const DEFAULT_START: &str = "start";
pub const DEFAULT_END: &str = "end";

/// Mutable registry used to assemble a graph. [`build`](GraphBuilder::build)
/// validates it and freezes it into an immutable [`Graph`].
pub struct GraphBuilder<S> {
    name: String,
    start: String,
    end: String,
    nodes: Vec<Node<S>>,
    index: HashMap<String, usize>,
}

impl<S: GraphState> GraphBuilder<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: DEFAULT_START.to_string(),
            end: DEFAULT_END.to_string(),
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register a node. Fails if a node with the same id already exists.
    pub fn add_node(&mut self, node: Node<S>) -> std::result::Result<&mut Self, StructuralError> {
        if self.index.contains_key(node.id()) {
            return Err(StructuralError::DuplicateNode(node.id().to_string()));
        }
        self.index.insert(node.id().to_string(), self.nodes.len());
        self.nodes.push(node);
        Ok(self)
    }

    pub fn set_start(&mut self, id: impl Into<String>) -> &mut Self {
        self.start = id.into();
        self
    }

    pub fn set_end(&mut self, id: impl Into<String>) -> &mut Self {
        self.end = id.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_id(&self) -> &str {
        &self.start
    }

    pub fn end_id(&self) -> &str {
        &self.end
    }

    pub fn node(&self, id: &str) -> Option<&Node<S>> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> &[Node<S>] {
        &self.nodes
    }

    /// Structural checks: start/end present, no dangling dependency, no cycle.
    /// Has no side effects and may be called any number of times.
    pub fn validate(&self) -> std::result::Result<(), StructuralError> {
        check_structure(self)
    }

    /// Validate, compute the batch schedule, and freeze the graph.
    pub fn build(self) -> Result<Graph<S>> {
        self.validate().map_err(|source| ConductorError::Structural {
            graph: self.name.clone(),
            source,
        })?;
        let batches = schedule(&self.nodes)?;

        tracing::debug!(
            graph = %self.name,
            nodes = self.nodes.len(),
            batches = batches.len(),
            "Graph built"
        );

        Ok(Graph {
            name: self.name,
            start: self.start,
            end: self.end,
            nodes: self.nodes,
            index: self.index,
            batches,
        })
    }
}

impl<S> fmt::Debug for GraphBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("nodes", &self.nodes)
            .finish()
    }
}

/// A validated, immutable graph. Safe to share across concurrent executions.
pub struct Graph<S> {
    name: String,
    start: String,
    end: String,
    nodes: Vec<Node<S>>,
    index: HashMap<String, usize>,
    batches: Vec<Batch>,
}

impl<S> fmt::Debug for Graph<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("nodes", &self.nodes)
            .field("batches", &self.batches)
            .finish()
    }
}

impl<S: GraphState> Graph<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_id(&self) -> &str {
        &self.start
    }

    pub fn end_id(&self) -> &str {
        &self.end
    }

    pub fn node(&self, id: &str) -> Option<&Node<S>> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node<S>> {
        self.nodes.iter()
    }

    /// Topological batches, in execution order.
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
