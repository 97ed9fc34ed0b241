//! Checkpoint capture/restore and the stores that persist them.
//!
//! The executor snapshots the state and execution context after batches (per
//! its [`CheckpointPolicy`](crate::executor::CheckpointPolicy)). On restart a
//! run can be resumed from the newest checkpoint of its graph instead of
//! starting over.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use conductor_types::{CheckpointError, GraphState, StateError};

use crate::context::ExecutionContext;

type StoreResult<T> = std::result::Result<T, CheckpointError>;

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Durable snapshot of an execution between batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub graph_id: String,
    pub execution_id: String,
    /// Monotonic within an execution; breaks ties between equal timestamps.
    pub sequence: u64,
    pub last_completed_node: Option<String>,
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub skipped_nodes: Vec<String>,
    /// The workflow state encoded as JSON.
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// False for the terminal checkpoint written after a successful run.
    pub recoverable: bool,
}

impl Checkpoint {
    /// Snapshot `state` together with the execution bookkeeping in `cx`.
    pub fn capture<S: GraphState>(
        cx: &ExecutionContext,
        state: &S,
        recoverable: bool,
    ) -> std::result::Result<Self, StateError> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            graph_id: cx.graph_id.clone(),
            execution_id: cx.execution_id.clone(),
            sequence: cx.checkpoint_sequence,
            last_completed_node: cx.last_completed_node().map(str::to_string),
            completed_nodes: cx.completed_nodes.clone(),
            skipped_nodes: cx.skipped_nodes.clone(),
            state: serde_json::to_value(state)?,
            created_at: Utc::now(),
            recoverable,
        })
    }

    /// Decode the stored state.
    pub fn restore<S: DeserializeOwned>(&self) -> std::result::Result<S, StateError> {
        Ok(serde_json::from_value(self.state.clone())?)
    }

    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }
}

fn sort_oldest_first(checkpoints: &mut [Checkpoint]) {
    checkpoints.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
}

// ---------------------------------------------------------------------------
// CheckpointStore trait
// ---------------------------------------------------------------------------

/// Persistence for checkpoints. Implementations must tolerate concurrent use
/// from several executions.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> StoreResult<()>;

    /// All checkpoints of a graph, oldest first. Empty when there are none.
    async fn list(&self, graph_id: &str) -> StoreResult<Vec<Checkpoint>>;

    async fn get(&self, checkpoint_id: &str) -> StoreResult<Checkpoint>;

    async fn delete(&self, checkpoint_id: &str) -> StoreResult<()>;

    /// Remove every checkpoint of a graph and return how many were removed.
    async fn delete_all(&self, graph_id: &str) -> StoreResult<usize>;

    /// The newest checkpoint of a graph.
    async fn load(&self, graph_id: &str) -> StoreResult<Checkpoint> {
        self.list(graph_id)
            .await?
            .pop()
            .ok_or_else(|| CheckpointError::NotFound {
                graph: graph_id.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// In-process store, mainly for tests and short-lived runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    graphs: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let mut graphs = self.graphs.write().await;
        let entries = graphs.entry(checkpoint.graph_id.clone()).or_default();
        entries.retain(|c| c.id != checkpoint.id);
        entries.push(checkpoint.clone());
        sort_oldest_first(entries);
        Ok(())
    }

    async fn list(&self, graph_id: &str) -> StoreResult<Vec<Checkpoint>> {
        let graphs = self.graphs.read().await;
        Ok(graphs.get(graph_id).cloned().unwrap_or_default())
    }

    async fn get(&self, checkpoint_id: &str) -> StoreResult<Checkpoint> {
        let graphs = self.graphs.read().await;
        graphs
            .values()
            .flatten()
            .find(|c| c.id == checkpoint_id)
            .cloned()
            .ok_or_else(|| CheckpointError::UnknownCheckpoint {
                id: checkpoint_id.to_string(),
            })
    }

    async fn delete(&self, checkpoint_id: &str) -> StoreResult<()> {
        let mut graphs = self.graphs.write().await;
        for entries in graphs.values_mut() {
            if let Some(pos) = entries.iter().position(|c| c.id == checkpoint_id) {
                entries.remove(pos);
                return Ok(());
            }
        }
        Err(CheckpointError::UnknownCheckpoint {
            id: checkpoint_id.to_string(),
        })
    }

    async fn delete_all(&self, graph_id: &str) -> StoreResult<usize> {
        let mut graphs = self.graphs.write().await;
        Ok(graphs.remove(graph_id).map_or(0, |entries| entries.len()))
    }
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

/// Stores each checkpoint as `<root>/<graph_id>/<checkpoint_id>.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn graph_dir(&self, graph_id: &str) -> StoreResult<PathBuf> {
        if !is_safe_segment(graph_id) {
            return Err(CheckpointError::InvalidGraphId(graph_id.to_string()));
        }
        Ok(self.root.join(graph_id))
    }

    /// Locate a checkpoint file by id across all graph directories.
    async fn find(&self, checkpoint_id: &str) -> StoreResult<Option<PathBuf>> {
        if !is_safe_segment(checkpoint_id) {
            return Ok(None);
        }
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file_name = format!("{checkpoint_id}.json");
        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let candidate = entry.path().join(&file_name);
            if tokio::fs::try_exists(&candidate).await? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

/// A path segment that cannot escape the store root.
fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.starts_with('.')
        && !segment.contains(['/', '\\', '\0'])
}

async fn read_checkpoint(path: &Path) -> StoreResult<Checkpoint> {
    let json = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&json)?)
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let dir = self.graph_dir(&checkpoint.graph_id)?;
        if !is_safe_segment(&checkpoint.id) {
            return Err(CheckpointError::InvalidCheckpointId(checkpoint.id.clone()));
        }
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}.json", checkpoint.id));
        let tmp = dir.join(format!(".{}.json.tmp", checkpoint.id));
        let json = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(path = %path.display(), sequence = checkpoint.sequence, "Checkpoint saved");
        Ok(())
    }

    async fn list(&self, graph_id: &str) -> StoreResult<Vec<Checkpoint>> {
        let dir = self.graph_dir(graph_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_json = path.extension().is_some_and(|ext| ext == "json");
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !is_json || hidden {
                continue;
            }
            checkpoints.push(read_checkpoint(&path).await?);
        }
        sort_oldest_first(&mut checkpoints);
        Ok(checkpoints)
    }

    async fn get(&self, checkpoint_id: &str) -> StoreResult<Checkpoint> {
        match self.find(checkpoint_id).await? {
            Some(path) => read_checkpoint(&path).await,
            None => Err(CheckpointError::UnknownCheckpoint {
                id: checkpoint_id.to_string(),
            }),
        }
    }

    async fn delete(&self, checkpoint_id: &str) -> StoreResult<()> {
        match self.find(checkpoint_id).await? {
            Some(path) => {
                tokio::fs::remove_file(&path).await?;
                tracing::debug!(path = %path.display(), "Checkpoint deleted");
                Ok(())
            }
            None => Err(CheckpointError::UnknownCheckpoint {
                id: checkpoint_id.to_string(),
            }),
        }
    }

    async fn delete_all(&self, graph_id: &str) -> StoreResult<usize> {
        let count = self.list(graph_id).await?.len();
        let dir = self.graph_dir(graph_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
