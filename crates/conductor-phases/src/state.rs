//! Typed state threaded through the orchestrator pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_types::{GraphState, StateError, StateMap};

/// The feature specification being worked on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecDocument {
    pub source: PathBuf,
    /// Empty until the load phase has run.
    #[serde(default)]
    pub text: String,
}

/// A passage of the specification that needs a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambiguity {
    /// 1-based line number in the specification.
    pub line: usize,
    pub marker: String,
    pub text: String,
}

/// One unit of planned work, derived from a heading of the specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub level: usize,
    /// 1-based line of the heading; 0 for the whole-document fallback task.
    #[serde(default)]
    pub line: usize,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
}

/// Outcome of one validation command (lint, test, build).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub name: String,
    pub command: String,
    pub status: CheckStatus,
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Tail of the combined stdout/stderr.
    pub output: String,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub tasks: usize,
    pub artifacts: usize,
    pub ambiguities: usize,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub path: PathBuf,
}

impl Report {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Everything the pipeline knows about one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub spec: SpecDocument,
    #[serde(default)]
    pub ambiguities: Vec<Ambiguity>,
    #[serde(default)]
    pub plan: Vec<Task>,
    /// Generated files, keyed by path relative to the output directory.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub checks: BTreeMap<String, CheckReport>,
    #[serde(default)]
    pub report: Option<Report>,
    /// Free-form values phases want to pass along.
    #[serde(default)]
    pub metadata: StateMap,
}

impl PipelineState {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            spec: SpecDocument {
                source: source.into(),
                text: String::new(),
            },
            ..Self::default()
        }
    }

    pub fn failed_checks(&self) -> Vec<&str> {
        self.checks
            .values()
            .filter(|c| !c.passed())
            .map(|c| c.name.as_str())
            .collect()
    }
}

impl GraphState for PipelineState {
    /// Whole fields are taken from the branch when it changed them; the keyed
    /// collections merge per key so sibling checks never overwrite each other.
    fn merge_branch(&mut self, base: &Self, branch: Self) -> Result<(), StateError> {
        if branch.spec != base.spec {
            self.spec = branch.spec;
        }
        if branch.ambiguities != base.ambiguities {
            self.ambiguities = branch.ambiguities;
        }
        if branch.plan != base.plan {
            self.plan = branch.plan;
        }
        merge_keyed(&mut self.artifacts, &base.artifacts, branch.artifacts);
        merge_keyed(&mut self.checks, &base.checks, branch.checks);
        if branch.report != base.report {
            self.report = branch.report;
        }
        self.metadata.merge_branch(&base.metadata, branch.metadata)
    }
}

fn merge_keyed<V: PartialEq>(
    target: &mut BTreeMap<String, V>,
    base: &BTreeMap<String, V>,
    branch: BTreeMap<String, V>,
) {
    for key in base.keys() {
        if !branch.contains_key(key) {
            target.remove(key);
        }
    }
    for (key, value) in branch {
        if base.get(&key) != Some(&value) {
            target.insert(key, value);
        }
    }
}
