//! The node actions that make up the orchestrator pipeline.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;

use conductor_engine::{NodeAction, NodeContext};
use conductor_types::{ConductorError, Result};

use crate::command::{CommandOutcome, CommandRunner};
use crate::state::{Ambiguity, CheckReport, CheckStatus, PipelineState, Report, Task};

pub const LOAD: &str = "load";
pub const ANALYZE: &str = "analyze";
pub const PLAN: &str = "plan";
pub const GENERATE: &str = "generate";
pub const REPORT: &str = "report";

pub const REPORT_FILE: &str = "REPORT.md";

/// Lines of command output kept in a [`CheckReport`].
const OUTPUT_TAIL_LINES: usize = 40;

/// Lines outside fenced code blocks, with 1-based line numbers.
fn prose_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut in_fence = false;
    text.lines().enumerate().filter_map(move |(i, line)| {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            return None;
        }
        (!in_fence).then_some((i + 1, line))
    })
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ConductorError::Other(format!("invalid pattern {pattern}: {e}")))
}

// ---------------------------------------------------------------------------
// load
// ---------------------------------------------------------------------------

/// Reads the specification named by `state.spec.source`.
pub struct LoadSpec;

#[async_trait]
impl NodeAction<PipelineState> for LoadSpec {
    async fn execute(&self, _cx: NodeContext, mut state: PipelineState) -> Result<PipelineState> {
        let path = state.spec.source.clone();
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ConductorError::Other(format!("cannot read specification {}: {e}", path.display()))
        })?;
        if text.trim().is_empty() {
            return Err(ConductorError::Other(format!(
                "specification {} is empty",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), bytes = text.len(), "Specification loaded");
        state.metadata.set("spec_lines", text.lines().count())?;
        state.spec.text = text;
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// analyze
// ---------------------------------------------------------------------------

/// Flags lines that carry an open-question marker.
pub struct Analyze {
    markers: Regex,
}

impl Analyze {
    pub fn new() -> Result<Self> {
        Ok(Self {
            markers: compile(r"(?i)(\?\?\?|\b(?:TBD|TBC|TODO|maybe|possibly|probably|unclear)\b)")?,
        })
    }

    pub fn scan(&self, text: &str) -> Vec<Ambiguity> {
        prose_lines(text)
            .filter_map(|(line, content)| {
                self.markers.find(content).map(|m| Ambiguity {
                    line,
                    marker: m.as_str().to_string(),
                    text: content.trim().to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl NodeAction<PipelineState> for Analyze {
    async fn execute(&self, _cx: NodeContext, mut state: PipelineState) -> Result<PipelineState> {
        let found = self.scan(&state.spec.text);
        if !found.is_empty() {
            tracing::warn!(count = found.len(), "Specification has open questions");
        }
        state.metadata.set("ambiguity_count", found.len())?;
        state.ambiguities = found;
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// plan
// ---------------------------------------------------------------------------

/// Breaks the specification into one task per markdown heading.
pub struct Plan {
    heading: Regex,
}

impl Plan {
    pub fn new() -> Result<Self> {
        Ok(Self {
            heading: compile(r"^(#{1,6})\s+(.+?)\s*#*\s*$")?,
        })
    }

    pub fn tasks(&self, source: &Path, text: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = Vec::new();
        let mut body: Vec<&str> = Vec::new();

        for (line, content) in prose_lines(text) {
            if let Some(caps) = self.heading.captures(content) {
                if let Some(task) = tasks.last_mut() {
                    task.body = body.join("\n").trim().to_string();
                }
                body.clear();
                let title = caps[2].to_string();
                let id = unique_id(&tasks, slugify(&title));
                tasks.push(Task {
                    id,
                    title,
                    level: caps[1].len(),
                    line,
                    body: String::new(),
                });
            } else {
                body.push(content);
            }
        }

        match tasks.last_mut() {
            Some(task) => task.body = body.join("\n").trim().to_string(),
            None => {
                let title = source
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "specification".to_string());
                tasks.push(Task {
                    id: "spec".to_string(),
                    title,
                    level: 1,
                    line: 0,
                    body: text.trim().to_string(),
                });
            }
        }
        tasks
    }
}

fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "section".to_string()
    } else {
        slug
    }
}

fn unique_id(tasks: &[Task], slug: String) -> String {
    if !tasks.iter().any(|t| t.id == slug) {
        return slug;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{slug}-{n}");
        if !tasks.iter().any(|t| t.id == candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[async_trait]
impl NodeAction<PipelineState> for Plan {
    async fn execute(&self, _cx: NodeContext, mut state: PipelineState) -> Result<PipelineState> {
        state.plan = self.tasks(&state.spec.source, &state.spec.text);
        tracing::info!(tasks = state.plan.len(), "Plan ready");
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// generate
// ---------------------------------------------------------------------------

/// Writes one markdown artifact per planned task.
pub struct Generate {
    output_dir: PathBuf,
}

impl Generate {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

/// Artifact body for `task`. `end` is the first line past the task's section.
fn render_task(task: &Task, end: usize, ambiguities: &[Ambiguity]) -> String {
    let mut out = format!("# {}\n\n", task.title);
    if !task.body.is_empty() {
        out.push_str(&task.body);
        out.push_str("\n\n");
    }

    let open: Vec<&Ambiguity> = ambiguities
        .iter()
        .filter(|a| a.line >= task.line && a.line < end)
        .collect();
    if !open.is_empty() {
        out.push_str("## Open questions\n\n");
        for a in open {
            let _ = writeln!(out, "- line {} (`{}`): {}", a.line, a.marker, a.text);
        }
    }
    out
}

#[async_trait]
impl NodeAction<PipelineState> for Generate {
    async fn execute(&self, cx: NodeContext, mut state: PipelineState) -> Result<PipelineState> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        for (i, task) in state.plan.iter().enumerate() {
            cx.check_cancelled()?;
            let end = state.plan.get(i + 1).map_or(usize::MAX, |next| next.line);
            let content = render_task(task, end, &state.ambiguities);
            let name = format!("{}.md", task.id);
            tokio::fs::write(self.output_dir.join(&name), &content).await?;
            tracing::debug!(artifact = %name, "Artifact written");
            state.artifacts.insert(name, content);
        }

        tracing::info!(
            artifacts = state.artifacts.len(),
            dir = %self.output_dir.display(),
            "Artifacts generated"
        );
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// lint / test / build
// ---------------------------------------------------------------------------

/// Runs one validation command and records its outcome. A non-zero exit is
/// recorded as a failed check, not raised; a timeout is raised so the node's
/// retry policy can take another attempt.
pub struct RunCheck {
    name: String,
    command: String,
    runner: CommandRunner,
}

impl RunCheck {
    pub fn new(name: impl Into<String>, command: impl Into<String>, runner: CommandRunner) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            runner,
        }
    }
}

#[async_trait]
impl NodeAction<PipelineState> for RunCheck {
    async fn execute(&self, cx: NodeContext, mut state: PipelineState) -> Result<PipelineState> {
        let outcome = self
            .runner
            .run(&self.command, cx.cancellation())
            .await
            .map_err(|e| {
                ConductorError::Other(format!("check '{}' could not start: {e}", self.name))
            })?;

        let output = match outcome {
            CommandOutcome::Exited(output) => output,
            CommandOutcome::TimedOut { .. } => {
                return Err(ConductorError::CommandTimeout {
                    command: self.command.clone(),
                    timeout_ms: self.runner.timeout().as_millis() as u64,
                });
            }
            CommandOutcome::Cancelled => {
                return Err(ConductorError::Cancelled { graph: cx.graph_id });
            }
        };

        let status = if output.success() {
            CheckStatus::Passed
        } else {
            CheckStatus::Failed
        };
        tracing::info!(
            check = %self.name,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            passed = output.success(),
            "Check finished"
        );

        state.checks.insert(
            self.name.clone(),
            CheckReport {
                name: self.name.clone(),
                command: self.command.clone(),
                status,
                exit_code: output.exit_code,
                duration_ms: output.duration_ms,
                output: output.tail(OUTPUT_TAIL_LINES),
            },
        );
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// report
// ---------------------------------------------------------------------------

/// Summarizes the run into `REPORT.md` and fails if any check failed.
pub struct WriteReport {
    output_dir: PathBuf,
    checks: Vec<String>,
}

impl WriteReport {
    /// `checks` are the names of every registered check, in display order.
    pub fn new(output_dir: impl Into<PathBuf>, checks: Vec<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            checks,
        }
    }

    fn render(&self, state: &PipelineState, report: &Report) -> String {
        let mut out = String::from("# Conductor report\n\n");
        let _ = writeln!(out, "- Specification: {}", state.spec.source.display());
        let _ = writeln!(out, "- Generated: {}", report.generated_at.to_rfc3339());
        let _ = writeln!(out, "- Tasks: {}", report.tasks);
        let _ = writeln!(out, "- Artifacts: {}", report.artifacts);
        let _ = writeln!(out, "- Open questions: {}", report.ambiguities);

        out.push_str("\n## Checks\n\n| Check | Result | Exit code | Duration |\n|---|---|---|---|\n");
        for name in &self.checks {
            match state.checks.get(name) {
                Some(check) => {
                    let result = if check.passed() { "passed" } else { "FAILED" };
                    let _ = writeln!(
                        out,
                        "| {} | {} | {} | {}ms |",
                        name, result, check.exit_code, check.duration_ms
                    );
                }
                None => {
                    let _ = writeln!(out, "| {name} | skipped | - | - |");
                }
            }
        }

        for check in state.checks.values().filter(|c| !c.passed()) {
            let _ = write!(
                out,
                "\n### {} output\n\n```\n{}\n```\n",
                check.name, check.output
            );
        }

        if !state.ambiguities.is_empty() {
            out.push_str("\n## Open questions\n\n");
            for a in &state.ambiguities {
                let _ = writeln!(out, "- line {} (`{}`): {}", a.line, a.marker, a.text);
            }
        }
        out
    }
}

#[async_trait]
impl NodeAction<PipelineState> for WriteReport {
    async fn execute(&self, _cx: NodeContext, mut state: PipelineState) -> Result<PipelineState> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(REPORT_FILE);

        let (passed, failed): (Vec<&CheckReport>, Vec<&CheckReport>) =
            state.checks.values().partition(|c| c.passed());
        let report = Report {
            generated_at: Utc::now(),
            tasks: state.plan.len(),
            artifacts: state.artifacts.len(),
            ambiguities: state.ambiguities.len(),
            passed: passed.iter().map(|c| c.name.clone()).collect(),
            failed: failed.iter().map(|c| c.name.clone()).collect(),
            path: path.clone(),
        };

        tokio::fs::write(&path, self.render(&state, &report)).await?;
        tracing::info!(path = %path.display(), failed = report.failed.len(), "Report written");

        if !report.succeeded() {
            return Err(ConductorError::Other(format!(
                "checks failed: {} (see {})",
                report.failed.join(", "),
                path.display()
            )));
        }
        state.report = Some(report);
        Ok(state)
    }
}
