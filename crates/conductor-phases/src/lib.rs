//! The conductor pipeline: `load -> {analyze, plan} -> generate -> {lint, test, build} -> report`.

pub mod command;
pub mod config;
pub mod phases;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use conductor_engine::{
    BackoffPolicy, Executor, FileCheckpointStore, Graph, GraphBuilder, Node, RetryPolicy,
};
use conductor_types::{ConductorError, Result};

pub use command::{CommandOutcome, CommandOutput, CommandRunner};
pub use config::{CheckCommands, OrchestratorConfig};
pub use phases::{
    Analyze, Generate, LoadSpec, Plan, RunCheck, WriteReport, ANALYZE, GENERATE, LOAD, PLAN,
    REPORT, REPORT_FILE,
};
pub use state::{Ambiguity, CheckReport, CheckStatus, PipelineState, Report, SpecDocument, Task};

/// Graph id of the orchestrator pipeline; checkpoints are stored under it.
pub const PIPELINE_GRAPH: &str = "conductor";

/// Register every pipeline node without validating. Check nodes are always
/// present so the graph shape does not depend on which commands are set; an
/// unconfigured check is skipped at run time.
pub fn pipeline_builder(config: &OrchestratorConfig) -> Result<GraphBuilder<PipelineState>> {
    let runner = CommandRunner::new(&config.working_dir, config.command_timeout());
    let retry = RetryPolicy::new(config.check_retries, BackoffPolicy::Fixed(Duration::from_secs(1)));

    let mut nodes = vec![
        Node::new(LOAD, LoadSpec).describe("Read the feature specification"),
        Node::new(ANALYZE, Analyze::new()?)
            .depends_on([LOAD])
            .describe("Flag open questions in the specification")
            .parallel(),
        Node::new(PLAN, Plan::new()?)
            .depends_on([LOAD])
            .describe("Split the specification into tasks")
            .parallel(),
        Node::new(GENERATE, Generate::new(&config.output_dir))
            .depends_on([ANALYZE, PLAN])
            .describe("Write one artifact per task"),
    ];

    let mut check_names = Vec::new();
    for (name, command) in config.checks.entries() {
        let configured = command.is_some();
        let action = RunCheck::new(name, command.unwrap_or_default(), runner.clone());
        nodes.push(
            Node::new(name, action)
                .depends_on([GENERATE])
                .describe(format!("Run the {name} command"))
                .parallel()
                .when(move |state: &PipelineState| configured && !state.artifacts.is_empty())
                .retry(retry.clone()),
        );
        check_names.push(name.to_string());
    }

    nodes.push(
        Node::new(REPORT, WriteReport::new(&config.output_dir, check_names.clone()))
            .depends_on(check_names)
            .describe("Summarize checks into REPORT.md"),
    );

    let mut builder = GraphBuilder::new(PIPELINE_GRAPH);
    builder.set_start(LOAD).set_end(REPORT);
    for node in nodes {
        builder
            .add_node(node)
            .map_err(|source| ConductorError::Structural {
                graph: PIPELINE_GRAPH.to_string(),
                source,
            })?;
    }
    Ok(builder)
}

pub fn build_pipeline(config: &OrchestratorConfig) -> Result<Graph<PipelineState>> {
    pipeline_builder(config)?.build()
}

/// An executor for the pipeline, checkpointing to `config.checkpoint_dir`.
pub fn orchestrator(config: &OrchestratorConfig) -> Result<Executor<PipelineState>> {
    let graph = build_pipeline(config)?;
    Ok(Executor::new(graph)
        .with_config(config.executor.clone())
        .with_checkpoint_store(Arc::new(FileCheckpointStore::new(&config.checkpoint_dir))))
}
