//! CLI binary for running the conductor pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use conductor_engine::{
    lint, CancellationToken, CheckpointStore, EngineEvent, EventEmitter, Executor,
    FileCheckpointStore, Severity,
};
use conductor_phases::{
    orchestrator, pipeline_builder, OrchestratorConfig, PipelineState, PIPELINE_GRAPH,
};
use conductor_types::ConductorError;

/// Config file picked up from the current directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "conductor.json";

#[derive(Parser)]
#[command(name = "conductor", version, about = "Drive a feature specification through analyze, plan, generate, and validate")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to a JSON config file (default: ./conductor.json if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Checkpoint directory
    #[arg(long)]
    checkpoints: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline on a feature specification
    Run {
        /// Path to the specification markdown file
        spec: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,

        /// Output directory for artifacts and the report
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum number of nodes running at once in a parallel batch
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Overall deadline for the run, in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Lint command to run against the generated output
        #[arg(long)]
        lint: Option<String>,

        /// Test command to run against the generated output
        #[arg(long)]
        test: Option<String>,

        /// Build command to run against the generated output
        #[arg(long)]
        build: Option<String>,
    },

    /// Resume an interrupted run from a checkpoint
    Resume {
        /// Checkpoint id (default: the newest checkpoint)
        checkpoint: Option<String>,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Show the pipeline's batches and lint diagnostics
    Graph {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the effective configuration as JSON
    Config {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Inspect or remove stored checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoints, oldest first
    List,
    /// Delete one checkpoint
    Delete { id: String },
    /// Delete every checkpoint of the pipeline
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Run {
            spec,
            config,
            output,
            max_concurrency,
            timeout_secs,
            lint,
            test,
            build,
        } => {
            let mut resolved = load_config(&config)?;
            if let Some(dir) = output {
                resolved.output_dir = dir;
            }
            if let Some(n) = max_concurrency {
                resolved.executor.max_concurrency = n;
            }
            if let Some(secs) = timeout_secs {
                resolved.executor.timeout_ms = Some(secs.saturating_mul(1000));
            }
            resolved.checks.lint = lint.or(resolved.checks.lint);
            resolved.checks.test = test.or(resolved.checks.test);
            resolved.checks.build = build.or(resolved.checks.build);
            cmd_run(&spec, &resolved).await?;
        }
        Commands::Resume { checkpoint, config } => {
            cmd_resume(checkpoint.as_deref(), &load_config(&config)?).await?;
        }
        Commands::Graph { config } => {
            cmd_graph(&load_config(&config)?)?;
        }
        Commands::Config { config } => {
            println!("{}", serde_json::to_string_pretty(&load_config(&config)?)?);
        }
        Commands::Checkpoints { action, config } => {
            cmd_checkpoints(action, &load_config(&config)?).await?;
        }
    }

    Ok(())
}

fn load_config(args: &ConfigArgs) -> anyhow::Result<OrchestratorConfig> {
    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            OrchestratorConfig::load(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => OrchestratorConfig::default(),
    };
    if let Some(dir) = &args.checkpoints {
        config.checkpoint_dir = dir.clone();
    }
    Ok(config)
}

/// A token that fires on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, stopping after the current node...");
            trigger.cancel();
        }
    });
    token
}

/// Print node progress as it happens.
fn print_progress(events: &EventEmitter) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event {
                EngineEvent::BatchStarted { index, nodes, parallel } => {
                    let mode = if parallel { " (parallel)" } else { "" };
                    println!("Batch {}: {}{}", index, nodes.join(", "), mode);
                }
                EngineEvent::NodeCompleted { node, duration_ms } => {
                    println!("  [done] {} ({}ms)", node, duration_ms);
                }
                EngineEvent::NodeSkipped { node } => println!("  [skip] {}", node),
                EngineEvent::NodeFailed { node, error } => {
                    println!("  [fail] {}: {}", node, error);
                }
                EngineEvent::CheckpointFailed { error } => {
                    println!("  [warn] checkpoint not saved: {}", error);
                }
                _ => {}
            }
        }
    });
}

fn executor(config: &OrchestratorConfig) -> anyhow::Result<Executor<PipelineState>> {
    let executor = orchestrator(config)?;
    print_progress(executor.events());
    Ok(executor)
}

async fn cmd_run(spec: &Path, config: &OrchestratorConfig) -> anyhow::Result<()> {
    println!("Specification: {}", spec.display());
    println!("Output: {}", config.output_dir.display());

    let executor = executor(config)?;
    tracing::info!(spec = %spec.display(), output = %config.output_dir.display(), "Starting run");
    let outcome = executor
        .execute(interrupt_token(), PipelineState::new(spec))
        .await;
    finish(outcome)
}

async fn cmd_resume(checkpoint: Option<&str>, config: &OrchestratorConfig) -> anyhow::Result<()> {
    let executor = executor(config)?;
    tracing::info!(
        checkpoint = checkpoint.unwrap_or("latest"),
        store = %config.checkpoint_dir.display(),
        "Resuming run"
    );
    let cancel = interrupt_token();
    let outcome = match checkpoint {
        Some(id) => {
            println!("Resuming from checkpoint {}", id);
            executor.resume(cancel, id).await
        }
        None => {
            println!("Resuming from the newest checkpoint");
            executor.resume_latest(cancel).await
        }
    };
    finish(outcome)
}

fn finish(
    outcome: conductor_types::Result<conductor_engine::ExecutionResult<PipelineState>>,
) -> anyhow::Result<()> {
    match outcome {
        Ok(result) => {
            println!("\nPipeline completed");
            println!("Completed nodes: {:?}", result.context.completed_nodes);
            if !result.context.skipped_nodes.is_empty() {
                println!("Skipped nodes: {:?}", result.context.skipped_nodes);
            }
            if let Some(report) = &result.state.report {
                println!("Report: {}", report.path.display());
            }
            if !result.state.ambiguities.is_empty() {
                println!(
                    "Open questions: {} (see the report)",
                    result.state.ambiguities.len()
                );
            }
            Ok(())
        }
        Err(err) if err.is_cancellation() => {
            eprintln!("\n{}", err);
            eprintln!("Progress is checkpointed; continue with `conductor resume`.");
            std::process::exit(130);
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_graph(config: &OrchestratorConfig) -> anyhow::Result<()> {
    let builder = pipeline_builder(config)?;

    let mut has_error = false;
    for diag in lint(&builder) {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }
    if has_error {
        std::process::exit(1);
    }

    let graph = builder.build()?;
    println!("Graph: {}", graph.name());
    println!("Start: {}", graph.start_id());
    println!("End: {}", graph.end_id());
    for batch in graph.batches() {
        let mode = if batch.parallel { "parallel" } else { "sequential" };
        println!("\nBatch {} ({}):", batch.index, mode);
        for id in &batch.nodes {
            let node = graph
                .node(id)
                .ok_or_else(|| ConductorError::Internal(format!("batch lists unknown node '{id}'")))?;
            let condition = if node.is_conditional() { " [conditional]" } else { "" };
            println!("  {}{} - {}", id, condition, node.description());
        }
    }
    Ok(())
}

async fn cmd_checkpoints(action: CheckpointAction, config: &OrchestratorConfig) -> anyhow::Result<()> {
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));

    match action {
        CheckpointAction::List => {
            let checkpoints = store.list(PIPELINE_GRAPH).await?;
            if checkpoints.is_empty() {
                println!("No checkpoints in {}", config.checkpoint_dir.display());
                return Ok(());
            }
            for cp in checkpoints {
                let last = cp.last_completed_node.as_deref().unwrap_or("-");
                let kind = if cp.recoverable { "" } else { " (final)" };
                println!(
                    "{}  #{}  {}  after {}{}",
                    cp.id,
                    cp.sequence,
                    cp.created_at.format("%Y-%m-%d %H:%M:%S"),
                    last,
                    kind
                );
            }
        }
        CheckpointAction::Delete { id } => {
            store.delete(&id).await?;
            println!("Deleted checkpoint {}", id);
        }
        CheckpointAction::Clear => {
            let removed = store.delete_all(PIPELINE_GRAPH).await?;
            println!("Deleted {} checkpoint(s)", removed);
        }
    }
    Ok(())
}
