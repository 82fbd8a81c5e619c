use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agentflow_core::config::AppConfig;
use agentflow_core::types::{CacheSelector, Fingerprint, Outputs, RunEventKind, RunState};
use agentflow_core::workflow::WorkflowDefinition;

use agentflow_engine::{
    load_workflow, validate, CapabilityRegistry, CommandProvider, CoordinatorBuilder,
    RunCoordinator, RunLogger, RunStatus, WorkflowGraph,
};
use agentflow_store::{SqliteCache, SqliteRunStore};

#[derive(Parser)]
#[command(name = "agentflow", version, about = "Run workflows of agent tasks as a DAG")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file without running it
    Validate {
        /// Workflow file (.toml, .json, or a designer diagram)
        workflow: PathBuf,
    },
    /// Run a workflow and stream its events
    Run {
        /// Workflow file (.toml, .json, or a designer diagram)
        workflow: PathBuf,
        /// Run input (KEY=VALUE, VALUE parsed as JSON when possible)
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(String, serde_json::Value)>,
        /// Only print the final report
        #[arg(short, long)]
        quiet: bool,
    },
    /// Manage the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove cache entries
    Invalidate {
        /// Remove every entry
        #[arg(long, conflicts_with_all = ["workflow", "node", "key"])]
        all: bool,
        /// Entries written by this workflow
        #[arg(long)]
        workflow: Option<String>,
        /// Only this version of --workflow
        #[arg(long, requires = "workflow")]
        version: Option<u32>,
        /// Entries written by this node id
        #[arg(long, conflicts_with = "key")]
        node: Option<String>,
        /// A single fingerprint
        #[arg(long)]
        key: Option<String>,
    },
    /// Show cache occupancy
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agentflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "agentflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file found, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Validate { workflow } => validate_cmd(&workflow),
        Commands::Run {
            workflow,
            inputs,
            quiet,
        } => run_cmd(config, &workflow, inputs.into_iter().collect(), quiet).await,
        Commands::Cache { action } => cache_cmd(config, action).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

fn parse_input(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn load_checked(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let definition = load_workflow(path)?;
    let result = validate(&definition);
    if !result.is_valid() {
        eprintln!(
            "Workflow {} is invalid ({} violation(s)):",
            definition.id,
            result.violations.len()
        );
        for violation in &result.violations {
            eprintln!("  - {}", violation);
        }
        anyhow::bail!("validation failed");
    }
    Ok(definition)
}

fn validate_cmd(path: &Path) -> anyhow::Result<()> {
    let definition = load_checked(path)?;
    let nodes = definition.nodes.len();
    let edges = definition.edges.len();
    let graph = WorkflowGraph::build(Arc::new(definition))?;
    let order: Vec<&str> = graph
        .topological_order()
        .into_iter()
        .map(|idx| graph.node(idx).id.as_str())
        .collect();

    println!(
        "Workflow {} v{} is valid: {} nodes, {} edges, {} branch(es)",
        graph.definition().id,
        graph.definition().version,
        nodes,
        edges,
        graph.roots().len()
    );
    println!("Execution order: {}", order.join(" -> "));
    Ok(())
}

fn build_coordinator(config: &AppConfig) -> anyhow::Result<RunCoordinator> {
    let mut registry = CapabilityRegistry::with_builtins();
    for provider in &config.providers.command {
        info!(
            name = %provider.name,
            capability = %provider.capability,
            "Registered command provider"
        );
        registry.register(CommandProvider::from_config(provider));
    }

    let mut builder = CoordinatorBuilder::new(config.clone(), registry);
    if let Some(store) = &config.store {
        let path = store.resolved_path();
        builder = builder
            .with_cache(Arc::new(SqliteCache::open(&path, &config.cache)?))
            .with_run_store(Arc::new(SqliteRunStore::open(&path)?));
    }
    Ok(builder.build())
}

async fn run_cmd(
    config: AppConfig,
    path: &Path,
    inputs: Outputs,
    quiet: bool,
) -> anyhow::Result<()> {
    let definition = load_checked(path)?;
    let coordinator = Arc::new(build_coordinator(&config)?);

    // Subscribe before submitting so RunCreated is not missed.
    let logger = config
        .run_log
        .as_ref()
        .filter(|l| l.enabled)
        .map(|l| RunLogger::new(l.resolved_dir(), l.level, coordinator.event_bus()));

    let run_id = coordinator
        .submit_definition(definition, inputs, std::env::var("USER").ok())
        .await?;
    info!(run_id = %run_id, "Run submitted");

    let shutdown = CancellationToken::new();
    let logger_handle = logger.map(|l| tokio::spawn(l.only(run_id.clone()).run(shutdown.clone())));

    let ctrl_c = {
        let coordinator = Arc::clone(&coordinator);
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(run_id = %run_id, "Interrupted, cancelling run");
                coordinator.cancel_run(&run_id).await.ok();
            }
        })
    };

    let mut events = coordinator.stream_run_events(&run_id, 0).await?;
    while let Some(event) = events.next().await {
        if !quiet {
            println!("[{:>3}] {}", event.sequence, describe(&event.kind));
        }
    }
    ctrl_c.abort();

    let status = coordinator.wait(&run_id).await?;
    if let Some(handle) = logger_handle {
        handle.await.ok();
    }
    shutdown.cancel();

    print_report(&status, quiet);
    match status.state {
        RunState::Succeeded | RunState::PartiallySucceeded => Ok(()),
        state => anyhow::bail!("run {} finished {}", run_id, state),
    }
}

fn describe(kind: &RunEventKind) -> String {
    match kind {
        RunEventKind::RunCreated {
            workflow_id,
            version,
        } => format!("run created ({} v{})", workflow_id, version),
        RunEventKind::RunStarted => "run started".to_string(),
        RunEventKind::NodeStarted { node_id, attempt } => {
            format!("{}: started (attempt {})", node_id, attempt)
        }
        RunEventKind::NodeRetried {
            node_id,
            attempt,
            delay_ms,
            error,
        } => format!(
            "{}: retrying in {}ms as attempt {} ({})",
            node_id, delay_ms, attempt, error
        ),
        RunEventKind::NodeSucceeded {
            node_id,
            attempts,
            elapsed_ms,
        } => format!(
            "{}: succeeded after {} attempt(s) in {}ms",
            node_id, attempts, elapsed_ms
        ),
        RunEventKind::NodeFailed {
            node_id,
            attempts,
            error,
        } => format!("{}: failed after {} attempt(s): {}", node_id, attempts, error),
        RunEventKind::NodeCached {
            node_id,
            fingerprint,
        } => format!("{}: cached ({})", node_id, truncate(fingerprint.as_str(), 12)),
        RunEventKind::NodeSkipped { node_id, reason } => {
            format!("{}: skipped ({})", node_id, reason)
        }
        RunEventKind::CancelRequested => "cancel requested".to_string(),
        RunEventKind::RunCompleted { state } => format!("run completed: {}", state),
    }
}

fn print_report(status: &RunStatus, quiet: bool) {
    if !quiet {
        println!();
        for node in &status.nodes {
            match &node.error {
                Some(error) => println!("  {:<20} {:<10} {}", node.node_id, node.status, error),
                None => println!("  {:<20} {}", node.node_id, node.status),
            }
        }
        if let Some(metrics) = &status.metrics {
            println!(
                "\n  invocations: {}, retries: {}, cache hits: {}, misses: {}",
                metrics.invocations, metrics.retries, metrics.cache_hits, metrics.cache_misses
            );
            if let Some(latency) = &metrics.latency {
                println!(
                    "  latency: p50 {}ms, p95 {}ms, max {}ms",
                    latency.p50_ms, latency.p95_ms, latency.max_ms
                );
            }
        }
        println!();
    }

    for (node_id, outputs) in &status.outputs {
        match outputs.get("message").and_then(|m| m.as_str()) {
            Some(message) => println!("{}", message),
            None => println!(
                "## {}\n\n{}",
                node_id,
                serde_json::to_string_pretty(outputs).unwrap_or_default()
            ),
        }
    }
}

async fn cache_cmd(config: AppConfig, action: CacheAction) -> anyhow::Result<()> {
    if config.store.is_none() {
        warn!("No [store] configured; the in-memory cache does not outlive a run");
    }
    let coordinator = build_coordinator(&config)?;

    match action {
        CacheAction::Invalidate {
            all,
            workflow,
            version,
            node,
            key,
        } => {
            let selector = if all {
                CacheSelector::All
            } else if let Some(key) = key {
                CacheSelector::Key(Fingerprint(key))
            } else if let Some(node_id) = node {
                CacheSelector::Node {
                    node_id,
                    workflow_id: workflow,
                }
            } else if let Some(workflow_id) = workflow {
                CacheSelector::Workflow {
                    workflow_id,
                    version,
                }
            } else {
                anyhow::bail!("choose one of --all, --workflow, --node or --key");
            };
            let removed = coordinator.invalidate_cache(selector).await?;
            println!("Removed {} cache entr{}", removed, if removed == 1 { "y" } else { "ies" });
        }
        CacheAction::Stats => {
            let stats = coordinator.cache_stats().await?;
            println!(
                "entries: {}\nbytes: {}\nevictions: {}",
                stats.entries, stats.bytes, stats.evictions
            );
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(
            parse_input("topic=rust").unwrap(),
            ("topic".to_string(), serde_json::json!("rust"))
        );
        assert_eq!(
            parse_input("pages=3").unwrap(),
            ("pages".to_string(), serde_json::json!(3))
        );
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=x").is_err());
    }

    #[test]
    fn test_describe_events() {
        let line = describe(&RunEventKind::NodeRetried {
            node_id: "a".into(),
            attempt: 2,
            delay_ms: 100,
            error: "boom".into(),
        });
        assert_eq!(line, "a: retrying in 100ms as attempt 2 (boom)");
        assert_eq!(
            describe(&RunEventKind::RunCompleted {
                state: RunState::Succeeded
            }),
            "run completed: succeeded"
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
    }
}
