mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowgate_core::config::{AppConfig, StoreBackend};
use flowgate_core::credentials::StaticCredentials;
use flowgate_core::event::EventBus;
use flowgate_core::traits::{KvStore, QueueStore};
use flowgate_core::types::{QueuedRun, RunEvent, RunStatus, WorkflowGraph};
use flowgate_nodes::NodeRegistry;
use flowgate_runtime::{
    enqueue, CircuitBreaker, GraphEngine, NodeDispatcher, QueueWorker, ResultCache, RunOptions,
    WorkerMonitor,
};
use flowgate_store::{MemoryStore, SqliteStore};

#[derive(Parser)]
#[command(name = "flowgate", version, about = "Workflow graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow graph and print the run report
    Run {
        /// Workflow graph JSON file
        workflow: PathBuf,
        /// Input payload for the entry nodes (JSON)
        #[arg(long)]
        input: Option<String>,
    },
    /// Check a workflow graph without running it
    Validate {
        /// Workflow graph JSON file
        workflow: PathBuf,
    },
    /// List registered node types
    Nodes,
    /// Queue a workflow for a worker
    Enqueue {
        /// Workflow graph JSON file
        workflow: PathBuf,
        /// Input payload for the entry nodes (JSON)
        #[arg(long)]
        input: Option<String>,
        /// Target queue (defaults to the first configured queue)
        #[arg(long)]
        queue: Option<String>,
    },
    /// Serve queued runs until interrupted
    Worker {
        /// Worker type announced in heartbeats
        #[arg(long)]
        worker_type: Option<String>,
    },
    /// Show worker and queue health
    Health,
    /// Inspect or reset circuit breakers
    Circuits {
        #[command(subcommand)]
        action: CircuitAction,
    },
    /// Inspect or flush the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show current configuration
    Config,
    /// Run system health checks
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum CircuitAction {
    /// List every known circuit
    List,
    /// Close the circuit for a node type
    Reset {
        /// Node type
        node_type: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache configuration and stored entries
    Stats,
    /// Delete cached results
    Flush {
        /// Only flush results of this node type
        #[arg(long)]
        node_type: Option<String>,
    },
}

/// Everything a command may need, built once from config.
struct Services {
    kv: Arc<dyn KvStore>,
    queues: Arc<dyn QueueStore>,
    circuit: Arc<CircuitBreaker>,
    cache: Arc<ResultCache>,
    engine: Arc<GraphEngine>,
    events: Arc<EventBus>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowgate=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowgate", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
        Commands::Doctor => {
            println!("Flowgate Doctor");
            println!("===============");
            doctor::run_doctor(&config);
        }
        Commands::Validate { workflow } => {
            let graph = load_workflow(&workflow)?;
            let services = build_services(&config)?;
            let report = services.engine.validate(&graph);
            for warning in &report.warnings {
                println!("  [warn] {}", warning);
            }
            for error in &report.errors {
                println!("  [error] {}", error);
            }
            if !report.is_valid() {
                anyhow::bail!("{} error(s) in {}", report.errors.len(), workflow.display());
            }
            println!("{} is valid ({} nodes)", workflow.display(), graph.nodes.len());
        }
        Commands::Nodes => {
            let registry = build_registry(&config);
            for (id, binding) in registry.list_all() {
                let meta = binding.metadata();
                let mut flags = Vec::new();
                if meta.cacheable_by_default {
                    flags.push("cacheable");
                }
                if meta.opens_iterations {
                    flags.push("opens iterations");
                }
                if meta.joins_iterations {
                    flags.push("joins iterations");
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", flags.join(", "))
                };
                println!("  {:<22} {}{}", id, meta.description, flags);
            }
        }
        Commands::Run { workflow, input } => {
            let graph = load_workflow(&workflow)?;
            let input = parse_input(input.as_deref())?;
            let services = build_services(&config)?;

            let mut rx = services.events.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    match event {
                        RunEvent::NodeFailed { node_id, error, .. } => {
                            eprintln!("  [failed] {}: {}", node_id, error)
                        }
                        RunEvent::NodeCompleted {
                            node_id,
                            cached,
                            elapsed_ms,
                            ..
                        } => {
                            let note = if cached { " (cached)" } else { "" };
                            eprintln!("  [ok] {} {}ms{}", node_id, elapsed_ms, note)
                        }
                        _ => {}
                    }
                }
            });

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Cancelling run...");
                cancel_clone.cancel();
            });

            let options = RunOptions {
                cancel,
                ..Default::default()
            };
            let report = services
                .engine
                .run_with(Arc::new(graph), input, options)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            let cache = services.cache.stats();
            if cache.enabled && cache.total_requests > 0 {
                eprintln!(
                    "  cache: {} hits, {} misses ({:.2}% hit rate)",
                    cache.hits, cache.misses, cache.hit_rate
                );
            }
            if report.status == RunStatus::Failed {
                std::process::exit(1);
            }
        }
        Commands::Enqueue {
            workflow,
            input,
            queue,
        } => {
            let graph = load_workflow(&workflow)?;
            let input = parse_input(input.as_deref())?;
            if matches!(config.store.backend, StoreBackend::Memory) {
                warn!("Enqueuing into the in-memory store; no other process will see this run");
            }
            let queue = queue
                .or_else(|| config.worker.queues.first().cloned())
                .ok_or_else(|| anyhow::anyhow!("no queue given and none configured"))?;

            let services = build_services(&config)?;
            let run = QueuedRun::new(graph, input);
            enqueue(services.queues.as_ref(), &queue, &run).await?;
            println!("Queued run {} on {}", run.run_id, queue);
        }
        Commands::Worker { worker_type } => {
            if let Some(worker_type) = worker_type {
                config.worker.worker_type = worker_type;
            }
            let services = build_services(&config)?;
            let monitor = Arc::new(WorkerMonitor::new(
                services.kv.clone(),
                services.queues.clone(),
                config.worker.clone(),
            ));
            let worker = QueueWorker::new(
                services.engine.clone(),
                services.queues.clone(),
                monitor,
                config.worker.clone(),
            );

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down worker...");
                cancel_clone.cancel();
            });

            worker.run(cancel).await;
        }
        Commands::Health => {
            let services = build_services(&config)?;
            let monitor = WorkerMonitor::new(services.kv, services.queues, config.worker.clone());
            let health = monitor.get_health_status().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::Circuits { action } => {
            let services = build_services(&config)?;
            match action {
                CircuitAction::List => {
                    let circuits = services.circuit.list().await;
                    if circuits.is_empty() {
                        println!("No circuits recorded.");
                    }
                    for c in circuits {
                        let recovery = c
                            .seconds_until_recovery
                            .map(|s| format!(", retry in {}s", s))
                            .unwrap_or_default();
                        println!(
                            "  {:<24} {:<9} {}/{} failures{}",
                            c.node_type,
                            c.state.to_string(),
                            c.consecutive_failures, c.threshold, recovery
                        );
                        if let Some(err) = c.last_error {
                            println!("  {:<24} last error: {}", "", err);
                        }
                    }
                }
                CircuitAction::Reset { node_type } => {
                    if services.circuit.reset(&node_type).await {
                        println!("Circuit for '{}' reset", node_type);
                    } else {
                        println!("No circuit recorded for '{}'", node_type);
                    }
                }
            }
        }
        Commands::Cache { action } => {
            let services = build_services(&config)?;
            match action {
                CacheAction::Stats => {
                    let entries = services
                        .kv
                        .scan_prefix("cache:node:")
                        .await
                        .map(|keys| keys.len())
                        .unwrap_or(0);
                    println!("  enabled:     {}", services.cache.is_enabled());
                    println!("  default ttl: {}s", config.cache.default_ttl_secs);
                    println!("  entries:     {}", entries);
                    let stats = services.cache.stats();
                    println!(
                        "  this process: {} hits, {} misses, {} writes, {} store errors ({:.2}% hit rate)",
                        stats.hits, stats.misses, stats.writes, stats.store_errors, stats.hit_rate
                    );
                }
                CacheAction::Flush { node_type } => {
                    let removed = match node_type {
                        Some(t) => services.cache.invalidate_node_type(&t).await,
                        None => services.cache.flush().await,
                    };
                    println!("Removed {} cached results", removed);
                }
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load config from the given path, then `~/.flowgate/config.toml`, else defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".flowgate").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    info!("No config file found, using defaults");
    Ok(AppConfig::default())
}

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowGraph> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
    Ok(WorkflowGraph::from_json(&content)?)
}

fn parse_input(raw: Option<&str>) -> anyhow::Result<Value> {
    match raw {
        Some(s) => Ok(serde_json::from_str(s)?),
        None => Ok(Value::Object(Default::default())),
    }
}

fn build_registry(config: &AppConfig) -> NodeRegistry {
    let mut registry = NodeRegistry::with_builtins();
    let report = registry.discover(&config.handler_dirs());
    if report.loaded > 0 || report.skipped > 0 {
        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            "Discovered handlers"
        );
    }
    registry
}

fn open_store(config: &AppConfig) -> anyhow::Result<(Arc<dyn KvStore>, Arc<dyn QueueStore>)> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            let kv: Arc<dyn KvStore> = store.clone();
            Ok((kv, store))
        }
        StoreBackend::Sqlite => {
            let store = Arc::new(SqliteStore::open(&config.store_path())?);
            let kv: Arc<dyn KvStore> = store.clone();
            Ok((kv, store))
        }
    }
}

fn build_services(config: &AppConfig) -> anyhow::Result<Services> {
    let (kv, queues) = open_store(config)?;
    let registry = Arc::new(build_registry(config));
    let circuit = Arc::new(CircuitBreaker::new(kv.clone(), config.circuit_breaker.clone()));
    let cache = Arc::new(ResultCache::new(kv.clone(), config.cache.clone()));
    let dispatcher = Arc::new(NodeDispatcher::new(
        registry,
        circuit.clone(),
        cache.clone(),
        Duration::from_secs(config.engine.default_timeout_secs),
    ));
    let events = Arc::new(EventBus::default());
    let engine = GraphEngine::new(
        dispatcher,
        Arc::new(StaticCredentials::from_config(&config.credentials)),
        &config.engine,
    )
    .with_events(events.clone());

    Ok(Services {
        kv,
        queues,
        circuit,
        cache,
        engine: Arc::new(engine),
        events,
    })
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
