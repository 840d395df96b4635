use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flow_test_orchestrator::{
    config::{Config, LogFormat},
    console::{AppState, ConsoleServer},
    graph::{NodeGraph, NodeLookup},
    runtime::AgentRuntimeClient,
    storage::{RunKind, RunStore, SqliteStorage},
};

#[derive(Parser)]
#[command(
    name = "flow-test-orchestrator",
    version,
    about = "Test, auto-test and repair orchestration for node-graph voice agents"
)]
struct Cli {
    /// Agent graph export (overrides AGENT_GRAPH_PATH)
    #[arg(long, global = true)]
    graph: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the JSON-RPC console on stdio (default)
    Serve,
    /// Show a node, by id or label, and where it can go next
    Graph {
        /// Node id or label; lists every node when omitted
        node: Option<String>,
    },
    /// List recorded runs, most recent first
    History {
        /// test_session, auto_test or repair
        #[arg(long)]
        kind: Option<RunKind>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(path) = cli.graph {
        config.graph.path = Some(path);
    }

    init_logging(&config);

    match cli.cmd.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Graph { node } => show_graph(&config, node.as_deref()),
        Command::History { kind, limit } => show_history(&config, kind, limit).await,
    }
}

fn load_graph(config: &Config) -> anyhow::Result<NodeGraph> {
    let path = config
        .graph
        .path
        .as_deref()
        .context("AGENT_GRAPH_PATH (or --graph) is required")?;
    let graph = NodeGraph::load(path)?;
    info!(path = %path.display(), nodes = graph.len(), "Graph loaded");
    Ok(graph)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Flow test orchestrator starting..."
    );

    let graph = load_graph(&config)?;

    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    let runtime = match AgentRuntimeClient::new(&config.runtime, config.request.clone()) {
        Ok(c) => {
            info!(
                base_url = %config.runtime.base_url,
                agent_id = %config.runtime.agent_id,
                "Agent runtime client initialized"
            );
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize agent runtime client");
            return Err(e.into());
        }
    };

    let state = Arc::new(AppState::new(
        config,
        Arc::new(graph),
        Arc::new(runtime),
        Arc::new(storage),
    ));
    let server = ConsoleServer::new(state);

    info!("Console ready, waiting for requests on stdin...");

    if let Err(e) = server.run().await {
        error!(error = %e, "Console error");
        return Err(e.into());
    }

    info!("Console shutdown complete");
    Ok(())
}

fn show_graph(config: &Config, node: Option<&str>) -> anyhow::Result<()> {
    let graph = load_graph(config)?;

    let Some(key) = node else {
        for node in graph.nodes() {
            println!("{}\t{}", node.id, node.display_label());
        }
        return Ok(());
    };

    match graph.find_by_id_or_label(key) {
        NodeLookup::ById(node) | NodeLookup::ByLabel(node) => {
            println!("{} ({})", node.display_label(), node.id);
            for edge in graph.edges_from(&node.id) {
                let condition = if edge.automatic {
                    "auto".to_string()
                } else {
                    edge.condition.unwrap_or_else(|| "-".to_string())
                };
                println!("  -> {} [{}]", graph.resolve_label(&edge.to), condition);
            }
            Ok(())
        }
        NodeLookup::Ambiguous(nodes) => {
            let ids: Vec<_> = nodes.iter().map(|n| n.id.as_str()).collect();
            anyhow::bail!("'{}' matches several nodes: {}", key, ids.join(", "))
        }
        NodeLookup::NotFound => anyhow::bail!("No node with id or label '{}'", key),
    }
}

async fn show_history(config: &Config, kind: Option<RunKind>, limit: u32) -> anyhow::Result<()> {
    let storage = SqliteStorage::new(&config.database).await?;
    for run in storage.list_runs(kind, limit).await? {
        println!("{}", serde_json::to_string(&run)?);
    }
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
