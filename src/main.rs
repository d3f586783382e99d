//! The `drover` binary: run a cluster node.
//!
//! `drover serve` boots a node from a TOML config (plus flag overrides) and
//! runs its monitor until interrupted. Workers need a task handler, which
//! only an embedding application can supply — a bare `drover` node hosts
//! the bus, the stores, and recovery, and optionally the merge pipeline.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use drover::git::MergeWorktree;
use drover::model::AgentId;
use drover::{Node, NodeConfig};

#[derive(Parser)]
#[command(name = "drover", version, about = "Distributed multi-agent task execution cluster")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a cluster node until interrupted.
    Serve(ServeArgs),
    /// Print the effective configuration and exit.
    Config(ConfigArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Path to a drover.toml config file.
    #[arg(short, long, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Agent id for this node (overrides the config file).
    #[arg(long)]
    agent_id: Option<String>,

    /// Human-readable node name.
    #[arg(long)]
    agent_name: Option<String>,

    /// Capability tag, repeatable.
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// Serve the embedded bus over TCP at this address.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Directory for durable bucket storage.
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Join an existing bus instead of hosting one.
    #[arg(long)]
    bus_url: Option<String>,

    /// Repository whose branches the monitor merges. Enables the merge
    /// pipeline.
    #[arg(long)]
    merge_repo: Option<PathBuf>,

    /// Branch merges land on.
    #[arg(long, default_value = "main")]
    working_branch: String,
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to a drover.toml config file.
    #[arg(short, long, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    drover::telemetry::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Config(args) => {
            let config = load_config(args.config.as_deref())?;
            println!("{config:#?}");
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(path).context("loading config"),
        None => Ok(NodeConfig::default()),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(id) = args.agent_id {
        config.agent_id = AgentId::new(&id)?;
    }
    if let Some(name) = args.agent_name {
        config.agent_name = name;
    }
    if !args.capabilities.is_empty() {
        config.capabilities = args.capabilities;
    }
    if args.listen.is_some() {
        config.listen_addr = args.listen;
    }
    if args.store_dir.is_some() {
        config.store_dir = args.store_dir;
    }
    if args.bus_url.is_some() {
        config.bus_url = args.bus_url;
    }

    let node = Node::start(config).await?;

    let worktree = match &args.merge_repo {
        Some(repo) => Some(
            MergeWorktree::create(
                repo,
                repo.join(".drover").join("merge-worktree"),
                &args.working_branch,
            )
            .await
            .context("creating merge worktree")?,
        ),
        None => None,
    };
    node.spawn_monitor(node.orchestrator(), worktree, None);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    node.stop().await;
    Ok(())
}
