//! Operational command line for a quotapool deployment: principal and
//! credit management, node administration, and one-shot resolves.
//!
//! State (ledger + node registry) is persisted as JSON between invocations;
//! production deployments put a transactional store behind the same traits.

use std::{env, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::Level;

use quotapool_api::HttpNodeTransport;
use quotapool_engine::{CostResolver, Pool, PoolConfig, QuoteError};
use quotapool_ledger::{LedgerSnapshot, MemoryStore};
use quotapool_types::{
    CostQuote, GrantSource, Node, Principal, PrincipalGroup, PrincipalId, ResourceRef, TimeoutClass, Variant,
};

#[derive(Parser)]
#[command(name = "quotapool", about = "Operate a pooled-credit resolver fleet", version)]
struct Cli {
    /// Path of the JSON state file.
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a principal, or update its display name.
    Register {
        #[arg(long)]
        principal: u64,
        #[arg(long)]
        name: String,
    },
    /// Show a principal's credit balance.
    Balance {
        #[arg(long)]
        principal: u64,
    },
    /// Issue a manual credit grant.
    Grant {
        #[arg(long)]
        principal: u64,
        #[arg(long)]
        amount: i64,
    },
    /// Daily check-in for a principal.
    Checkin {
        #[arg(long)]
        principal: u64,
    },
    /// Resolve a resource through the pool.
    Resolve {
        #[arg(long)]
        principal: u64,
        /// Resource as '<id>/<token>'.
        #[arg(long)]
        resource: ResourceRef,
        #[arg(long, default_value = "archive")]
        variant: Variant,
        /// Credit cost of the requested variant.
        #[arg(long, default_value_t = 0)]
        cost: i64,
        /// Treat this as long-running work (credit-capable nodes only).
        #[arg(long)]
        extended: bool,
    },
    /// Drop a resolved resource from the cache and its serving node.
    Destroy {
        #[arg(long)]
        resource: ResourceRef,
    },
    /// Node administration.
    #[command(subcommand)]
    Node(NodeCommand),
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Probe a node URL and add it to the registry.
    Add {
        #[arg(long)]
        url: String,
        #[arg(long)]
        operator: u64,
    },
    /// List registered nodes with health and capacity.
    List,
    /// Suppress a node from selection regardless of health.
    Disable {
        #[arg(long)]
        id: u64,
    },
    /// Re-admit a disabled node.
    Enable {
        #[arg(long)]
        id: u64,
    },
    /// Probe every non-disabled node once.
    Probe,
}

/// Everything the CLI persists between invocations.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CliState {
    ledger: LedgerSnapshot,
    nodes: Vec<Node>,
}

/// Cost resolver fed from the command line; the real metadata resolver is a
/// separate service.
struct FlatQuote {
    cost: i64,
    timeout_class: TimeoutClass,
}

#[async_trait]
impl CostResolver for FlatQuote {
    async fn quote(&self, _resource: &ResourceRef) -> Result<CostQuote, QuoteError> {
        let costs = [Variant::Archive, Variant::Resample].into_iter().map(|v| (v, self.cost)).collect();
        Ok(CostQuote {
            costs,
            timeout_class: self.timeout_class,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = PoolConfig::load();
    let state_path = resolve_state_path(&cli);
    let state = load_state(&state_path)?;

    let store = Arc::new(MemoryStore::from_snapshot(state.ledger));
    let transport = Arc::new(HttpNodeTransport::new(config.extended_dispatch_timeout()).context("build node transport")?);
    let costs: Arc<dyn CostResolver> = match &cli.command {
        Command::Resolve { cost, extended, .. } => Arc::new(FlatQuote {
            cost: *cost,
            timeout_class: if *extended { TimeoutClass::Extended } else { TimeoutClass::Standard },
        }),
        _ => Arc::new(FlatQuote {
            cost: 0,
            timeout_class: TimeoutClass::Standard,
        }),
    };
    let pool = Pool::new(config, store.clone(), transport, costs);
    for node in state.nodes {
        pool.registry().restore(node);
    }

    let outcome = run_command(&pool, &cli.command).await;
    save_state(&state_path, &store, &pool).await?;
    outcome
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .try_init();
}

async fn run_command(pool: &Pool, command: &Command) -> Result<()> {
    match command {
        Command::Register { principal, name } => {
            pool.register_principal(&Principal {
                id: PrincipalId(*principal),
                name: name.clone(),
                group: PrincipalGroup::Normal,
            })
            .await?;
            println!("registered principal {principal} ({name})");
        }
        Command::Balance { principal } => {
            let balance = pool.balance(PrincipalId(*principal)).await?;
            println!("{balance}");
        }
        Command::Grant { principal, amount } => {
            let (issued, balance) = pool.grant(PrincipalId(*principal), *amount, GrantSource::Manual).await?;
            println!("granted {issued}, balance {balance}");
        }
        Command::Checkin { principal } => {
            let receipt = pool.checkin(PrincipalId(*principal)).await?;
            if receipt.issued == 0 {
                println!("already checked in today, balance {}", receipt.balance);
            } else {
                println!("check-in issued {}, balance {}", receipt.issued, receipt.balance);
            }
        }
        Command::Resolve {
            principal,
            resource,
            variant,
            ..
        } => {
            let resolved = pool.resolve(PrincipalId(*principal), resource, *variant).await?;
            println!("{}", resolved.url);
            println!("served by node {} for {} credit", resolved.node, resolved.cost);
        }
        Command::Destroy { resource } => {
            if pool.destroy(resource).await {
                println!("destroyed {resource}");
            } else {
                println!("nothing cached for {resource} (or node did not acknowledge)");
            }
        }
        Command::Node(node_command) => run_node_command(pool, node_command).await?,
    }
    Ok(())
}

async fn run_node_command(pool: &Pool, command: &NodeCommand) -> Result<()> {
    match command {
        NodeCommand::Add { url, operator } => {
            let node = pool.tracker().register_node(url.clone(), PrincipalId(*operator)).await?;
            println!("node {} registered: {}", node.id, node.health);
        }
        NodeCommand::List => {
            let mut nodes = pool.registry().snapshot();
            nodes.sort_by_key(|node| node.id);
            for node in nodes {
                let balance = node
                    .credit_balance
                    .map_or_else(|| "unknown".to_string(), |balance| balance.to_string());
                let disabled = if node.disabled { " [disabled]" } else { "" };
                println!("{}  {}  {}  credit={}{}", node.id, node.url, node.health, balance, disabled);
            }
        }
        NodeCommand::Disable { id } => {
            pool.registry().set_disabled(quotapool_types::NodeId(*id), true)?;
            println!("node {id} disabled");
        }
        NodeCommand::Enable { id } => {
            pool.registry().set_disabled(quotapool_types::NodeId(*id), false)?;
            println!("node {id} enabled");
        }
        NodeCommand::Probe => {
            let summary = pool.tracker().refresh_all().await;
            println!(
                "probed {}: {} healthy, {} degraded, {} unreachable",
                summary.probed, summary.healthy, summary.degraded, summary.unreachable
            );
        }
    }
    Ok(())
}

fn resolve_state_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.state {
        return path.clone();
    }
    if let Ok(path) = env::var("QUOTAPOOL_STATE_PATH")
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quotapool")
        .join("state.json")
}

fn load_state(path: &PathBuf) -> Result<CliState> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).with_context(|| format!("parse state file {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CliState::default()),
        Err(err) => Err(err).with_context(|| format!("read state file {}", path.display())),
    }
}

async fn save_state(path: &PathBuf, store: &Arc<MemoryStore>, pool: &Pool) -> Result<()> {
    let mut nodes = pool.registry().snapshot();
    nodes.sort_by_key(|node| node.id);
    let state = CliState {
        ledger: store.export().await,
        nodes,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(&state)?;
    std::fs::write(path, content).with_context(|| format!("write state file {}", path.display()))?;
    Ok(())
}
