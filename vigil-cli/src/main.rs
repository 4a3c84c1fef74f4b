//! Vigil CLI - runs a cluster membership node

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vigil_core::{ClusterRuntime, Identity, MembershipListener, MembershipView};

use crate::config::{ConfigManager, Overrides};

/// Vigil cluster membership node
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level (or a full `RUST_LOG`-style filter)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the cluster and print membership changes until interrupted
    Start {
        #[command(flatten)]
        node: NodeArgs,

        /// Interval between status lines in seconds
        #[arg(long, default_value = "30")]
        status_interval: u64,
    },

    /// Print the effective configuration as TOML
    Config {
        #[command(flatten)]
        node: NodeArgs,
    },
}

#[derive(clap::Args)]
struct NodeArgs {
    /// Local node id
    #[arg(long)]
    node_id: Option<u32>,

    /// Gossip bind address
    #[arg(long)]
    bind: Option<String>,

    /// Address advertised to peers
    #[arg(long)]
    advertise: Option<String>,

    /// Seed peer (repeatable)
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Win every election this node takes part in
    #[arg(long)]
    preferred_leader: bool,
}

impl From<NodeArgs> for Overrides {
    fn from(args: NodeArgs) -> Self {
        Self {
            node_id: args.node_id,
            bind: args.bind,
            advertise: args.advertise,
            seeds: args.seeds,
            preferred_leader: args.preferred_leader,
        }
    }
}

/// Prints membership notifications to stdout.
struct PrintListener;

impl MembershipListener for PrintListener {
    fn on_view_change(&self, view: &MembershipView, leader: Identity) {
        println!(
            "view {} members={} leader={leader}",
            view.timestamp(),
            view.members()
        );
    }

    fn on_view_time_change(&self, view: &MembershipView) {
        println!("view time {} members={}", view.timestamp(), view.members());
    }
}

async fn start_node(manager: &ConfigManager, overrides: &Overrides, status_interval: u64) -> Result<()> {
    let config = manager.effective(overrides)?;
    let handle = ClusterRuntime::start(config)
        .await
        .context("failed to start cluster membership")?;
    handle.manager().add_listener(Arc::new(PrintListener));
    info!(
        node = %handle.manager().local(),
        addr = %handle.manager().local_addr(),
        "node running; press Ctrl-C to stop"
    );

    let mut status = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!("failed to listen for Ctrl-C: {err}");
                }
                break;
            }
            _ = status.tick() => {
                let stats = handle.manager().stats();
                let leader = handle
                    .manager()
                    .leader()
                    .map_or_else(|| "-".to_string(), |leader| leader.to_string());
                info!(
                    live = stats.live,
                    unreachable = stats.unreachable,
                    connections = stats.connections,
                    foreign_dropped = stats.foreign_dropped,
                    stale_dropped = stats.stale_dropped,
                    %leader,
                    "membership status"
                );
                for entry in handle.manager().registry_entries() {
                    debug!(peer = %entry.identity, addr = %entry.addr, status = ?entry.status, "registry entry");
                }
            }
        }
    }

    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level '{log_level}'"))?;
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let manager = ConfigManager::load(cli.config)?;

    match cli.command {
        Commands::Start {
            node,
            status_interval,
        } => {
            start_node(&manager, &Overrides::from(node), status_interval).await?;
        }
        Commands::Config { node } => {
            let effective = manager.effective(&Overrides::from(node))?;
            println!("# source: {}", manager.path().display());
            print!("{}", config::to_toml(&effective)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_node_flags() {
        let cli = Cli::try_parse_from([
            "vigil",
            "start",
            "--node-id",
            "7",
            "--seed",
            "10.0.0.1:7946",
            "--seed",
            "10.0.0.2:7946",
            "--preferred-leader",
        ])
        .unwrap();
        let Commands::Start { node, status_interval } = cli.command else {
            panic!("expected start");
        };
        assert_eq!(status_interval, 30);
        let overrides = Overrides::from(node);
        assert_eq!(overrides.node_id, Some(7));
        assert_eq!(overrides.seeds.len(), 2);
        assert!(overrides.preferred_leader);
    }
}
